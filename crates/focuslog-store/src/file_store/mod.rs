// ABOUTME: File-per-record backend: each record is one JSON document written atomically into a directory.
// ABOUTME: All disk I/O runs on one worker thread; an in-memory index serves queries after a progressive load.

mod index;
mod loader;
mod naming;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use focuslog_core::{
    BackendKind, Record, RecordCounts, RecordQuery, TimeRange, UsageStat, ValidationIssue,
    aggregate_usage,
};
use tokio::sync::watch;
use ulid::Ulid;

use crate::contract::{
    ArtifactExport, BatchManifest, LoadPhase, LoadProgress, ManagedBackend, ScanResult,
    StorageBackend, StorageError,
};
use crate::disk::{self, SpaceProbe, SystemSpaceProbe};
use crate::fsutil;
use crate::worker::Worker;

use index::RecordIndex;
use loader::{BatchOutcome, ListedFile, Listing, LoadSettings};

pub(crate) use naming::is_record_file;

type SharedIndex = Arc<RwLock<RecordIndex>>;

fn read_index(index: &SharedIndex) -> RwLockReadGuard<'_, RecordIndex> {
    match index.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_index(index: &SharedIndex) -> RwLockWriteGuard<'_, RecordIndex> {
    match index.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Tuning for a [`FileStore`].
#[derive(Debug, Clone)]
pub struct FileStoreOptions {
    /// Files per batch once the recent window is loaded.
    pub load_batch_size: usize,
    /// Records newer than this are loaded before anything else.
    pub recent_window: Duration,
    /// Free space that must remain after a write.
    pub min_free_bytes: u64,
    pub probe: Arc<dyn SpaceProbe>,
}

impl Default for FileStoreOptions {
    fn default() -> Self {
        Self {
            load_batch_size: 10,
            recent_window: Duration::hours(2),
            min_free_bytes: 64 * 1024 * 1024,
            probe: Arc::new(SystemSpaceProbe::new()),
        }
    }
}

/// State owned by the file store's worker thread.
pub(crate) struct FileState {
    dir: PathBuf,
    index: SharedIndex,
    paths: HashMap<Ulid, PathBuf>,
    probe: Arc<dyn SpaceProbe>,
    reserve_bytes: u64,
    /// Bumped whenever the directory contents are replaced wholesale, so an
    /// in-flight load from the old contents stops contributing.
    generation: u64,
    /// Ids whose current state was set by an append or remove in this
    /// generation. Files the loader finds for them are stale copies.
    settled: HashSet<Ulid>,
    load_seen: HashSet<Ulid>,
    load_issues: Vec<ValidationIssue>,
}

impl FileState {
    fn open(
        dir: PathBuf,
        index: SharedIndex,
        probe: Arc<dyn SpaceProbe>,
        reserve_bytes: u64,
    ) -> Result<Self, StorageError> {
        fs::create_dir_all(&dir)?;
        let stale = fsutil::remove_stale_temp_files(&dir)?;
        if stale > 0 {
            tracing::warn!(stale, "removed interrupted writes from {}", dir.display());
        }
        Ok(Self {
            dir,
            index,
            paths: HashMap::new(),
            probe,
            reserve_bytes,
            generation: 0,
            settled: HashSet::new(),
            load_seen: HashSet::new(),
            load_issues: Vec::new(),
        })
    }

    fn reset(&mut self) {
        self.generation += 1;
        self.paths.clear();
        self.settled.clear();
        self.load_seen.clear();
        self.load_issues.clear();
        write_index(&self.index).clear();
    }

    fn write_record(&mut self, record: Record) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(&record)?;
        disk::ensure_space(
            self.probe.as_ref(),
            &self.dir,
            bytes.len() as u64,
            self.reserve_bytes,
        )?;

        let name = naming::file_name_for(&record);
        let path = fsutil::write_atomic(&self.dir, &name, &bytes)?;

        let id = record.id();
        self.settled.insert(id);
        if let Some(old) = self.paths.insert(id, path.clone())
            && old != path
        {
            if let Err(err) = fsutil::remove_if_present(&old) {
                tracing::warn!("could not remove superseded {}: {}", old.display(), err);
            }
        }
        write_index(&self.index).upsert(record);
        Ok(())
    }

    fn write_batch(&mut self, records: Vec<Record>, now: DateTime<Utc>) -> BatchManifest {
        let mut manifest = BatchManifest::default();
        for record in records {
            let id = record.id();
            let record = record.normalized();
            if let Err(issue) = record.validate(now) {
                manifest.record_failure(id, issue.to_string());
                continue;
            }
            match self.write_record(record) {
                Ok(()) => manifest.record_success(id),
                Err(err) => manifest.record_failure(id, err.to_string()),
            }
        }
        manifest
    }

    fn remove_record(&mut self, id: Ulid) -> Result<bool, StorageError> {
        let Some(path) = self.paths.get(&id).cloned() else {
            return Ok(false);
        };
        fsutil::remove_if_present(&path)?;
        fsutil::sync_dir(&self.dir);
        self.paths.remove(&id);
        self.settled.insert(id);
        write_index(&self.index).remove(id);
        Ok(true)
    }

    fn record_file_names(&self) -> Result<Vec<String>, StorageError> {
        Ok(fsutil::list_files(&self.dir, naming::is_record_file)?)
    }

    fn list_record_files(&self) -> Result<Listing, StorageError> {
        let files = self
            .record_file_names()?
            .into_iter()
            .map(|name| ListedFile {
                timestamp: naming::parse_file_name(&name).map(|p| p.timestamp),
                path: self.dir.join(name),
            })
            .collect();
        Ok(Listing {
            generation: self.generation,
            files,
        })
    }

    /// Parse and validate one file. `Ok(None)` means the file vanished.
    fn read_record(path: &Path, now: DateTime<Utc>) -> Result<Option<Record>, ValidationIssue> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(ValidationIssue::corrupted(
                    format!("unreadable file {}: {}", path.display(), err),
                    None,
                ));
            }
        };
        let record: Record = serde_json::from_slice(&bytes).map_err(|err| {
            ValidationIssue::corrupted(format!("malformed file {}: {}", path.display(), err), None)
        })?;
        record.validate(now)?;
        Ok(Some(record.normalized()))
    }

    fn load_batch(
        &mut self,
        generation: u64,
        files: Vec<PathBuf>,
        now: DateTime<Utc>,
    ) -> Option<BatchOutcome> {
        if generation != self.generation {
            return None;
        }

        let mut outcome = BatchOutcome::default();
        for path in files {
            let record = match Self::read_record(&path, now) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(issue) => {
                    tracing::warn!("skipping {}: {}", path.display(), issue);
                    self.load_issues.push(issue);
                    outcome.skipped += 1;
                    continue;
                }
            };

            let id = record.id();
            if self.settled.contains(&id) {
                // Written or removed while the load ran; any other file for
                // this id is the older copy.
                if self.paths.get(&id) != Some(&path) {
                    if let Err(err) = fsutil::remove_if_present(&path) {
                        tracing::warn!("could not remove superseded {}: {}", path.display(), err);
                    }
                }
                continue;
            }
            if !self.load_seen.insert(id) {
                let issue = ValidationIssue::duplicate(
                    format!("record stored twice; ignoring {}", path.display()),
                    Some(id),
                );
                tracing::warn!("{}", issue);
                self.load_issues.push(issue);
                outcome.skipped += 1;
                continue;
            }

            write_index(&self.index).insert_if_absent(record);
            self.paths.insert(id, path);
            outcome.loaded += 1;
        }
        Some(outcome)
    }

    fn remove_record_files(&self) -> Result<(), StorageError> {
        for name in self.record_file_names()? {
            fsutil::remove_if_present(&self.dir.join(name))?;
        }
        fsutil::sync_dir(&self.dir);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        self.remove_record_files()?;
        self.reset();
        Ok(())
    }

    fn export(&self, dest: &Path) -> Result<ArtifactExport, StorageError> {
        let files = self.record_file_names()?;
        fsutil::copy_files(&self.dir, dest, &files)?;
        let counts = read_index(&self.index).counts();
        Ok(ArtifactExport { files, counts })
    }

    fn replace_from(&mut self, src: &Path) -> Result<(), StorageError> {
        let incoming = fsutil::list_files(src, naming::is_record_file)?;
        self.remove_record_files()?;
        fsutil::copy_files(src, &self.dir, &incoming)?;
        self.reset();
        tracing::info!(files = incoming.len(), "replaced record files from {}", src.display());
        Ok(())
    }

    fn archive_to(&mut self, dest: &Path) -> Result<(), StorageError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&self.dir, dest)?;
        fs::create_dir_all(&self.dir)?;
        if let Some(parent) = self.dir.parent() {
            fsutil::sync_dir(parent);
        }
        self.reset();
        tracing::info!("archived record files to {}", dest.display());
        Ok(())
    }
}

/// Backend that keeps each record in its own JSON file.
pub struct FileStore {
    dir: PathBuf,
    worker: Arc<Worker<FileState>>,
    index: SharedIndex,
    settings: LoadSettings,
    loader: Mutex<Option<LoadProgress>>,
}

impl FileStore {
    /// Open (creating if needed) the record directory. Loading starts on the
    /// first call that needs it, or explicitly via [`FileStore::ensure_loaded`].
    pub fn open(dir: impl Into<PathBuf>, options: FileStoreOptions) -> Result<Self, StorageError> {
        let dir = dir.into();
        let index: SharedIndex = Arc::new(RwLock::new(RecordIndex::default()));

        let state_dir = dir.clone();
        let state_index = index.clone();
        let probe = options.probe.clone();
        let reserve = options.min_free_bytes;
        let worker = Worker::spawn("focuslog-files", move || {
            FileState::open(state_dir, state_index, probe, reserve)
        })?;

        tracing::info!("file store opened at {}", dir.display());
        Ok(Self {
            dir,
            worker: Arc::new(worker),
            index,
            settings: LoadSettings {
                batch_size: options.load_batch_size,
                recent_window: options.recent_window,
            },
            loader: Mutex::new(None),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Start the progressive load if it is not running yet. Idempotent.
    pub fn ensure_loaded(&self) -> LoadProgress {
        let mut slot = match self.loader.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(progress) = slot.as_ref() {
            return progress.clone();
        }

        let (tx, rx) = watch::channel(LoadPhase::Pending);
        let progress = LoadProgress::new(rx);
        *slot = Some(progress.clone());
        tokio::spawn(loader::run(self.worker.clone(), self.settings, tx));
        progress
    }

    fn restart_load(&self) -> LoadProgress {
        {
            let mut slot = match self.loader.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *slot = None;
        }
        self.ensure_loaded()
    }

    async fn loaded(&self) -> Result<(), StorageError> {
        self.ensure_loaded().complete().await.map(|_| ())
    }
}

#[async_trait]
impl StorageBackend for FileStore {
    async fn append(&self, record: Record) -> Result<(), StorageError> {
        let record = record.normalized();
        record
            .validate(Utc::now())
            .map_err(StorageError::Validation)?;
        self.worker
            .run(move |state| state.write_record(record))
            .await?
    }

    async fn append_batch(&self, records: Vec<Record>) -> Result<BatchManifest, StorageError> {
        let now = Utc::now();
        let manifest = self
            .worker
            .run(move |state| state.write_batch(records, now))
            .await?;
        if !manifest.is_complete() {
            tracing::warn!(
                failed = manifest.failed.len(),
                succeeded = manifest.succeeded.len(),
                "batch append partially failed"
            );
        }
        Ok(manifest)
    }

    async fn query(&self, query: RecordQuery) -> Result<Vec<Record>, StorageError> {
        self.loaded().await?;
        Ok(read_index(&self.index).query(&query))
    }

    async fn usage_aggregate(&self, range: TimeRange) -> Result<Vec<UsageStat>, StorageError> {
        self.loaded().await?;
        Ok(aggregate_usage(read_index(&self.index).in_range(range)))
    }

    fn identity(&self) -> BackendKind {
        BackendKind::FileStore
    }
}

#[async_trait]
impl ManagedBackend for FileStore {
    async fn get(&self, id: Ulid) -> Result<Option<Record>, StorageError> {
        self.loaded().await?;
        Ok(read_index(&self.index).get(id).cloned())
    }

    async fn remove(&self, id: Ulid) -> Result<bool, StorageError> {
        self.loaded().await?;
        self.worker.run(move |state| state.remove_record(id)).await?
    }

    async fn counts(&self) -> Result<RecordCounts, StorageError> {
        self.loaded().await?;
        Ok(read_index(&self.index).counts())
    }

    async fn scan(&self) -> Result<ScanResult, StorageError> {
        self.loaded().await?;
        self.worker
            .run(|state| ScanResult {
                records: read_index(&state.index).records(),
                issues: state.load_issues.clone(),
            })
            .await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.worker.run(|state| state.clear()).await??;
        self.restart_load();
        Ok(())
    }

    async fn checkpoint(&self) -> Result<(), StorageError> {
        self.worker
            .run(|state| fsutil::sync_dir(&state.dir))
            .await
    }

    async fn export_artifacts(&self, dest: &Path) -> Result<ArtifactExport, StorageError> {
        self.loaded().await?;
        let dest = dest.to_path_buf();
        self.worker.run(move |state| state.export(&dest)).await?
    }

    async fn replace_artifacts(&self, src: &Path) -> Result<(), StorageError> {
        let src = src.to_path_buf();
        self.worker
            .run(move |state| state.replace_from(&src))
            .await??;
        self.restart_load().complete().await?;
        Ok(())
    }

    async fn archive_artifacts(&self, dest: &Path) -> Result<(), StorageError> {
        let dest = dest.to_path_buf();
        self.worker.run(move |state| state.archive_to(&dest)).await??;
        self.restart_load();
        Ok(())
    }

    fn load_progress(&self) -> LoadProgress {
        self.ensure_loaded()
    }
}
