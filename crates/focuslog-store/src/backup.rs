// ABOUTME: Snapshots of backend artifacts with manifests, integrity verification and retention pruning.
// ABOUTME: Recovery walks snapshots newest-first and restores the first one that verifies.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use focuslog_core::{BackendKind, Record, RecordCounts};
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::contract::{ManagedBackend, StorageError};
use crate::file_store::is_record_file;
use crate::fsutil;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const FORMAT_VERSION: u32 = 1;
const STAGING_SUFFIX: &str = ".partial";

/// Errors that can occur while taking, verifying or restoring snapshots.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("no snapshots available for the {0} backend")]
    NoSnapshots(BackendKind),

    #[error("snapshot {id} failed verification: {reason}")]
    IntegrityCheckFailed { id: String, reason: String },

    #[error("recovery exhausted: all {attempted} snapshot(s) failed verification")]
    RecoveryExhausted { attempted: usize },

    #[error("snapshot belongs to the {found} backend, not {expected}")]
    BackendMismatch {
        expected: BackendKind,
        found: BackendKind,
    },
}

/// How many snapshots to keep and for how long. The newest snapshot is
/// always kept regardless of age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_snapshots: usize,
    pub max_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_snapshots: 5,
            max_age: Duration::days(30),
        }
    }
}

/// `manifest.json` inside every snapshot directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub format_version: u32,
    pub backend: BackendKind,
    pub created_at: DateTime<Utc>,
    pub reason: String,
    pub files: Vec<String>,
    pub counts: RecordCounts,
}

/// A snapshot directory and its manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotInfo {
    pub id: String,
    pub path: PathBuf,
    pub manifest: SnapshotManifest,
}

pub struct BackupManager {
    root: PathBuf,
    retention: RetentionPolicy,
}

impl BackupManager {
    /// Use `root` as the snapshot directory, creating it and discarding any
    /// half-built snapshot left by a crash.
    pub fn new(root: impl Into<PathBuf>, retention: RetentionPolicy) -> Result<Self, BackupError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(STAGING_SUFFIX) {
                tracing::warn!("discarding incomplete snapshot {}", entry.path().display());
                fs::remove_dir_all(entry.path())?;
            }
        }
        Ok(Self { root, retention })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy `backend`'s artifacts into a new snapshot directory. The
    /// directory only appears under its final name once complete.
    pub async fn snapshot(
        &self,
        backend: &dyn ManagedBackend,
        reason: &str,
    ) -> Result<SnapshotInfo, BackupError> {
        backend.checkpoint().await?;

        let kind = backend.identity();
        let created_at = Utc::now();
        let id = format!(
            "{}_{}_{}",
            kind.as_str(),
            created_at.format("%Y%m%dT%H%M%S%.3fZ"),
            Ulid::new().to_string().to_ascii_lowercase()
        );
        let staging = self.root.join(format!(".{}{}", id, STAGING_SUFFIX));
        let final_path = self.root.join(&id);

        let built = self
            .build_snapshot(backend, &staging, kind, created_at, reason)
            .await;
        let manifest = match built {
            Ok(manifest) => manifest,
            Err(err) => {
                if let Err(cleanup) = fs::remove_dir_all(&staging) {
                    tracing::warn!("could not remove {}: {}", staging.display(), cleanup);
                }
                return Err(err);
            }
        };
        fs::rename(&staging, &final_path)?;
        fsutil::sync_dir(&self.root);

        tracing::info!(
            snapshot = %id,
            backend = %kind,
            records = manifest.counts.total(),
            "snapshot created ({})",
            reason
        );

        if let Err(err) = self.prune() {
            tracing::warn!("snapshot pruning failed: {}", err);
        }

        Ok(SnapshotInfo {
            id,
            path: final_path,
            manifest,
        })
    }

    async fn build_snapshot(
        &self,
        backend: &dyn ManagedBackend,
        staging: &Path,
        kind: BackendKind,
        created_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<SnapshotManifest, BackupError> {
        fs::create_dir_all(staging)?;
        let export = backend.export_artifacts(staging).await?;
        let manifest = SnapshotManifest {
            format_version: FORMAT_VERSION,
            backend: kind,
            created_at,
            reason: reason.to_string(),
            files: export.files,
            counts: export.counts,
        };
        fsutil::write_atomic(staging, MANIFEST_FILE, &serde_json::to_vec_pretty(&manifest)?)?;
        Ok(manifest)
    }

    /// All readable snapshots, newest first.
    pub fn list(&self) -> Result<Vec<SnapshotInfo>, BackupError> {
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let id = entry.file_name().to_string_lossy().to_string();
            if id.starts_with('.') || !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path();
            match read_manifest(&path) {
                Ok(manifest) => snapshots.push(SnapshotInfo { id, path, manifest }),
                Err(err) => tracing::warn!("ignoring snapshot {} without a usable manifest: {}", id, err),
            }
        }
        snapshots.sort_by(|a, b| {
            b.manifest
                .created_at
                .cmp(&a.manifest.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(snapshots)
    }

    /// Snapshots of one backend, newest first.
    pub fn list_for(&self, kind: BackendKind) -> Result<Vec<SnapshotInfo>, BackupError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|s| s.manifest.backend == kind)
            .collect())
    }

    /// Delete snapshots beyond the retention policy. Returns the removed ids.
    pub fn prune(&self) -> Result<Vec<String>, BackupError> {
        // An age limit reaching past the earliest representable time never expires anything.
        let cutoff = Utc::now().checked_sub_signed(self.retention.max_age);
        let mut removed = Vec::new();
        for (position, snapshot) in self.list()?.into_iter().enumerate() {
            let keep = position == 0
                || (position < self.retention.max_snapshots
                    && cutoff.is_none_or(|cutoff| snapshot.manifest.created_at >= cutoff));
            if !keep {
                fs::remove_dir_all(&snapshot.path)?;
                tracing::debug!(snapshot = %snapshot.id, "pruned snapshot");
                removed.push(snapshot.id);
            }
        }
        Ok(removed)
    }

    /// Structural integrity check of a snapshot against its manifest.
    pub fn verify(&self, snapshot: &SnapshotInfo) -> Result<(), BackupError> {
        let fail = |reason: String| BackupError::IntegrityCheckFailed {
            id: snapshot.id.clone(),
            reason,
        };

        let manifest = &snapshot.manifest;
        if manifest.format_version != FORMAT_VERSION {
            return Err(fail(format!(
                "unsupported format version {}",
                manifest.format_version
            )));
        }
        for name in &manifest.files {
            if !snapshot.path.join(name).is_file() {
                return Err(fail(format!("listed file {} is missing", name)));
            }
        }

        let counts = match manifest.backend {
            BackendKind::FileStore => count_record_files(&snapshot.path, &manifest.files),
            BackendKind::Relational => count_database_rows(&snapshot.path, &manifest.files),
            BackendKind::Hybrid => Err("snapshot claims the hybrid backend".to_string()),
        }
        .map_err(fail)?;

        if counts != manifest.counts {
            return Err(fail(format!(
                "holds {} activation(s) and {} switch(es), manifest lists {} and {}",
                counts.activations,
                counts.switches,
                manifest.counts.activations,
                manifest.counts.switches
            )));
        }
        Ok(())
    }

    /// Restore `backend` from the newest snapshot of its kind that verifies.
    pub async fn recover(&self, backend: &dyn ManagedBackend) -> Result<SnapshotInfo, BackupError> {
        let kind = backend.identity();
        let candidates = self.list_for(kind)?;
        if candidates.is_empty() {
            return Err(BackupError::NoSnapshots(kind));
        }

        let attempted = candidates.len();
        for snapshot in candidates {
            match self.verify(&snapshot) {
                Ok(()) => {
                    backend.replace_artifacts(&snapshot.path).await?;
                    tracing::info!(snapshot = %snapshot.id, backend = %kind, "recovered from snapshot");
                    return Ok(snapshot);
                }
                Err(err) => tracing::warn!("skipping snapshot: {}", err),
            }
        }
        tracing::error!(attempted, backend = %kind, "no snapshot passed verification");
        Err(BackupError::RecoveryExhausted { attempted })
    }

    /// Restore a specific snapshot, falling back to [`BackupManager::recover`]
    /// if it does not verify.
    pub async fn restore(
        &self,
        snapshot: &SnapshotInfo,
        backend: &dyn ManagedBackend,
    ) -> Result<SnapshotInfo, BackupError> {
        if snapshot.manifest.backend != backend.identity() {
            return Err(BackupError::BackendMismatch {
                expected: backend.identity(),
                found: snapshot.manifest.backend,
            });
        }
        match self.verify(snapshot) {
            Ok(()) => {
                backend.replace_artifacts(&snapshot.path).await?;
                tracing::info!(snapshot = %snapshot.id, "restored snapshot");
                Ok(snapshot.clone())
            }
            Err(err) => {
                tracing::warn!("requested snapshot unusable, falling back: {}", err);
                self.recover(backend).await
            }
        }
    }
}

fn read_manifest(dir: &Path) -> Result<SnapshotManifest, BackupError> {
    let bytes = fs::read(dir.join(MANIFEST_FILE))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Count distinct valid records among the listed JSON files.
fn count_record_files(dir: &Path, files: &[String]) -> Result<RecordCounts, String> {
    let now = Utc::now();
    let mut seen = HashSet::new();
    let mut counts = RecordCounts::default();
    for name in files.iter().filter(|name| is_record_file(name)) {
        let bytes = fs::read(dir.join(name)).map_err(|err| format!("{}: {}", name, err))?;
        if let Ok(record) = serde_json::from_slice::<Record>(&bytes)
            && record.validate(now).is_ok()
            && seen.insert(record.id())
        {
            counts.add(record.kind());
        }
    }
    Ok(counts)
}

/// Run SQLite's integrity check on the snapshot database and count rows.
fn count_database_rows(dir: &Path, files: &[String]) -> Result<RecordCounts, String> {
    let db_name = files
        .iter()
        .find(|name| !name.ends_with("-wal") && !name.ends_with("-shm"))
        .ok_or_else(|| "no database file listed".to_string())?;
    let conn = Connection::open_with_flags(dir.join(db_name), OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|err| err.to_string())?;

    let verdict: String = conn
        .query_row("PRAGMA integrity_check", [], |row| row.get(0))
        .map_err(|err| err.to_string())?;
    if verdict != "ok" {
        return Err(format!("integrity_check reported {}", verdict));
    }

    let count = |table: &str| -> Result<usize, String> {
        let n: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .map_err(|err| err.to_string())?;
        Ok(usize::try_from(n).unwrap_or(0))
    };
    Ok(RecordCounts {
        activations: count("events")?,
        switches: count("switches")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::StorageBackend;
    use crate::disk::FixedSpaceProbe;
    use crate::file_store::{FileStore, FileStoreOptions};
    use crate::sqlite_store::SqliteStore;
    use focuslog_core::{ActivationEvent, Category, ContextSwitch};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn file_store(dir: &Path) -> FileStore {
        FileStore::open(
            dir,
            FileStoreOptions {
                probe: Arc::new(FixedSpaceProbe(None)),
                ..FileStoreOptions::default()
            },
        )
        .unwrap()
    }

    async fn seed(backend: &dyn ManagedBackend, n: usize) {
        for i in 0..n {
            backend
                .append(ActivationEvent::new(format!("App{}", i), Category::Utilities).into())
                .await
                .unwrap();
        }
        backend
            .append(ContextSwitch::new("App0", "App1", 30.0).into())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn snapshot_writes_manifest_and_verifies() {
        let home = TempDir::new().unwrap();
        let store = file_store(&home.path().join("records"));
        seed(&store, 3).await;

        let backups = BackupManager::new(home.path().join("backups"), RetentionPolicy::default()).unwrap();
        let snapshot = backups.snapshot(&store, "manual").await.unwrap();

        assert!(snapshot.id.starts_with("file_store_"));
        assert_eq!(snapshot.manifest.counts.activations, 3);
        assert_eq!(snapshot.manifest.counts.switches, 1);
        assert_eq!(snapshot.manifest.files.len(), 4);
        assert!(snapshot.path.join(MANIFEST_FILE).exists());
        backups.verify(&snapshot).unwrap();
    }

    #[tokio::test]
    async fn database_snapshot_verifies() {
        let home = TempDir::new().unwrap();
        let store = SqliteStore::open(home.path().join("focuslog.db")).unwrap();
        seed(&store, 2).await;

        let backups = BackupManager::new(home.path().join("backups"), RetentionPolicy::default()).unwrap();
        let snapshot = backups.snapshot(&store, "manual").await.unwrap();
        assert!(snapshot.id.starts_with("relational_"));
        backups.verify(&snapshot).unwrap();
    }

    #[tokio::test]
    async fn tampered_snapshot_fails_verification() {
        let home = TempDir::new().unwrap();
        let store = file_store(&home.path().join("records"));
        seed(&store, 2).await;
        let backups = BackupManager::new(home.path().join("backups"), RetentionPolicy::default()).unwrap();
        let snapshot = backups.snapshot(&store, "manual").await.unwrap();

        fs::remove_file(snapshot.path.join(&snapshot.manifest.files[0])).unwrap();
        assert!(matches!(
            backups.verify(&snapshot),
            Err(BackupError::IntegrityCheckFailed { .. })
        ));
    }

    #[tokio::test]
    async fn retention_keeps_newest_snapshots() {
        let home = TempDir::new().unwrap();
        let store = file_store(&home.path().join("records"));
        seed(&store, 1).await;
        let backups = BackupManager::new(
            home.path().join("backups"),
            RetentionPolicy {
                max_snapshots: 3,
                max_age: Duration::days(30),
            },
        )
        .unwrap();

        let mut created = Vec::new();
        for i in 0..5 {
            created.push(backups.snapshot(&store, &format!("run {}", i)).await.unwrap().id);
        }

        let kept: Vec<String> = backups.list().unwrap().into_iter().map(|s| s.id).collect();
        let expected: Vec<String> = created.iter().rev().take(3).cloned().collect();
        assert_eq!(kept, expected);
    }

    #[tokio::test]
    async fn old_snapshots_expire_but_newest_survives() {
        let home = TempDir::new().unwrap();
        let store = file_store(&home.path().join("records"));
        seed(&store, 1).await;
        let backups = BackupManager::new(home.path().join("backups"), RetentionPolicy::default()).unwrap();
        let snapshot = backups.snapshot(&store, "old").await.unwrap();

        let mut manifest = snapshot.manifest.clone();
        manifest.created_at = Utc::now() - Duration::days(45);
        fs::write(
            snapshot.path.join(MANIFEST_FILE),
            serde_json::to_vec(&manifest).unwrap(),
        )
        .unwrap();

        assert!(backups.prune().unwrap().is_empty());

        backups.snapshot(&store, "fresh").await.unwrap();
        let ids: Vec<String> = backups.list().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids.len(), 1);
        assert_ne!(ids[0], snapshot.id);
    }

    #[tokio::test]
    async fn unbounded_age_limit_prunes_by_count_only() {
        let home = TempDir::new().unwrap();
        let store = file_store(&home.path().join("records"));
        seed(&store, 1).await;
        let backups = BackupManager::new(
            home.path().join("backups"),
            RetentionPolicy {
                max_snapshots: 2,
                max_age: Duration::MAX,
            },
        )
        .unwrap();

        for i in 0..3 {
            backups.snapshot(&store, &format!("run {}", i)).await.unwrap();
        }
        assert_eq!(backups.list().unwrap().len(), 2);
        assert!(backups.prune().unwrap().is_empty());
    }

    #[tokio::test]
    async fn recover_skips_corrupt_snapshots() {
        let home = TempDir::new().unwrap();
        let store = file_store(&home.path().join("records"));
        seed(&store, 2).await;
        let backups = BackupManager::new(home.path().join("backups"), RetentionPolicy::default()).unwrap();

        let good = backups.snapshot(&store, "good").await.unwrap();
        store
            .append(ActivationEvent::new("Later", Category::Social).into())
            .await
            .unwrap();
        let bad = backups.snapshot(&store, "bad").await.unwrap();
        fs::write(bad.path.join(&bad.manifest.files[0]), b"{ truncated").unwrap();

        store.clear().await.unwrap();
        let recovered = backups.recover(&store).await.unwrap();
        assert_eq!(recovered.id, good.id);
        assert_eq!(store.counts().await.unwrap(), good.manifest.counts);
    }

    #[tokio::test]
    async fn recover_without_usable_snapshots_is_exhausted() {
        let home = TempDir::new().unwrap();
        let store = file_store(&home.path().join("records"));
        seed(&store, 1).await;
        let backups = BackupManager::new(home.path().join("backups"), RetentionPolicy::default()).unwrap();

        assert!(matches!(
            backups.recover(&store).await,
            Err(BackupError::NoSnapshots(BackendKind::FileStore))
        ));

        let only = backups.snapshot(&store, "only").await.unwrap();
        fs::remove_file(only.path.join(&only.manifest.files[0])).unwrap();
        assert!(matches!(
            backups.recover(&store).await,
            Err(BackupError::RecoveryExhausted { attempted: 1 })
        ));
    }

    #[test]
    fn staging_leftovers_are_discarded() {
        let home = TempDir::new().unwrap();
        let root = home.path().join("backups");
        fs::create_dir_all(root.join(".file_store_x.partial")).unwrap();
        let backups = BackupManager::new(&root, RetentionPolicy::default()).unwrap();
        assert!(!root.join(".file_store_x.partial").exists());
        assert!(backups.list().unwrap().is_empty());
    }
}
