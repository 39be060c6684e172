// ABOUTME: The storage contract every backend satisfies, plus the maintenance surface used internally.
// ABOUTME: Defines StorageError, per-record batch manifests, scan results and progressive-load signals.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use focuslog_core::{
    BackendKind, Record, RecordCounts, RecordQuery, TimeRange, UsageStat, ValidationIssue,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use ulid::Ulid;

/// Errors that can occur inside a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("record rejected: {0}")]
    Validation(ValidationIssue),

    #[error("insufficient disk space: need {required} bytes, {available} available")]
    InsufficientDiskSpace { required: u64, available: u64 },

    #[error("corrupted artifact {}: {reason}", path.display())]
    CorruptedArtifact { path: PathBuf, reason: String },

    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("record load failed; see logs")]
    LoadFailed,

    #[error("backend worker has stopped")]
    WorkerClosed,

    #[error("backend is closed")]
    Closed,
}

impl StorageError {
    /// Whether the error describes bad data rather than a failing backend.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            StorageError::Validation(_) | StorageError::CorruptedArtifact { .. }
        )
    }
}

/// One record that a batch append could not store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub record_id: Ulid,
    pub reason: String,
}

/// Per-record outcome of a batch append.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchManifest {
    pub succeeded: Vec<Ulid>,
    pub failed: Vec<BatchFailure>,
}

impl BatchManifest {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn record_success(&mut self, id: Ulid) {
        self.succeeded.push(id);
    }

    pub fn record_failure(&mut self, id: Ulid, reason: impl Into<String>) {
        self.failed.push(BatchFailure {
            record_id: id,
            reason: reason.into(),
        });
    }
}

/// The full record set of a backend together with the integrity problems
/// found while reading it.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub records: Vec<Record>,
    pub issues: Vec<ValidationIssue>,
}

/// What a backend copied when exporting its artifacts.
#[derive(Debug, Clone, Default)]
pub struct ArtifactExport {
    pub files: Vec<String>,
    pub counts: RecordCounts,
}

/// Where a backend's progressive load currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum LoadPhase {
    Pending,
    InitialReady {
        initial: usize,
    },
    Complete {
        initial: usize,
        loaded: usize,
        skipped: usize,
    },
    Failed,
}

impl LoadPhase {
    /// Number of records available after the initial pass, once known.
    pub fn initial(&self) -> Option<usize> {
        match self {
            LoadPhase::InitialReady { initial } | LoadPhase::Complete { initial, .. } => {
                Some(*initial)
            }
            _ => None,
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, LoadPhase::Complete { .. } | LoadPhase::Failed)
    }

    pub fn skipped(&self) -> usize {
        match self {
            LoadPhase::Complete { skipped, .. } => *skipped,
            _ => 0,
        }
    }
}

/// Awaitable view of a progressive load. Cloning is cheap; every clone sees
/// the same phases.
#[derive(Debug, Clone)]
pub struct LoadProgress {
    rx: watch::Receiver<LoadPhase>,
}

impl LoadProgress {
    pub(crate) fn new(rx: watch::Receiver<LoadPhase>) -> Self {
        Self { rx }
    }

    /// A progress handle that is already complete, for backends that need no
    /// warm-up.
    pub(crate) fn completed(loaded: usize) -> Self {
        let (_tx, rx) = watch::channel(LoadPhase::Complete {
            initial: loaded,
            loaded,
            skipped: 0,
        });
        Self { rx }
    }

    pub fn current(&self) -> LoadPhase {
        *self.rx.borrow()
    }

    /// Wait for the initial (recent-window) pass and return how many records
    /// it made available.
    pub async fn initial_ready(&mut self) -> Result<usize, StorageError> {
        let phase = *self
            .rx
            .wait_for(|p| p.initial().is_some() || matches!(p, LoadPhase::Failed))
            .await
            .map_err(|_| StorageError::WorkerClosed)?;
        phase.initial().ok_or(StorageError::LoadFailed)
    }

    /// Wait until every artifact has been consumed.
    pub async fn complete(&mut self) -> Result<LoadPhase, StorageError> {
        let phase = *self
            .rx
            .wait_for(|p| p.is_settled())
            .await
            .map_err(|_| StorageError::WorkerClosed)?;
        match phase {
            LoadPhase::Failed => Err(StorageError::LoadFailed),
            other => Ok(other),
        }
    }
}

/// The operations external collaborators rely on. All methods may be called
/// concurrently; each backend serializes its own I/O.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Durably store one record.
    async fn append(&self, record: Record) -> Result<(), StorageError>;

    /// Store many records, reporting the outcome per record.
    async fn append_batch(&self, records: Vec<Record>) -> Result<BatchManifest, StorageError>;

    /// Records matching `query`, newest first.
    async fn query(&self, query: RecordQuery) -> Result<Vec<Record>, StorageError>;

    /// Per-application usage within `range`.
    async fn usage_aggregate(&self, range: TimeRange) -> Result<Vec<UsageStat>, StorageError>;

    fn identity(&self) -> BackendKind;
}

/// Maintenance operations used by the coordinator, the backup manager and
/// the migration engine.
#[async_trait]
pub trait ManagedBackend: StorageBackend {
    async fn get(&self, id: Ulid) -> Result<Option<Record>, StorageError>;

    /// Delete a record. The durable artifact goes first, then any in-memory
    /// copy. Returns whether anything was removed.
    async fn remove(&self, id: Ulid) -> Result<bool, StorageError>;

    async fn counts(&self) -> Result<RecordCounts, StorageError>;

    /// Every readable record plus the issues found while reading.
    async fn scan(&self) -> Result<ScanResult, StorageError>;

    /// Drop every record. Used to reset a disposable migration target.
    async fn clear(&self) -> Result<(), StorageError>;

    /// Flush pending work to durable storage; returns once the backend is at
    /// a safe point for copying its artifacts.
    async fn checkpoint(&self) -> Result<(), StorageError>;

    /// Copy the backend's artifacts into `dest`, serialized with writes.
    async fn export_artifacts(&self, dest: &Path) -> Result<ArtifactExport, StorageError>;

    /// Replace the backend's artifacts with the ones in `src` and reload.
    async fn replace_artifacts(&self, src: &Path) -> Result<(), StorageError>;

    /// Move the backend's artifacts to `dest`, leaving the backend empty.
    async fn archive_artifacts(&self, dest: &Path) -> Result<(), StorageError>;

    /// Start (if needed) and observe the progressive load.
    fn load_progress(&self) -> LoadProgress;
}
