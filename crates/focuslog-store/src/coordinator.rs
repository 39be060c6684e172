// ABOUTME: Single entry point for callers: picks the backend named by the flag and routes every operation to it.
// ABOUTME: Gates writes while a migration runs, swaps the active backend on success, and reports health.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use focuslog_core::{BackendKind, Record, RecordQuery, TimeRange, UsageStat};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::backup::{BackupError, BackupManager, SnapshotInfo};
use crate::config::{ConfigError, StoreConfig};
use crate::contract::{LoadPhase, LoadProgress, ManagedBackend, StorageError};
use crate::disk::{SpaceProbe, SystemSpaceProbe};
use crate::file_store::FileStore;
use crate::flag::{FlagError, FlagStore};
use crate::migration::{MigrationEngine, MigrationError, MigrationProgress, MigrationReport};
use crate::sqlite_store::SqliteStore;

/// Errors surfaced by the coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("the {backend} backend failed to initialize: {source}")]
    Initialization {
        backend: BackendKind,
        source: StorageError,
    },

    #[error("backend flag is unusable: {0}")]
    Flag(#[from] FlagError),

    #[error("backend flag records a migration in transit; refusing to guess which backend holds the data")]
    TransitionalFlag,

    #[error("a migration is in progress; retry once it finishes")]
    MigrationInProgress,

    #[error("already using the {0} backend")]
    AlreadyOnBackend(BackendKind),

    #[error("cannot migrate to the {0} backend")]
    UnsupportedTarget(BackendKind),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("migration task failed: {0}")]
    TaskFailed(String),
}

impl CoordinatorError {
    /// Whether the same call may succeed later without intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoordinatorError::MigrationInProgress)
    }
}

/// The most recent error the coordinator saw.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Migrating,
}

/// Point-in-time health report.
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub backend: BackendKind,
    pub status: HealthStatus,
    pub load: LoadPhase,
    pub last_error: Option<ErrorRecord>,
    pub migration: MigrationProgress,
}

/// Handle to a running migration.
pub struct MigrationHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<MigrationReport, CoordinatorError>>,
}

impl MigrationHandle {
    /// Ask the migration to stop at the next batch boundary. The source is
    /// restored before the migration reports back.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<MigrationReport, CoordinatorError> {
        self.task
            .await
            .map_err(|err| CoordinatorError::TaskFailed(err.to_string()))?
    }
}

struct CoordinatorInner {
    config: StoreConfig,
    probe: Arc<dyn SpaceProbe>,
    active: RwLock<Arc<dyn ManagedBackend>>,
    /// `true` while a migration owns the backends. Writers hold a read guard
    /// for the duration of their write so a migration starts only after
    /// in-flight writes land.
    migrating: RwLock<bool>,
    backups: Arc<BackupManager>,
    engine: MigrationEngine,
    last_error: Mutex<Option<ErrorRecord>>,
}

/// Routes record operations to the active backend and owns migrations.
#[derive(Clone)]
pub struct StorageCoordinator {
    inner: Arc<CoordinatorInner>,
}

fn open_backend(
    config: &StoreConfig,
    kind: BackendKind,
    probe: Arc<dyn SpaceProbe>,
) -> Result<Arc<dyn ManagedBackend>, CoordinatorError> {
    let opened: Result<Arc<dyn ManagedBackend>, StorageError> = match kind {
        BackendKind::FileStore => FileStore::open(config.records_dir(), config.file_store_options(probe))
            .map(|store| Arc::new(store) as Arc<dyn ManagedBackend>),
        BackendKind::Relational => SqliteStore::open(config.database_path())
            .map(|store| Arc::new(store) as Arc<dyn ManagedBackend>),
        BackendKind::Hybrid => return Err(CoordinatorError::UnsupportedTarget(kind)),
    };
    opened.map_err(|source| CoordinatorError::Initialization {
        backend: kind,
        source,
    })
}

impl StorageCoordinator {
    /// Open the backend named by the flag (the file store when no flag has
    /// been written). A backend that fails to open is fatal.
    pub async fn open(config: StoreConfig) -> Result<Self, CoordinatorError> {
        Self::open_with_probe(config, Arc::new(SystemSpaceProbe::new())).await
    }

    pub async fn open_with_probe(
        config: StoreConfig,
        probe: Arc<dyn SpaceProbe>,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;
        std::fs::create_dir_all(&config.home).map_err(StorageError::from)?;

        let flag = FlagStore::new(config.flag_path());
        let kind = match flag.load()? {
            Some(stored) => stored.backend,
            None => BackendKind::FileStore,
        };
        if kind == BackendKind::Hybrid {
            return Err(CoordinatorError::TransitionalFlag);
        }

        let active = open_backend(&config, kind, probe.clone())?;
        active.load_progress();

        let backups = Arc::new(BackupManager::new(config.backups_dir(), config.retention)?);
        let engine = MigrationEngine::new(
            backups.clone(),
            flag,
            config.migration,
            config.archive_dir(),
            config.migrations_dir(),
        );

        tracing::info!(backend = %kind, "storage ready at {}", config.home.display());
        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                config,
                probe,
                active: RwLock::new(active),
                migrating: RwLock::new(false),
                backups,
                engine,
                last_error: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    async fn backend(&self) -> Arc<dyn ManagedBackend> {
        self.inner.active.read().await.clone()
    }

    fn note_error(&self, message: String) {
        let mut slot = match self.inner.last_error.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(ErrorRecord {
            at: Utc::now(),
            message,
        });
    }

    fn observe<T>(&self, result: Result<T, CoordinatorError>) -> Result<T, CoordinatorError> {
        if let Err(err) = &result
            && !err.is_retryable()
        {
            tracing::warn!("storage operation failed: {}", err);
            self.note_error(err.to_string());
        }
        result
    }

    pub async fn append(&self, record: impl Into<Record>) -> Result<(), CoordinatorError> {
        let record = record.into();
        let gate = self.inner.migrating.read().await;
        if *gate {
            return Err(CoordinatorError::MigrationInProgress);
        }
        let result = self.backend().await.append(record).await;
        drop(gate);
        self.observe(result.map_err(CoordinatorError::from))
    }

    pub async fn append_batch(
        &self,
        records: Vec<Record>,
    ) -> Result<crate::contract::BatchManifest, CoordinatorError> {
        let gate = self.inner.migrating.read().await;
        if *gate {
            return Err(CoordinatorError::MigrationInProgress);
        }
        let result = self.backend().await.append_batch(records).await;
        drop(gate);
        self.observe(result.map_err(CoordinatorError::from))
    }

    pub async fn remove(&self, id: Ulid) -> Result<bool, CoordinatorError> {
        let gate = self.inner.migrating.read().await;
        if *gate {
            return Err(CoordinatorError::MigrationInProgress);
        }
        let result = self.backend().await.remove(id).await;
        drop(gate);
        self.observe(result.map_err(CoordinatorError::from))
    }

    /// Reads are served by the active backend even while a migration runs.
    pub async fn query(&self, query: RecordQuery) -> Result<Vec<Record>, CoordinatorError> {
        let result = self.backend().await.query(query).await;
        self.observe(result.map_err(CoordinatorError::from))
    }

    pub async fn query_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, CoordinatorError> {
        let mut query = RecordQuery::in_range(TimeRange::new(start, end));
        query.limit = limit;
        self.query(query).await
    }

    pub async fn get(&self, id: Ulid) -> Result<Option<Record>, CoordinatorError> {
        let result = self.backend().await.get(id).await;
        self.observe(result.map_err(CoordinatorError::from))
    }

    pub async fn usage_aggregate(&self, range: TimeRange) -> Result<Vec<UsageStat>, CoordinatorError> {
        let result = self.backend().await.usage_aggregate(range).await;
        self.observe(result.map_err(CoordinatorError::from))
    }

    /// The active backend, or `Hybrid` while a migration is moving data.
    pub async fn current_backend(&self) -> BackendKind {
        if *self.inner.migrating.read().await {
            return BackendKind::Hybrid;
        }
        self.backend().await.identity()
    }

    pub fn last_error(&self) -> Option<ErrorRecord> {
        match self.inner.last_error.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn migration_progress(&self) -> MigrationProgress {
        self.inner.engine.progress()
    }

    pub fn subscribe_migration(&self) -> watch::Receiver<MigrationProgress> {
        self.inner.engine.subscribe()
    }

    /// Start (if needed) and observe the active backend's progressive load.
    pub async fn ensure_loaded(&self) -> LoadProgress {
        self.backend().await.load_progress()
    }

    pub async fn health(&self) -> BackendHealth {
        let migrating = *self.inner.migrating.read().await;
        let backend = self.backend().await;
        let load = backend.load_progress().current();
        let last_error = self.last_error();

        let status = if migrating {
            HealthStatus::Migrating
        } else if last_error.is_some() || load == LoadPhase::Failed || load.skipped() > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        BackendHealth {
            backend: if migrating {
                BackendKind::Hybrid
            } else {
                backend.identity()
            },
            status,
            load,
            last_error,
            migration: self.migration_progress(),
        }
    }

    /// Flush the active backend to a durable, copyable state.
    pub async fn checkpoint(&self) -> Result<(), CoordinatorError> {
        let result = self.backend().await.checkpoint().await;
        self.observe(result.map_err(CoordinatorError::from))
    }

    /// Take a snapshot of the active backend now.
    pub async fn backup_now(&self, reason: &str) -> Result<SnapshotInfo, CoordinatorError> {
        let gate = self.inner.migrating.read().await;
        if *gate {
            return Err(CoordinatorError::MigrationInProgress);
        }
        let backend = self.backend().await;
        let result = self.inner.backups.snapshot(backend.as_ref(), reason).await;
        drop(gate);
        self.observe(result.map_err(CoordinatorError::from))
    }

    pub fn snapshots(&self) -> Result<Vec<SnapshotInfo>, CoordinatorError> {
        Ok(self.inner.backups.list()?)
    }

    /// Replace the active backend's data with its newest verified snapshot.
    pub async fn recover(&self) -> Result<SnapshotInfo, CoordinatorError> {
        let gate = self.inner.migrating.read().await;
        if *gate {
            return Err(CoordinatorError::MigrationInProgress);
        }
        let backend = self.backend().await;
        let result = self.inner.backups.recover(backend.as_ref()).await;
        drop(gate);
        self.observe(result.map_err(CoordinatorError::from))
    }

    /// Begin migrating to `target` in the background. Writes are rejected
    /// with [`CoordinatorError::MigrationInProgress`] until it finishes.
    pub async fn start_migration(
        &self,
        target: BackendKind,
    ) -> Result<MigrationHandle, CoordinatorError> {
        if target == BackendKind::Hybrid {
            return Err(CoordinatorError::UnsupportedTarget(target));
        }

        let source = {
            let mut migrating = self.inner.migrating.write().await;
            if *migrating {
                return Err(CoordinatorError::MigrationInProgress);
            }
            let source = self.backend().await;
            if source.identity() == target {
                return Err(CoordinatorError::AlreadyOnBackend(target));
            }
            *migrating = true;
            source
        };

        let target_backend =
            match open_backend(&self.inner.config, target, self.inner.probe.clone()) {
                Ok(backend) => backend,
                Err(err) => {
                    *self.inner.migrating.write().await = false;
                    return self.observe(Err(err));
                }
            };

        let cancel = CancellationToken::new();
        let coordinator = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            coordinator
                .drive_migration(source, target_backend, token)
                .await
        });
        Ok(MigrationHandle { cancel, task })
    }

    async fn drive_migration(
        &self,
        source: Arc<dyn ManagedBackend>,
        target: Arc<dyn ManagedBackend>,
        cancel: CancellationToken,
    ) -> Result<MigrationReport, CoordinatorError> {
        let outcome = self
            .inner
            .engine
            .run(source.as_ref(), target.as_ref(), &cancel)
            .await;

        if outcome.is_ok() {
            *self.inner.active.write().await = target;
        }
        *self.inner.migrating.write().await = false;

        self.observe(outcome.map_err(CoordinatorError::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::FixedSpaceProbe;
    use crate::migration::MigrationState;
    use chrono::Duration;
    use focuslog_core::{ActivationEvent, Category, ContextSwitch};
    use tempfile::TempDir;

    async fn open(home: &TempDir) -> StorageCoordinator {
        StorageCoordinator::open_with_probe(
            StoreConfig::new(home.path()),
            Arc::new(FixedSpaceProbe(None)),
        )
        .await
        .unwrap()
    }

    async fn seed(coordinator: &StorageCoordinator, n: usize) {
        let now = Utc::now();
        for i in 0..n {
            coordinator
                .append(
                    ActivationEvent::new("Code", Category::Development)
                        .at(now - Duration::minutes(i as i64)),
                )
                .await
                .unwrap();
        }
        coordinator
            .append(ContextSwitch::new("Code", "Slack", 61.0))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn defaults_to_file_store_without_flag() {
        let home = TempDir::new().unwrap();
        let coordinator = open(&home).await;
        assert_eq!(coordinator.current_backend().await, BackendKind::FileStore);

        seed(&coordinator, 3).await;
        let records = coordinator.query(RecordQuery::all()).await.unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(coordinator.health().await.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn migration_switches_backend_and_survives_reopen() {
        let home = TempDir::new().unwrap();
        let coordinator = open(&home).await;
        seed(&coordinator, 5).await;

        let handle = coordinator
            .start_migration(BackendKind::Relational)
            .await
            .unwrap();
        let report = handle.wait().await.unwrap();
        assert_eq!(report.state, MigrationState::Completed);
        assert_eq!(coordinator.current_backend().await, BackendKind::Relational);
        assert_eq!(coordinator.query(RecordQuery::all()).await.unwrap().len(), 6);
        drop(coordinator);

        let reopened = open(&home).await;
        assert_eq!(reopened.current_backend().await, BackendKind::Relational);
        assert_eq!(reopened.query(RecordQuery::all()).await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn migrating_to_current_backend_is_refused() {
        let home = TempDir::new().unwrap();
        let coordinator = open(&home).await;
        let err = coordinator
            .start_migration(BackendKind::FileStore)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CoordinatorError::AlreadyOnBackend(BackendKind::FileStore)));

        let err = coordinator
            .start_migration(BackendKind::Hybrid)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CoordinatorError::UnsupportedTarget(_)));
    }

    #[tokio::test]
    async fn writes_are_rejected_while_migrating() {
        let home = TempDir::new().unwrap();
        let coordinator = open(&home).await;
        seed(&coordinator, 2).await;

        *coordinator.inner.migrating.write().await = true;
        let err = coordinator
            .append(ActivationEvent::new("Mail", Category::Communication))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(coordinator.current_backend().await, BackendKind::Hybrid);
        assert_eq!(coordinator.health().await.status, HealthStatus::Migrating);
        assert!(coordinator.last_error().is_none());

        assert_eq!(coordinator.query(RecordQuery::all()).await.unwrap().len(), 3);
        *coordinator.inner.migrating.write().await = false;
        coordinator
            .append(ActivationEvent::new("Mail", Category::Communication))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn transitional_flag_is_refused() {
        let home = TempDir::new().unwrap();
        FlagStore::new(home.path().join("backend.json"))
            .store(BackendKind::Hybrid, None)
            .unwrap();
        let result = StorageCoordinator::open_with_probe(
            StoreConfig::new(home.path()),
            Arc::new(FixedSpaceProbe(None)),
        )
        .await;
        assert!(matches!(result, Err(CoordinatorError::TransitionalFlag)));
    }

    #[tokio::test]
    async fn relational_init_failure_is_fatal() {
        let home = TempDir::new().unwrap();
        FlagStore::new(home.path().join("backend.json"))
            .store(BackendKind::Relational, None)
            .unwrap();
        std::fs::write(home.path().join("focuslog.db"), b"definitely not sqlite").unwrap();

        let result = StorageCoordinator::open_with_probe(
            StoreConfig::new(home.path()),
            Arc::new(FixedSpaceProbe(None)),
        )
        .await;
        assert!(matches!(
            result,
            Err(CoordinatorError::Initialization {
                backend: BackendKind::Relational,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn failed_write_is_recorded_as_last_error() {
        let home = TempDir::new().unwrap();
        let coordinator = StorageCoordinator::open_with_probe(
            StoreConfig::new(home.path()),
            Arc::new(FixedSpaceProbe(Some(0))),
        )
        .await
        .unwrap();

        let err = coordinator
            .append(ActivationEvent::new("Maps", Category::Utilities))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::Storage(StorageError::InsufficientDiskSpace { .. })
        ));
        assert!(coordinator.last_error().is_some());
        assert_eq!(coordinator.health().await.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn backup_and_recover_through_coordinator() {
        let home = TempDir::new().unwrap();
        let coordinator = open(&home).await;
        seed(&coordinator, 2).await;

        let snapshot = coordinator.backup_now("manual").await.unwrap();
        assert_eq!(snapshot.manifest.counts.total(), 3);

        let records = coordinator.query(RecordQuery::all()).await.unwrap();
        coordinator.remove(records[0].id()).await.unwrap();
        assert_eq!(coordinator.query(RecordQuery::all()).await.unwrap().len(), 2);

        let recovered = coordinator.recover().await.unwrap();
        assert_eq!(recovered.id, snapshot.id);
        assert_eq!(coordinator.query(RecordQuery::all()).await.unwrap().len(), 3);
    }
}
