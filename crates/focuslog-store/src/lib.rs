// ABOUTME: Persistence layer for focuslog, storing activity records in one of two interchangeable backends.
// ABOUTME: Provides the file-per-record store, the SQLite store, snapshots, migration and the coordinator.

pub mod backup;
pub mod config;
pub mod contract;
pub mod coordinator;
pub mod disk;
pub mod file_store;
pub mod flag;
pub mod migration;
pub mod sqlite_store;

mod fsutil;
mod worker;

pub use backup::{BackupError, BackupManager, RetentionPolicy, SnapshotInfo, SnapshotManifest};
pub use config::{ConfigError, StoreConfig};
pub use contract::{
    ArtifactExport, BatchFailure, BatchManifest, LoadPhase, LoadProgress, ManagedBackend,
    ScanResult, StorageBackend, StorageError,
};
pub use coordinator::{
    BackendHealth, CoordinatorError, ErrorRecord, HealthStatus, MigrationHandle,
    StorageCoordinator,
};
pub use disk::{FixedSpaceProbe, SpaceProbe, SystemSpaceProbe};
pub use file_store::{FileStore, FileStoreOptions};
pub use flag::{BackendFlag, FlagError, FlagStore};
pub use migration::{
    MigrationEngine, MigrationError, MigrationProgress, MigrationReport, MigrationSettings,
    MigrationState,
};
pub use sqlite_store::SqliteStore;
