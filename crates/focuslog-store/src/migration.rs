// ABOUTME: Moves every record from one backend to another: snapshot, pre-flight, batched transfer, verification.
// ABOUTME: Any failure after the snapshot restores the source and resets the backend flag; progress is observable.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use focuslog_core::{
    BackendKind, Record, RecordCounts, RecordKind, ValidationIssue, find_duplicates,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backup::{BackupError, BackupManager, SnapshotInfo};
use crate::contract::{BatchFailure, ManagedBackend, ScanResult, StorageError};
use crate::flag::{FlagError, FlagStore};
use crate::fsutil;

/// Lifecycle of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Idle,
    InProgress,
    Validating,
    Completed,
    Failed,
    RolledBack,
}

impl MigrationState {
    pub fn is_active(&self) -> bool {
        matches!(self, MigrationState::InProgress | MigrationState::Validating)
    }
}

/// Observable progress: state, fraction of records moved, and a short
/// description of the current step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationProgress {
    pub state: MigrationState,
    pub fraction: f64,
    pub step: String,
}

impl MigrationProgress {
    pub fn idle() -> Self {
        Self {
            state: MigrationState::Idle,
            fraction: 0.0,
            step: "idle".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationSettings {
    /// Records per transfer batch; cancellation is checked between batches.
    pub batch_size: usize,
    /// Records compared field-by-field after the transfer.
    pub sample_size: usize,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            batch_size: 200,
            sample_size: 100,
        }
    }
}

/// Audit trail of one migration attempt, also written to disk.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub source: BackendKind,
    pub target: BackendKind,
    pub state: MigrationState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub snapshot_id: Option<String>,
    pub source_counts: RecordCounts,
    pub target_counts: RecordCounts,
    pub transferred: usize,
    pub sampled: usize,
    pub issues: Vec<ValidationIssue>,
    pub failed_records: Vec<BatchFailure>,
    pub archive_path: Option<PathBuf>,
}

impl MigrationReport {
    fn new(source: BackendKind, target: BackendKind) -> Self {
        Self {
            source,
            target,
            state: MigrationState::InProgress,
            started_at: Utc::now(),
            finished_at: None,
            snapshot_id: None,
            source_counts: RecordCounts::default(),
            target_counts: RecordCounts::default(),
            transferred: 0,
            sampled: 0,
            issues: Vec::new(),
            failed_records: Vec::new(),
            archive_path: None,
        }
    }

    fn finish(&mut self, state: MigrationState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
    }
}

/// Errors that end a migration. Variants that carry a report describe a
/// data-level outcome; the source is intact in every one of them except
/// `RollbackFailed`.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("pre-migration snapshot failed: {0}")]
    BackupFailed(#[source] BackupError),

    #[error("source failed pre-flight validation with {} issue(s)", .0.issues.len())]
    SourceCorrupted(Box<MigrationReport>),

    #[error("transfer failed: {reason}; source restored")]
    TransferFailed {
        reason: String,
        report: Box<MigrationReport>,
    },

    #[error("target verification failed with {} issue(s); source restored", .0.issues.len())]
    VerificationFailed(Box<MigrationReport>),

    #[error("migration cancelled; source restored")]
    Cancelled(Box<MigrationReport>),

    #[error("rollback after '{cause}' failed: {reason}")]
    RollbackFailed {
        cause: String,
        reason: String,
        report: Box<MigrationReport>,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("backend flag error: {0}")]
    Flag(#[from] FlagError),
}

impl MigrationError {
    pub fn report(&self) -> Option<&MigrationReport> {
        match self {
            MigrationError::SourceCorrupted(report)
            | MigrationError::VerificationFailed(report)
            | MigrationError::Cancelled(report)
            | MigrationError::TransferFailed { report, .. }
            | MigrationError::RollbackFailed { report, .. } => Some(report),
            _ => None,
        }
    }
}

/// Why a migration has to roll back.
enum Failure {
    Transfer(String),
    Verification,
    Cancelled,
    Storage(StorageError),
}

impl Failure {
    fn describe(&self) -> String {
        match self {
            Failure::Transfer(reason) => reason.clone(),
            Failure::Verification => "target verification failed".to_string(),
            Failure::Cancelled => "cancelled".to_string(),
            Failure::Storage(err) => err.to_string(),
        }
    }
}

/// Every integrity problem that blocks a migration: issues found while
/// reading, duplicate ids, and records failing validation.
pub fn preflight(scan: &ScanResult, now: DateTime<Utc>) -> Vec<ValidationIssue> {
    let mut issues = scan.issues.clone();
    issues.extend(find_duplicates(scan.records.iter().map(Record::id)));
    for record in &scan.records {
        if let Err(issue) = record.validate(now) {
            issues.push(issue);
        }
    }
    issues
}

fn sample_indices(len: usize, amount: usize) -> Vec<usize> {
    let mut rng = rand::thread_rng();
    let mut picked = rand::seq::index::sample(&mut rng, len, amount.min(len)).into_vec();
    picked.sort_unstable();
    picked
}

pub struct MigrationEngine {
    backups: Arc<BackupManager>,
    flag: FlagStore,
    settings: MigrationSettings,
    archive_root: PathBuf,
    audit_dir: PathBuf,
    progress: watch::Sender<MigrationProgress>,
}

impl MigrationEngine {
    pub fn new(
        backups: Arc<BackupManager>,
        flag: FlagStore,
        settings: MigrationSettings,
        archive_root: impl Into<PathBuf>,
        audit_dir: impl Into<PathBuf>,
    ) -> Self {
        let (progress, _) = watch::channel(MigrationProgress::idle());
        Self {
            backups,
            flag,
            settings,
            archive_root: archive_root.into(),
            audit_dir: audit_dir.into(),
            progress,
        }
    }

    pub fn progress(&self) -> MigrationProgress {
        self.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MigrationProgress> {
        self.progress.subscribe()
    }

    fn publish(&self, state: MigrationState, fraction: f64, step: impl Into<String>) {
        let step = step.into();
        tracing::debug!(?state, fraction, "{}", step);
        self.progress.send_replace(MigrationProgress {
            state,
            fraction: fraction.clamp(0.0, 1.0),
            step,
        });
    }

    /// Run a full migration from `source` to `target`. On success the flag
    /// names the target and the source's artifacts are archived.
    pub async fn run(
        &self,
        source: &dyn ManagedBackend,
        target: &dyn ManagedBackend,
        cancel: &CancellationToken,
    ) -> Result<MigrationReport, MigrationError> {
        let mut report = MigrationReport::new(source.identity(), target.identity());
        tracing::info!(source = %report.source, target = %report.target, "migration started");

        self.publish(MigrationState::InProgress, 0.0, "snapshotting source");
        let snapshot = match self.backups.snapshot(source, "pre-migration").await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.fail(&mut report, "pre-migration snapshot failed");
                return Err(MigrationError::BackupFailed(err));
            }
        };
        report.snapshot_id = Some(snapshot.id.clone());

        self.publish(MigrationState::InProgress, 0.0, "validating source");
        let scan = match source.scan().await {
            Ok(scan) => scan,
            Err(err) => {
                self.fail(&mut report, "source scan failed");
                return Err(err.into());
            }
        };
        report.source_counts = RecordCounts::from_records(&scan.records);

        let issues = preflight(&scan, Utc::now());
        if !issues.is_empty() {
            tracing::warn!(issues = issues.len(), "source failed pre-flight validation");
            report.issues = issues;
            self.fail(&mut report, "source failed pre-flight validation");
            return Err(MigrationError::SourceCorrupted(Box::new(report)));
        }

        if let Err(failure) = self.transfer(&scan.records, target, cancel, &mut report).await {
            return Err(self.roll_back(source, target, &snapshot, report, failure).await);
        }

        self.publish(MigrationState::Validating, 1.0, "verifying target");
        match self.verify(&scan.records, target, &mut report).await {
            Ok(issues) if issues.is_empty() => {}
            Ok(issues) => {
                report.issues = issues;
                return Err(self
                    .roll_back(source, target, &snapshot, report, Failure::Verification)
                    .await);
            }
            Err(err) => {
                return Err(self
                    .roll_back(source, target, &snapshot, report, Failure::Storage(err))
                    .await);
            }
        }

        if let Err(err) = self.flag.store(target.identity(), Some(Utc::now())) {
            tracing::error!("could not record the new backend: {}", err);
            if let Err(clear) = target.clear().await {
                tracing::warn!("could not clear target: {}", clear);
            }
            self.fail(&mut report, "backend flag update failed");
            return Err(err.into());
        }

        let archive = self.archive_root.join(format!(
            "{}_{}",
            source.identity().as_str(),
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        ));
        match source.archive_artifacts(&archive).await {
            Ok(()) => report.archive_path = Some(archive),
            Err(err) => tracing::warn!("source artifacts left in place; archiving failed: {}", err),
        }

        report.finish(MigrationState::Completed);
        self.publish(MigrationState::Completed, 1.0, "migration completed");
        self.write_audit(&report);
        tracing::info!(
            records = report.transferred,
            sampled = report.sampled,
            "migration completed"
        );
        Ok(report)
    }

    fn fail(&self, report: &mut MigrationReport, step: &str) {
        report.finish(MigrationState::Failed);
        self.publish(MigrationState::Failed, 0.0, step);
        self.write_audit(report);
    }

    async fn transfer(
        &self,
        records: &[Record],
        target: &dyn ManagedBackend,
        cancel: &CancellationToken,
        report: &mut MigrationReport,
    ) -> Result<(), Failure> {
        self.publish(MigrationState::InProgress, 0.0, "preparing target");
        target.clear().await.map_err(Failure::Storage)?;

        let total = records.len();
        let batch_size = self.settings.batch_size.max(1);
        for kind in RecordKind::ALL {
            let of_kind: Vec<&Record> = records.iter().filter(|r| r.kind() == kind).collect();
            for chunk in of_kind.chunks(batch_size) {
                if cancel.is_cancelled() {
                    return Err(Failure::Cancelled);
                }

                let batch: Vec<Record> = chunk.iter().map(|r| (*r).clone()).collect();
                let manifest = target.append_batch(batch).await.map_err(Failure::Storage)?;
                report.transferred += manifest.succeeded.len();
                if !manifest.is_complete() {
                    let rejected = manifest.failed.len();
                    report.failed_records.extend(manifest.failed);
                    return Err(Failure::Transfer(format!(
                        "target rejected {} {} record(s)",
                        rejected, kind
                    )));
                }

                let fraction = report.transferred as f64 / total.max(1) as f64;
                self.publish(
                    MigrationState::InProgress,
                    fraction,
                    format!("transferred {}/{} records", report.transferred, total),
                );
                tokio::task::yield_now().await;
            }
        }
        Ok(())
    }

    /// Compare per-kind counts and a random sample of records field by
    /// field. Returns the discrepancies found.
    async fn verify(
        &self,
        records: &[Record],
        target: &dyn ManagedBackend,
        report: &mut MigrationReport,
    ) -> Result<Vec<ValidationIssue>, StorageError> {
        let mut issues = Vec::new();
        let actual = target.counts().await?;
        report.target_counts = actual;
        for kind in RecordKind::ALL {
            let expected = report.source_counts.get(kind);
            let found = actual.get(kind);
            if expected != found {
                issues.push(ValidationIssue::missing(
                    format!(
                        "target holds {} {} record(s), source holds {}",
                        found, kind, expected
                    ),
                    None,
                ));
            }
        }

        let sample = sample_indices(records.len(), self.settings.sample_size);
        report.sampled = sample.len();
        for position in sample {
            let expected = &records[position];
            match target.get(expected.id()).await? {
                None => issues.push(ValidationIssue::missing(
                    "record absent from target",
                    Some(expected.id()),
                )),
                Some(found) => {
                    let diffs = expected.diff_fields(&found);
                    if !diffs.is_empty() {
                        issues.push(ValidationIssue::corrupted(
                            format!("fields differ after transfer: {}", diffs.join(", ")),
                            Some(expected.id()),
                        ));
                    }
                }
            }
        }
        Ok(issues)
    }

    async fn roll_back(
        &self,
        source: &dyn ManagedBackend,
        target: &dyn ManagedBackend,
        snapshot: &SnapshotInfo,
        mut report: MigrationReport,
        failure: Failure,
    ) -> MigrationError {
        let cause = failure.describe();
        tracing::warn!("migration failed ({}); rolling back", cause);
        self.publish(MigrationState::Failed, 0.0, format!("rolling back: {}", cause));

        if let Err(err) = self.backups.restore(snapshot, source).await {
            tracing::error!("restoring the source failed: {}", err);
            self.fail(&mut report, "rollback failed");
            return MigrationError::RollbackFailed {
                cause,
                reason: err.to_string(),
                report: Box::new(report),
            };
        }
        if let Err(err) = self.flag.store(source.identity(), None) {
            tracing::error!("resetting the backend flag failed: {}", err);
            self.fail(&mut report, "rollback failed");
            return MigrationError::RollbackFailed {
                cause,
                reason: err.to_string(),
                report: Box::new(report),
            };
        }
        if let Err(err) = target.clear().await {
            tracing::warn!("could not clear target after rollback: {}", err);
        }

        report.finish(MigrationState::RolledBack);
        self.publish(MigrationState::RolledBack, 0.0, "rolled back to source");
        self.write_audit(&report);

        let report = Box::new(report);
        match failure {
            Failure::Transfer(reason) => MigrationError::TransferFailed { reason, report },
            Failure::Storage(err) => MigrationError::TransferFailed {
                reason: err.to_string(),
                report,
            },
            Failure::Verification => MigrationError::VerificationFailed(report),
            Failure::Cancelled => MigrationError::Cancelled(report),
        }
    }

    fn write_audit(&self, report: &MigrationReport) {
        let name = format!(
            "{}_{}-to-{}.json",
            report.started_at.format("%Y%m%dT%H%M%S%.3fZ"),
            report.source.as_str(),
            report.target.as_str()
        );
        let written = std::fs::create_dir_all(&self.audit_dir)
            .map_err(StorageError::from)
            .and_then(|_| Ok(serde_json::to_vec_pretty(report)?))
            .and_then(|bytes| Ok(fsutil::write_atomic(&self.audit_dir, &name, &bytes)?));
        if let Err(err) = written {
            tracing::warn!("could not write migration report {}: {}", name, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::RetentionPolicy;
    use crate::contract::{
        ArtifactExport, BatchManifest, LoadProgress, StorageBackend,
    };
    use crate::disk::FixedSpaceProbe;
    use crate::file_store::{FileStore, FileStoreOptions};
    use crate::sqlite_store::SqliteStore;
    use async_trait::async_trait;
    use chrono::Duration;
    use focuslog_core::{
        ActivationEvent, Category, ContextSwitch, IssueKind, RecordQuery, TimeRange, UsageStat,
    };
    use std::path::Path;
    use tempfile::TempDir;
    use ulid::Ulid;

    struct Fixture {
        home: TempDir,
        engine: MigrationEngine,
        flag: FlagStore,
    }

    fn fixture() -> Fixture {
        let home = TempDir::new().unwrap();
        let backups = Arc::new(
            BackupManager::new(home.path().join("backups"), RetentionPolicy::default()).unwrap(),
        );
        let flag = FlagStore::new(home.path().join("backend.json"));
        let engine = MigrationEngine::new(
            backups,
            flag.clone(),
            MigrationSettings {
                batch_size: 7,
                sample_size: 100,
            },
            home.path().join("archive"),
            home.path().join("migrations"),
        );
        Fixture { home, engine, flag }
    }

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

    fn records(n: usize) -> Vec<Record> {
        let now = Utc::now();
        (0..n)
            .map(|i| {
                let ts = now - Duration::minutes(i as i64 * 13);
                if i % 3 == 0 {
                    ContextSwitch::new("Code", "Slack", 20.0 + i as f64)
                        .at(ts)
                        .with_categories(Category::Development, Category::Communication)
                        .into()
                } else {
                    ActivationEvent::new("Code", Category::Development).at(ts).into()
                }
            })
            .collect()
    }

    /// Passes everything through to an inner backend but silently drops one
    /// record on the way in.
    struct LossyBackend {
        inner: SqliteStore,
        drop_id: Ulid,
    }

    #[async_trait]
    impl StorageBackend for LossyBackend {
        async fn append(&self, record: Record) -> Result<(), StorageError> {
            self.inner.append(record).await
        }

        async fn append_batch(&self, records: Vec<Record>) -> Result<BatchManifest, StorageError> {
            let kept = records.iter().filter(|r| r.id() != self.drop_id).cloned().collect();
            let mut manifest = self.inner.append_batch(kept).await?;
            if records.iter().any(|r| r.id() == self.drop_id) {
                manifest.record_success(self.drop_id);
            }
            Ok(manifest)
        }

        async fn query(&self, query: RecordQuery) -> Result<Vec<Record>, StorageError> {
            self.inner.query(query).await
        }

        async fn usage_aggregate(&self, range: TimeRange) -> Result<Vec<UsageStat>, StorageError> {
            self.inner.usage_aggregate(range).await
        }

        fn identity(&self) -> BackendKind {
            self.inner.identity()
        }
    }

    #[async_trait]
    impl ManagedBackend for LossyBackend {
        async fn get(&self, id: Ulid) -> Result<Option<Record>, StorageError> {
            self.inner.get(id).await
        }
        async fn remove(&self, id: Ulid) -> Result<bool, StorageError> {
            self.inner.remove(id).await
        }
        async fn counts(&self) -> Result<RecordCounts, StorageError> {
            self.inner.counts().await
        }
        async fn scan(&self) -> Result<ScanResult, StorageError> {
            self.inner.scan().await
        }
        async fn clear(&self) -> Result<(), StorageError> {
            self.inner.clear().await
        }
        async fn checkpoint(&self) -> Result<(), StorageError> {
            self.inner.checkpoint().await
        }
        async fn export_artifacts(&self, dest: &Path) -> Result<ArtifactExport, StorageError> {
            self.inner.export_artifacts(dest).await
        }
        async fn replace_artifacts(&self, src: &Path) -> Result<(), StorageError> {
            self.inner.replace_artifacts(src).await
        }
        async fn archive_artifacts(&self, dest: &Path) -> Result<(), StorageError> {
            self.inner.archive_artifacts(dest).await
        }
        fn load_progress(&self) -> LoadProgress {
            self.inner.load_progress()
        }
    }

    #[tokio::test]
    async fn file_store_migrates_to_relational() {
        let fx = fixture();
        let source = file_store(&fx.home.path().join("records"));
        let target = SqliteStore::open(fx.home.path().join("focuslog.db")).unwrap();
        let input = records(40);
        assert!(source.append_batch(input.clone()).await.unwrap().is_complete());

        let report = fx
            .engine
            .run(&source, &target, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.state, MigrationState::Completed);
        assert_eq!(report.transferred, 40);
        assert_eq!(report.source_counts, report.target_counts);
        assert_eq!(report.sampled, 40);
        assert!(report.archive_path.as_ref().is_some_and(|p| p.exists()));
        assert_eq!(fx.flag.load().unwrap().unwrap().backend, BackendKind::Relational);
        assert_eq!(fx.engine.progress().state, MigrationState::Completed);

        for record in &input {
            let stored = target.get(record.id()).await.unwrap().unwrap();
            assert!(stored.diff_fields(record).is_empty());
        }
        assert_eq!(source.counts().await.unwrap().total(), 0);
        assert_eq!(
            std::fs::read_dir(fx.home.path().join("migrations")).unwrap().count(),
            1
        );
    }

    #[tokio::test]
    async fn relational_migrates_back_to_files() {
        let fx = fixture();
        let source = SqliteStore::open(fx.home.path().join("focuslog.db")).unwrap();
        let target = file_store(&fx.home.path().join("records"));
        source.append_batch(records(15)).await.unwrap();

        let report = fx
            .engine
            .run(&source, &target, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.state, MigrationState::Completed);
        assert_eq!(target.counts().await.unwrap().total(), 15);
        assert_eq!(fx.flag.load().unwrap().unwrap().backend, BackendKind::FileStore);
    }

    #[tokio::test]
    async fn invalid_source_record_blocks_migration() {
        let fx = fixture();
        let records_dir = fx.home.path().join("records");
        let source = file_store(&records_dir);
        source.append_batch(records(5)).await.unwrap();
        drop(source);

        let mut bad = serde_json::to_value(Record::from(ActivationEvent::new(
            "placeholder",
            Category::Utilities,
        )))
        .unwrap();
        bad["app_name"] = serde_json::json!("");
        std::fs::write(
            records_dir.join("2024-01-01T00-00-00.000Z_unknown_zzzzzzzz.json"),
            serde_json::to_vec(&bad).unwrap(),
        )
        .unwrap();

        let source = file_store(&records_dir);
        let target = SqliteStore::open(fx.home.path().join("focuslog.db")).unwrap();
        let err = fx
            .engine
            .run(&source, &target, &CancellationToken::new())
            .await
            .unwrap_err();

        let MigrationError::SourceCorrupted(report) = err else {
            panic!("expected pre-flight failure, got {err}");
        };
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].kind, IssueKind::CorruptedData);
        assert_eq!(report.state, MigrationState::Failed);
        assert_eq!(target.counts().await.unwrap().total(), 0);
        assert!(fx.flag.load().unwrap().is_none());
        assert_eq!(source.counts().await.unwrap().total(), 5);
    }

    #[tokio::test]
    async fn lost_record_triggers_rollback() {
        let fx = fixture();
        let source = file_store(&fx.home.path().join("records"));
        let input = records(20);
        source.append_batch(input.clone()).await.unwrap();

        let target = LossyBackend {
            inner: SqliteStore::open(fx.home.path().join("focuslog.db")).unwrap(),
            drop_id: input[4].id(),
        };
        let err = fx
            .engine
            .run(&source, &target, &CancellationToken::new())
            .await
            .unwrap_err();

        let MigrationError::VerificationFailed(report) = err else {
            panic!("expected verification failure, got {err}");
        };
        assert_eq!(report.state, MigrationState::RolledBack);
        assert!(!report.issues.is_empty());
        assert_eq!(fx.engine.progress().state, MigrationState::RolledBack);
        assert_eq!(fx.flag.load().unwrap().unwrap().backend, BackendKind::FileStore);
        assert_eq!(target.counts().await.unwrap().total(), 0);

        let restored = source.query(RecordQuery::all()).await.unwrap();
        assert_eq!(restored.len(), 20);
    }

    #[tokio::test]
    async fn cancelled_migration_rolls_back() {
        let fx = fixture();
        let source = file_store(&fx.home.path().join("records"));
        source.append_batch(records(30)).await.unwrap();
        let target = SqliteStore::open(fx.home.path().join("focuslog.db")).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fx.engine.run(&source, &target, &cancel).await.unwrap_err();

        assert!(matches!(err, MigrationError::Cancelled(_)));
        assert_eq!(target.counts().await.unwrap().total(), 0);
        assert_eq!(source.counts().await.unwrap().total(), 30);
        assert_eq!(fx.flag.load().unwrap().unwrap().backend, BackendKind::FileStore);
    }

    #[test]
    fn preflight_reports_duplicates_and_bad_records() {
        let event = ActivationEvent::new("Mail", Category::Communication);
        let mut future = ActivationEvent::new("Mail", Category::Communication);
        future.timestamp = Utc::now() + Duration::days(2);
        let scan = ScanResult {
            records: vec![event.clone().into(), event.into(), future.into()],
            issues: vec![ValidationIssue::corrupted("unreadable file", None)],
        };

        let issues = preflight(&scan, Utc::now());
        let kinds: Vec<IssueKind> = issues.iter().map(|i| i.kind).collect();
        assert!(kinds.contains(&IssueKind::CorruptedData));
        assert!(kinds.contains(&IssueKind::DuplicateData));
        assert!(kinds.contains(&IssueKind::TimestampInconsistency));
    }

    #[test]
    fn sample_never_exceeds_population() {
        assert_eq!(sample_indices(3, 100), vec![0, 1, 2]);
        assert_eq!(sample_indices(500, 100).len(), 100);
        assert!(sample_indices(0, 100).is_empty());
    }
}
