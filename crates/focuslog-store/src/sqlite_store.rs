// ABOUTME: Relational backend: one SQLite database in WAL mode with separate tables per record kind.
// ABOUTME: A dedicated worker thread owns the connection; batches are all-or-nothing transactions.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use focuslog_core::{
    ActivationEvent, BackendKind, Category, ContextSwitch, Record, RecordCounts, RecordKind,
    RecordQuery, SwitchType, TabInfo, TimeRange, UsageAccumulator, UsageStat, ValidationIssue,
    sort_newest_first,
};
use rusqlite::{Connection, Row, params};
use ulid::Ulid;

use crate::contract::{
    ArtifactExport, BatchManifest, LoadProgress, ManagedBackend, ScanResult, StorageBackend,
    StorageError,
};
use crate::fsutil;
use crate::worker::Worker;

/// Current schema version, stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    app_name TEXT,
    bundle_id TEXT,
    has_tab INTEGER NOT NULL DEFAULT 0,
    tab_title TEXT,
    tab_url TEXT,
    tab_domain TEXT,
    category TEXT NOT NULL,
    session_id TEXT,
    session_start TEXT,
    session_end TEXT,
    is_session_start INTEGER NOT NULL DEFAULT 0,
    is_session_end INTEGER NOT NULL DEFAULT 0,
    switch_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_events_app_name ON events(app_name);
CREATE INDEX IF NOT EXISTS idx_events_category ON events(category);

CREATE TABLE IF NOT EXISTS switches (
    id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    from_app TEXT NOT NULL,
    from_bundle_id TEXT,
    to_app TEXT NOT NULL,
    to_bundle_id TEXT,
    time_spent REAL NOT NULL,
    switch_type TEXT NOT NULL,
    from_category TEXT NOT NULL,
    to_category TEXT NOT NULL,
    session_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_switches_timestamp ON switches(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_switches_from_app ON switches(from_app);
CREATE INDEX IF NOT EXISTS idx_switches_to_app ON switches(to_app);
CREATE INDEX IF NOT EXISTS idx_switches_from_category ON switches(from_category);
";

const SELECT_EVENTS: &str = "SELECT id, timestamp, app_name, bundle_id, has_tab, tab_title, tab_url, tab_domain,
        category, session_id, session_start, session_end, is_session_start, is_session_end,
        switch_count
     FROM events";

const SELECT_SWITCHES: &str = "SELECT id, timestamp, from_app, from_bundle_id, to_app, to_bundle_id, time_spent,
        from_category, to_category, session_id
     FROM switches";

fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn opt_ts_to_sql(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(ts_to_sql)
}

fn parse_id(raw: &str) -> Result<Ulid, ValidationIssue> {
    Ulid::from_string(raw)
        .map_err(|err| ValidationIssue::corrupted(format!("invalid id {:?}: {}", raw, err), None))
}

fn parse_ts(raw: &str, field: &str, id: Ulid) -> Result<DateTime<Utc>, ValidationIssue> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| {
            ValidationIssue::corrupted(format!("invalid {} {:?}: {}", field, raw, err), Some(id))
        })
}

fn parse_opt_ts(
    raw: Option<String>,
    field: &str,
    id: Ulid,
) -> Result<Option<DateTime<Utc>>, ValidationIssue> {
    raw.map(|r| parse_ts(&r, field, id)).transpose()
}

fn parse_category(raw: &str, id: Ulid) -> Result<Category, ValidationIssue> {
    raw.parse()
        .map_err(|err| ValidationIssue::corrupted(format!("{}", err), Some(id)))
}

fn parse_opt_id(raw: Option<String>, id: Ulid) -> Result<Option<Ulid>, ValidationIssue> {
    raw.map(|r| {
        Ulid::from_string(&r).map_err(|err| {
            ValidationIssue::corrupted(format!("invalid session id {:?}: {}", r, err), Some(id))
        })
    })
    .transpose()
}

/// Raw column values of an `events` row.
struct EventRow {
    id: String,
    timestamp: String,
    app_name: Option<String>,
    bundle_id: Option<String>,
    has_tab: bool,
    tab_title: Option<String>,
    tab_url: Option<String>,
    tab_domain: Option<String>,
    category: String,
    session_id: Option<String>,
    session_start: Option<String>,
    session_end: Option<String>,
    is_session_start: bool,
    is_session_end: bool,
    switch_count: i64,
}

impl EventRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            app_name: row.get(2)?,
            bundle_id: row.get(3)?,
            has_tab: row.get(4)?,
            tab_title: row.get(5)?,
            tab_url: row.get(6)?,
            tab_domain: row.get(7)?,
            category: row.get(8)?,
            session_id: row.get(9)?,
            session_start: row.get(10)?,
            session_end: row.get(11)?,
            is_session_start: row.get(12)?,
            is_session_end: row.get(13)?,
            switch_count: row.get(14)?,
        })
    }

    fn into_record(self) -> Result<Record, ValidationIssue> {
        let id = parse_id(&self.id)?;
        let switch_count = u32::try_from(self.switch_count).map_err(|_| {
            ValidationIssue::corrupted(
                format!("switch_count {} out of range", self.switch_count),
                Some(id),
            )
        })?;
        let tab = self.has_tab.then(|| TabInfo {
            title: self.tab_title,
            url: self.tab_url,
            domain: self.tab_domain,
        });
        Ok(Record::Activation(ActivationEvent {
            id,
            timestamp: parse_ts(&self.timestamp, "timestamp", id)?,
            app_name: self.app_name,
            bundle_id: self.bundle_id,
            tab,
            category: parse_category(&self.category, id)?,
            session_id: parse_opt_id(self.session_id, id)?,
            session_start: parse_opt_ts(self.session_start, "session_start", id)?,
            session_end: parse_opt_ts(self.session_end, "session_end", id)?,
            is_session_start: self.is_session_start,
            is_session_end: self.is_session_end,
            switch_count,
            decoration: None,
        }))
    }
}

/// Raw column values of a `switches` row. The stored `switch_type` is not
/// read back; it is recomputed from `time_spent`.
struct SwitchRow {
    id: String,
    timestamp: String,
    from_app: String,
    from_bundle_id: Option<String>,
    to_app: String,
    to_bundle_id: Option<String>,
    time_spent: f64,
    from_category: String,
    to_category: String,
    session_id: Option<String>,
}

impl SwitchRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            from_app: row.get(2)?,
            from_bundle_id: row.get(3)?,
            to_app: row.get(4)?,
            to_bundle_id: row.get(5)?,
            time_spent: row.get(6)?,
            from_category: row.get(7)?,
            to_category: row.get(8)?,
            session_id: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<Record, ValidationIssue> {
        let id = parse_id(&self.id)?;
        Ok(Record::Switch(ContextSwitch {
            id,
            from_app: self.from_app,
            from_bundle_id: self.from_bundle_id,
            to_app: self.to_app,
            to_bundle_id: self.to_bundle_id,
            timestamp: parse_ts(&self.timestamp, "timestamp", id)?,
            time_spent: self.time_spent,
            switch_type: SwitchType::classify(self.time_spent),
            from_category: parse_category(&self.from_category, id)?,
            to_category: parse_category(&self.to_category, id)?,
            session_id: parse_opt_id(self.session_id, id)?,
        }))
    }
}

/// Convert and validate one row. Rows that fail either step are treated
/// like an unreadable record file.
fn checked<R>(
    row: R,
    convert: impl Fn(R) -> Result<Record, ValidationIssue>,
    now: DateTime<Utc>,
) -> Result<Record, ValidationIssue> {
    let record = convert(row)?;
    record.validate(now)?;
    Ok(record)
}

/// Convert raw rows, keeping the good ones and collecting issues for the rest.
fn convert_rows<R>(
    rows: Vec<R>,
    convert: impl Fn(R) -> Result<Record, ValidationIssue>,
    now: DateTime<Utc>,
    out: &mut ScanResult,
) {
    for row in rows {
        match checked(row, &convert, now) {
            Ok(record) => out.records.push(record),
            Err(issue) => {
                tracing::warn!("skipping unreadable row: {}", issue);
                out.issues.push(issue);
            }
        }
    }
}

fn insert_record(conn: &Connection, record: &Record) -> Result<(), StorageError> {
    match record {
        Record::Activation(e) => {
            let tab = e.tab.as_ref();
            let mut stmt = conn.prepare_cached(
                "INSERT INTO events (id, timestamp, app_name, bundle_id, has_tab, tab_title, tab_url,
                    tab_domain, category, session_id, session_start, session_end,
                    is_session_start, is_session_end, switch_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(id) DO UPDATE SET
                    timestamp = excluded.timestamp,
                    app_name = excluded.app_name,
                    bundle_id = excluded.bundle_id,
                    has_tab = excluded.has_tab,
                    tab_title = excluded.tab_title,
                    tab_url = excluded.tab_url,
                    tab_domain = excluded.tab_domain,
                    category = excluded.category,
                    session_id = excluded.session_id,
                    session_start = excluded.session_start,
                    session_end = excluded.session_end,
                    is_session_start = excluded.is_session_start,
                    is_session_end = excluded.is_session_end,
                    switch_count = excluded.switch_count",
            )?;
            stmt.execute(params![
                e.id.to_string(),
                ts_to_sql(e.timestamp),
                e.app_name,
                e.bundle_id,
                tab.is_some(),
                tab.and_then(|t| t.title.as_deref()),
                tab.and_then(|t| t.url.as_deref()),
                tab.and_then(|t| t.domain.as_deref()),
                e.category.as_str(),
                e.session_id.map(|s| s.to_string()),
                opt_ts_to_sql(e.session_start),
                opt_ts_to_sql(e.session_end),
                e.is_session_start,
                e.is_session_end,
                i64::from(e.switch_count),
            ])?;
        }
        Record::Switch(s) => {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO switches (id, timestamp, from_app, from_bundle_id, to_app, to_bundle_id,
                    time_spent, switch_type, from_category, to_category, session_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                    timestamp = excluded.timestamp,
                    from_app = excluded.from_app,
                    from_bundle_id = excluded.from_bundle_id,
                    to_app = excluded.to_app,
                    to_bundle_id = excluded.to_bundle_id,
                    time_spent = excluded.time_spent,
                    switch_type = excluded.switch_type,
                    from_category = excluded.from_category,
                    to_category = excluded.to_category,
                    session_id = excluded.session_id",
            )?;
            stmt.execute(params![
                s.id.to_string(),
                ts_to_sql(s.timestamp),
                s.from_app,
                s.from_bundle_id,
                s.to_app,
                s.to_bundle_id,
                s.time_spent,
                SwitchType::classify(s.time_spent).as_str(),
                s.from_category.as_str(),
                s.to_category.as_str(),
                s.session_id.map(|id| id.to_string()),
            ])?;
        }
    }
    Ok(())
}

fn run_migrations(conn: &mut Connection) -> Result<(), StorageError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(StorageError::Initialization(format!(
            "database schema version {} is newer than supported version {}",
            version, SCHEMA_VERSION
        )));
    }
    if version == SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    tx.execute_batch(SCHEMA_V1)?;
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;
    tracing::info!(from = version, to = SCHEMA_VERSION, "database schema migrated");
    Ok(())
}

fn open_connection(path: &Path) -> Result<Connection, StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.execute_batch("PRAGMA synchronous=FULL;")?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    run_migrations(&mut conn)?;
    Ok(conn)
}

fn checkpoint_wal(conn: &Connection) -> Result<(), StorageError> {
    let (busy, log, checkpointed): (i64, i64, i64) =
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE);", [], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
    if busy != 0 {
        tracing::warn!(log, checkpointed, "wal checkpoint did not complete");
    }
    Ok(())
}

/// Suffix for live database files set aside during a restore.
const ASIDE_SUFFIX: &str = ".replaced";

/// File names making up a database: the main file and its WAL side files.
fn artifact_names(path: &Path) -> Result<Vec<String>, StorageError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StorageError::Initialization(format!("bad database path {}", path.display())))?;
    Ok(vec![
        name.to_string(),
        format!("{}-wal", name),
        format!("{}-shm", name),
    ])
}

/// State owned by the SQLite worker thread.
pub(crate) struct SqliteState {
    path: PathBuf,
    conn: Option<Connection>,
}

impl SqliteState {
    fn open(path: PathBuf) -> Result<Self, StorageError> {
        let conn = open_connection(&path)?;
        Ok(Self {
            path,
            conn: Some(conn),
        })
    }

    fn conn(&mut self) -> Result<&mut Connection, StorageError> {
        self.conn.as_mut().ok_or(StorageError::Closed)
    }

    fn dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Checkpoint and close the connection. On failure the connection stays
    /// open and usable.
    fn close(&mut self) -> Result<(), StorageError> {
        if let Some(conn) = &self.conn {
            checkpoint_wal(conn)?;
        }
        if let Some(conn) = self.conn.take()
            && let Err((conn, err)) = conn.close()
        {
            self.conn = Some(conn);
            return Err(err.into());
        }
        Ok(())
    }

    /// Reopen after `close`, whatever the outcome of the work done while
    /// closed. The work's error wins over a reopen error.
    fn reopen_after<T>(&mut self, outcome: Result<T, StorageError>) -> Result<T, StorageError> {
        match open_connection(&self.path) {
            Ok(conn) => {
                self.conn = Some(conn);
                outcome
            }
            Err(err) => {
                tracing::error!("could not reopen {}: {}", self.path.display(), err);
                outcome.and(Err(err))
            }
        }
    }

    /// Swap the live database files for the ones in `src`. The live files
    /// are set aside first and put back if the copy fails.
    fn swap_files(&self, src: &Path, names: &[String]) -> Result<(), StorageError> {
        let dir = self.dir();
        let aside: Vec<String> = names
            .iter()
            .filter(|name| dir.join(name).exists())
            .cloned()
            .collect();
        for name in &aside {
            fs::rename(dir.join(name), dir.join(format!("{}{}", name, ASIDE_SUFFIX)))?;
        }

        // The shared-memory index is rebuilt on open; only the database and
        // its log carry data.
        let incoming: Vec<String> = names[..2]
            .iter()
            .filter(|name| src.join(name).exists())
            .cloned()
            .collect();
        if let Err(err) = fsutil::copy_files(src, &dir, &incoming) {
            for name in names {
                fsutil::remove_if_present(&dir.join(name))?;
            }
            for name in &aside {
                fs::rename(dir.join(format!("{}{}", name, ASIDE_SUFFIX)), dir.join(name))?;
            }
            fsutil::sync_dir(&dir);
            return Err(err.into());
        }

        for name in &aside {
            fsutil::remove_if_present(&dir.join(format!("{}{}", name, ASIDE_SUFFIX)))?;
        }
        fsutil::sync_dir(&dir);
        Ok(())
    }

    fn append(&mut self, record: &Record) -> Result<(), StorageError> {
        insert_record(self.conn()?, record)
    }

    fn write_batch(
        &mut self,
        records: Vec<Record>,
        now: DateTime<Utc>,
    ) -> Result<BatchManifest, StorageError> {
        let conn = self.conn()?;
        let tx = conn.transaction()?;

        let mut failure: Option<(Ulid, String)> = None;
        for record in &records {
            if let Err(issue) = record.validate(now) {
                failure = Some((record.id(), issue.to_string()));
                break;
            }
            if let Err(err) = insert_record(&tx, record) {
                failure = Some((record.id(), err.to_string()));
                break;
            }
        }

        let mut manifest = BatchManifest::default();
        match failure {
            None => {
                tx.commit()?;
                for record in &records {
                    manifest.record_success(record.id());
                }
            }
            Some((bad_id, reason)) => {
                if let Err(err) = tx.rollback() {
                    tracing::error!("batch rollback failed: {}", err);
                }
                for record in &records {
                    if record.id() == bad_id {
                        manifest.record_failure(bad_id, reason.clone());
                    } else {
                        manifest.record_failure(record.id(), format!("batch rolled back: {}", reason));
                    }
                }
            }
        }
        Ok(manifest)
    }

    fn query(&mut self, query: &RecordQuery) -> Result<ScanResult, StorageError> {
        let result = self.query_rows(query, query.limit)?;
        if query.limit.is_some() && !result.issues.is_empty() {
            // Skipped rows used up part of the limit.
            return self.query_rows(query, None);
        }
        Ok(result)
    }

    fn query_rows(
        &mut self,
        query: &RecordQuery,
        row_limit: Option<usize>,
    ) -> Result<ScanResult, StorageError> {
        let conn = self.conn()?;
        let now = Utc::now();
        let start = ts_to_sql(query.range.start);
        let end = ts_to_sql(query.range.end);
        let app = query.app_name.as_deref();
        let category = query.category.map(|c| c.as_str());
        let limit = row_limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));

        let mut result = ScanResult::default();
        if query.kind.is_none_or(|k| k == RecordKind::Activation) {
            let mut stmt = conn.prepare_cached(&format!(
                "{SELECT_EVENTS}
                 WHERE timestamp >= ?1 AND timestamp <= ?2
                   AND (?3 IS NULL OR app_name = ?3)
                   AND (?4 IS NULL OR category = ?4)
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?5"
            ))?;
            let rows = stmt
                .query_map(params![start, end, app, category, limit], EventRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            convert_rows(rows, EventRow::into_record, now, &mut result);
        }
        if query.kind.is_none_or(|k| k == RecordKind::Switch) {
            let mut stmt = conn.prepare_cached(&format!(
                "{SELECT_SWITCHES}
                 WHERE timestamp >= ?1 AND timestamp <= ?2
                   AND (?3 IS NULL OR from_app = ?3 OR to_app = ?3)
                   AND (?4 IS NULL OR from_category = ?4 OR to_category = ?4)
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?5"
            ))?;
            let rows = stmt
                .query_map(params![start, end, app, category, limit], SwitchRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            convert_rows(rows, SwitchRow::into_record, now, &mut result);
        }

        sort_newest_first(&mut result.records);
        if let Some(limit) = query.limit {
            result.records.truncate(limit);
        }
        Ok(result)
    }

    /// The record with `id`, or `None` if absent or failing validation.
    fn get(&mut self, id: Ulid) -> Result<Option<Record>, StorageError> {
        let conn = self.conn()?;
        let key = id.to_string();
        let now = Utc::now();

        let event = conn.query_row(
            &format!("{SELECT_EVENTS} WHERE id = ?1"),
            params![key],
            EventRow::from_row,
        );
        let found = match event {
            Ok(row) => checked(row, EventRow::into_record, now),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                let switch = conn.query_row(
                    &format!("{SELECT_SWITCHES} WHERE id = ?1"),
                    params![key],
                    SwitchRow::from_row,
                );
                match switch {
                    Ok(row) => checked(row, SwitchRow::into_record, now),
                    Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
                    Err(err) => return Err(err.into()),
                }
            }
            Err(err) => return Err(err.into()),
        };

        match found {
            Ok(record) => Ok(Some(record)),
            Err(issue) => {
                tracing::warn!("ignoring unreadable row: {}", issue);
                Ok(None)
            }
        }
    }

    fn remove(&mut self, id: Ulid) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let key = id.to_string();
        let tx = conn.transaction()?;
        let mut removed = tx.execute("DELETE FROM events WHERE id = ?1", params![key])?;
        removed += tx.execute("DELETE FROM switches WHERE id = ?1", params![key])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    fn counts(&mut self) -> Result<RecordCounts, StorageError> {
        let conn = self.conn()?;
        let activations: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        let switches: i64 = conn.query_row("SELECT COUNT(*) FROM switches", [], |row| row.get(0))?;
        Ok(RecordCounts {
            activations: usize::try_from(activations).unwrap_or(0),
            switches: usize::try_from(switches).unwrap_or(0),
        })
    }

    fn scan(&mut self) -> Result<ScanResult, StorageError> {
        self.query(&RecordQuery::all())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM events", [])?;
        tx.execute("DELETE FROM switches", [])?;
        tx.commit()?;
        Ok(())
    }

    fn usage(&mut self, range: TimeRange) -> Result<Vec<UsageStat>, StorageError> {
        let conn = self.conn()?;
        let start = ts_to_sql(range.start);
        let end = ts_to_sql(range.end);
        let mut acc = UsageAccumulator::new();

        let mut stmt = conn.prepare_cached(
            "SELECT app_name, category, COUNT(*) FROM events
             WHERE timestamp >= ?1 AND timestamp <= ?2 AND app_name IS NOT NULL
             GROUP BY app_name, category",
        )?;
        let rows = stmt.query_map(params![start, end], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (app, category, count) = row?;
            match category.parse::<Category>() {
                Ok(category) => {
                    acc.add_activations(&app, category, u64::try_from(count).unwrap_or(0))
                }
                Err(err) => tracing::warn!("skipping usage row for {}: {}", app, err),
            }
        }

        let mut stmt = conn.prepare_cached(
            "SELECT from_app, from_category, SUM(time_spent), COUNT(*) FROM switches
             WHERE timestamp >= ?1 AND timestamp <= ?2
             GROUP BY from_app, from_category",
        )?;
        let rows = stmt.query_map(params![start, end], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        for row in rows {
            let (app, category, seconds, count) = row?;
            match category.parse::<Category>() {
                Ok(category) => {
                    acc.add_focus(&app, category, seconds, u64::try_from(count).unwrap_or(0))
                }
                Err(err) => tracing::warn!("skipping usage row for {}: {}", app, err),
            }
        }

        Ok(acc.finish())
    }

    fn checkpoint(&mut self) -> Result<(), StorageError> {
        checkpoint_wal(self.conn()?)
    }

    fn export(&mut self, dest: &Path) -> Result<ArtifactExport, StorageError> {
        self.checkpoint()?;
        let counts = self.counts()?;
        let dir = self.dir();
        let files: Vec<String> = artifact_names(&self.path)?
            .into_iter()
            .filter(|name| dir.join(name).exists())
            .collect();
        fsutil::copy_files(&dir, dest, &files)?;
        Ok(ArtifactExport { files, counts })
    }

    fn replace_from(&mut self, src: &Path) -> Result<(), StorageError> {
        let names = artifact_names(&self.path)?;
        let main = src.join(&names[0]);
        if !main.exists() {
            return Err(StorageError::CorruptedArtifact {
                path: main,
                reason: "database file missing from snapshot".to_string(),
            });
        }

        self.close()?;
        let swapped = self.swap_files(src, &names);
        self.reopen_after(swapped)?;
        tracing::info!("replaced database from {}", src.display());
        Ok(())
    }

    fn move_files(&self, dest: &Path) -> Result<(), StorageError> {
        fs::create_dir_all(dest)?;
        let dir = self.dir();
        for name in artifact_names(&self.path)? {
            let from = dir.join(&name);
            if from.exists() {
                fs::rename(&from, dest.join(&name))?;
            }
        }
        fsutil::sync_dir(&dir);
        fsutil::sync_dir(dest);
        Ok(())
    }

    fn archive_to(&mut self, dest: &Path) -> Result<(), StorageError> {
        self.close()?;
        let moved = self.move_files(dest);
        self.reopen_after(moved)?;
        tracing::info!("archived database to {}", dest.display());
        Ok(())
    }
}

impl Drop for SqliteState {
    fn drop(&mut self) {
        if let Some(conn) = &self.conn
            && let Err(err) = checkpoint_wal(conn)
        {
            tracing::warn!("final wal checkpoint failed: {}", err);
        }
    }
}

/// Backend storing records in a SQLite database.
pub struct SqliteStore {
    path: PathBuf,
    worker: Worker<SqliteState>,
}

impl SqliteStore {
    /// Open (creating and migrating if needed) the database at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let state_path = path.clone();
        let worker = Worker::spawn("focuslog-sqlite", move || SqliteState::open(state_path))?;
        tracing::info!("sqlite store opened at {}", path.display());
        Ok(Self { path, worker })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StorageBackend for SqliteStore {
    async fn append(&self, record: Record) -> Result<(), StorageError> {
        let record = record.normalized();
        record
            .validate(Utc::now())
            .map_err(StorageError::Validation)?;
        self.worker.run(move |state| state.append(&record)).await?
    }

    async fn append_batch(&self, records: Vec<Record>) -> Result<BatchManifest, StorageError> {
        let now = Utc::now();
        let records: Vec<Record> = records.into_iter().map(Record::normalized).collect();
        let manifest = self
            .worker
            .run(move |state| state.write_batch(records, now))
            .await??;
        if !manifest.is_complete() {
            tracing::warn!(failed = manifest.failed.len(), "batch append rolled back");
        }
        Ok(manifest)
    }

    async fn query(&self, query: RecordQuery) -> Result<Vec<Record>, StorageError> {
        let result = self.worker.run(move |state| state.query(&query)).await??;
        Ok(result.records)
    }

    async fn usage_aggregate(&self, range: TimeRange) -> Result<Vec<UsageStat>, StorageError> {
        self.worker.run(move |state| state.usage(range)).await?
    }

    fn identity(&self) -> BackendKind {
        BackendKind::Relational
    }
}

#[async_trait]
impl ManagedBackend for SqliteStore {
    async fn get(&self, id: Ulid) -> Result<Option<Record>, StorageError> {
        self.worker.run(move |state| state.get(id)).await?
    }

    async fn remove(&self, id: Ulid) -> Result<bool, StorageError> {
        self.worker.run(move |state| state.remove(id)).await?
    }

    async fn counts(&self) -> Result<RecordCounts, StorageError> {
        self.worker.run(|state| state.counts()).await?
    }

    async fn scan(&self) -> Result<ScanResult, StorageError> {
        self.worker.run(|state| state.scan()).await?
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.worker.run(|state| state.clear()).await?
    }

    async fn checkpoint(&self) -> Result<(), StorageError> {
        self.worker.run(|state| state.checkpoint()).await?
    }

    async fn export_artifacts(&self, dest: &Path) -> Result<ArtifactExport, StorageError> {
        let dest = dest.to_path_buf();
        self.worker.run(move |state| state.export(&dest)).await?
    }

    async fn replace_artifacts(&self, src: &Path) -> Result<(), StorageError> {
        let src = src.to_path_buf();
        self.worker.run(move |state| state.replace_from(&src)).await?
    }

    async fn archive_artifacts(&self, dest: &Path) -> Result<(), StorageError> {
        let dest = dest.to_path_buf();
        self.worker.run(move |state| state.archive_to(&dest)).await?
    }

    fn load_progress(&self) -> LoadProgress {
        LoadProgress::completed(0)
    }
}
