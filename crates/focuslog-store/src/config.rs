// ABOUTME: Configuration for the storage layer: data home, load tuning, disk reserve, retention and migration.
// ABOUTME: Defaults, then an optional focuslog.yaml in the home directory, then FOCUSLOG_* environment variables.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use chrono::Duration;
use serde::Deserialize;
use thiserror::Error;

use crate::backup::RetentionPolicy;
use crate::disk::SpaceProbe;
use crate::file_store::FileStoreOptions;
use crate::migration::MigrationSettings;

pub const CONFIG_FILE: &str = "focuslog.yaml";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} is not a valid number: {value:?}")]
    InvalidNumber { name: &'static str, value: String },

    #[error("{name} must be greater than zero")]
    MustBePositive { name: &'static str },

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Optional overrides read from `focuslog.yaml`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileOverrides {
    min_free_mb: Option<u64>,
    load_batch: Option<usize>,
    recent_window_minutes: Option<i64>,
    backup_keep: Option<usize>,
    backup_max_age_days: Option<i64>,
    migration_batch: Option<usize>,
    migration_sample: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub home: PathBuf,
    pub min_free_bytes: u64,
    pub load_batch_size: usize,
    pub recent_window: Duration,
    pub retention: RetentionPolicy,
    pub migration: MigrationSettings,
}

const MB: u64 = 1024 * 1024;

impl StoreConfig {
    /// Defaults rooted at `home`.
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            min_free_bytes: 64 * MB,
            load_batch_size: 10,
            recent_window: Duration::minutes(120),
            retention: RetentionPolicy::default(),
            migration: MigrationSettings::default(),
        }
    }

    /// Load configuration with sensible defaults.
    ///
    /// Environment variables:
    /// - FOCUSLOG_HOME: data directory (default: ~/.focuslog)
    /// - FOCUSLOG_MIN_FREE_MB: free space kept in reserve (default: 64)
    /// - FOCUSLOG_LOAD_BATCH: files per background load batch (default: 10)
    /// - FOCUSLOG_RECENT_WINDOW_MINUTES: window loaded first (default: 120)
    /// - FOCUSLOG_BACKUP_KEEP: snapshots retained (default: 5)
    /// - FOCUSLOG_BACKUP_MAX_AGE_DAYS: snapshot age limit (default: 30)
    /// - FOCUSLOG_MIGRATION_BATCH: records per migration batch (default: 200)
    /// - FOCUSLOG_MIGRATION_SAMPLE: records compared after migration (default: 100)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let home = lookup("FOCUSLOG_HOME")
            .filter(|h| !h.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                lookup("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".focuslog")
            });

        let mut config = Self::new(home);
        let file = config.home.join(CONFIG_FILE);
        config.apply_file(&file)?;
        config.apply_env(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let overrides: FileOverrides = if text.trim().is_empty() {
            FileOverrides::default()
        } else {
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        };

        if let Some(mb) = overrides.min_free_mb {
            self.min_free_bytes = mb.saturating_mul(MB);
        }
        if let Some(n) = overrides.load_batch {
            self.load_batch_size = n;
        }
        if let Some(minutes) = overrides.recent_window_minutes {
            self.recent_window = span("recent_window_minutes", minutes, Duration::try_minutes)?;
        }
        if let Some(n) = overrides.backup_keep {
            self.retention.max_snapshots = n;
        }
        if let Some(days) = overrides.backup_max_age_days {
            self.retention.max_age = span("backup_max_age_days", days, Duration::try_days)?;
        }
        if let Some(n) = overrides.migration_batch {
            self.migration.batch_size = n;
        }
        if let Some(n) = overrides.migration_sample {
            self.migration.sample_size = n;
        }
        tracing::debug!("applied overrides from {}", path.display());
        Ok(())
    }

    fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(mb) = number::<u64>(lookup, "FOCUSLOG_MIN_FREE_MB")? {
            self.min_free_bytes = mb.saturating_mul(MB);
        }
        if let Some(n) = number(lookup, "FOCUSLOG_LOAD_BATCH")? {
            self.load_batch_size = n;
        }
        if let Some(minutes) = number(lookup, "FOCUSLOG_RECENT_WINDOW_MINUTES")? {
            self.recent_window =
                span("FOCUSLOG_RECENT_WINDOW_MINUTES", minutes, Duration::try_minutes)?;
        }
        if let Some(n) = number(lookup, "FOCUSLOG_BACKUP_KEEP")? {
            self.retention.max_snapshots = n;
        }
        if let Some(days) = number(lookup, "FOCUSLOG_BACKUP_MAX_AGE_DAYS")? {
            self.retention.max_age = span("FOCUSLOG_BACKUP_MAX_AGE_DAYS", days, Duration::try_days)?;
        }
        if let Some(n) = number(lookup, "FOCUSLOG_MIGRATION_BATCH")? {
            self.migration.batch_size = n;
        }
        if let Some(n) = number(lookup, "FOCUSLOG_MIGRATION_SAMPLE")? {
            self.migration.sample_size = n;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, bool); 5] = [
            ("load batch size", self.load_batch_size > 0),
            ("recent window", self.recent_window > Duration::zero()),
            ("snapshot retention count", self.retention.max_snapshots > 0),
            ("migration batch size", self.migration.batch_size > 0),
            ("migration sample size", self.migration.sample_size > 0),
        ];
        for (name, ok) in checks {
            if !ok {
                return Err(ConfigError::MustBePositive { name });
            }
        }
        Ok(())
    }

    pub fn records_dir(&self) -> PathBuf {
        self.home.join("records")
    }

    pub fn database_path(&self) -> PathBuf {
        self.home.join("focuslog.db")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.home.join("backups")
    }

    pub fn flag_path(&self) -> PathBuf {
        self.home.join("backend.json")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.home.join("archive")
    }

    pub fn migrations_dir(&self) -> PathBuf {
        self.home.join("migrations")
    }

    pub fn file_store_options(&self, probe: Arc<dyn SpaceProbe>) -> FileStoreOptions {
        FileStoreOptions {
            load_batch_size: self.load_batch_size,
            recent_window: self.recent_window,
            min_free_bytes: self.min_free_bytes,
            probe,
        }
    }
}

fn number<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name).filter(|v| !v.trim().is_empty()) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
    }
}

/// Converts a count of units into a duration, rejecting counts chrono cannot represent.
fn span(
    name: &'static str,
    count: i64,
    make: fn(i64) -> Option<Duration>,
) -> Result<Duration, ConfigError> {
    make(count).ok_or_else(|| ConfigError::InvalidNumber {
        name,
        value: count.to_string(),
    })
}
