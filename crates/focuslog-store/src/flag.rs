// ABOUTME: Durable record of which backend is authoritative, read at startup and written after migrations.
// ABOUTME: Written atomically; only the migration engine inside this crate may change it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use focuslog_core::BackendKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fsutil;

/// Errors reading or writing the backend flag.
#[derive(Debug, Error)]
pub enum FlagError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed backend flag: {0}")]
    Json(#[from] serde_json::Error),
}

/// Contents of the flag file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendFlag {
    pub backend: BackendKind,
    /// When the last successful migration to `backend` finished.
    #[serde(default)]
    pub migrated_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FlagStore {
    path: PathBuf,
}

impl FlagStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored flag, or `None` if no flag has been written yet.
    pub fn load(&self) -> Result<Option<BackendFlag>, FlagError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub(crate) fn store(
        &self,
        backend: BackendKind,
        migrated_at: Option<DateTime<Utc>>,
    ) -> Result<BackendFlag, FlagError> {
        let flag = BackendFlag {
            backend,
            migrated_at,
            updated_at: Utc::now(),
        };
        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("backend.json");
        fs::create_dir_all(&dir)?;
        fsutil::write_atomic(&dir, name, &serde_json::to_vec_pretty(&flag)?)?;
        tracing::info!(backend = %backend, "backend flag updated");
        Ok(flag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_flag_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = FlagStore::new(dir.path().join("backend.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn stored_flag_reads_back() {
        let dir = TempDir::new().unwrap();
        let store = FlagStore::new(dir.path().join("backend.json"));
        let now = Utc::now();
        store.store(BackendKind::Relational, Some(now)).unwrap();

        let flag = store.load().unwrap().unwrap();
        assert_eq!(flag.backend, BackendKind::Relational);
        assert_eq!(flag.migrated_at, Some(now));
    }

    #[test]
    fn garbage_flag_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backend.json");
        fs::write(&path, b"not json").unwrap();
        assert!(matches!(FlagStore::new(path).load(), Err(FlagError::Json(_))));
    }
}
