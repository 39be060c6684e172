// ABOUTME: Identity of the storage backend that currently owns the records.
// ABOUTME: Persisted in the backend flag file and reported by the coordinator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Which backend holds the authoritative copy of the records.
/// `Hybrid` is only ever reported while a migration is moving data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    FileStore,
    Relational,
    Hybrid,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::FileStore => "file_store",
            BackendKind::Relational => "relational",
            BackendKind::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file_store" | "file-store" | "files" => Ok(BackendKind::FileStore),
            "relational" | "sqlite" => Ok(BackendKind::Relational),
            "hybrid" => Ok(BackendKind::Hybrid),
            other => Err(ModelError::UnknownBackend(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_cli_spellings() {
        assert_eq!("file-store".parse::<BackendKind>().unwrap(), BackendKind::FileStore);
        assert_eq!("sqlite".parse::<BackendKind>().unwrap(), BackendKind::Relational);
        assert!("postgres".parse::<BackendKind>().is_err());
    }
}
