// ABOUTME: Error type for parsing model labels stored as text (categories, kinds, backends).
// ABOUTME: Raised when a stored label does not name any known variant.

use thiserror::Error;

/// Errors produced while converting stored labels back into model enums.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("unknown category: {0}")]
    UnknownCategory(String),

    #[error("unknown record kind: {0}")]
    UnknownKind(String),

    #[error("unknown backend: {0}")]
    UnknownBackend(String),
}
