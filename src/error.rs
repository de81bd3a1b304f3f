use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the session API.
///
/// Every variant is returned to the immediate caller; nothing in the core
/// retries.
#[derive(Debug, Error)]
pub enum ScopeError {
    /// A dataset or selection key that is unknown, stale or evicted.
    #[error("{what} not found: {key}")]
    NotFound { what: &'static str, key: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("path escapes the data directory: {}", .0.display())]
    PathTraversal(PathBuf),

    /// The extraction adapter could not produce a bundle. The message is the
    /// adapter's own, unmodified.
    #[error("{0}")]
    UpstreamLoad(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ScopeError {
    pub fn dataset_not_found(key: impl ToString) -> Self {
        ScopeError::NotFound {
            what: "dataset",
            key: key.to_string(),
        }
    }

    pub fn selection_not_found(key: impl ToString) -> Self {
        ScopeError::NotFound {
            what: "selection",
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ScopeError::NotFound { .. })
    }
}

pub type ScopeResult<T> = Result<T, ScopeError>;
