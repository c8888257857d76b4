//! Error types for store operations.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("key already exists: {0}")]
    AlreadyExists(String),

    #[error("compare failed on {key}: {reason}")]
    CompareFailed { key: String, reason: String },

    /// The requested watch revision has been compacted away.
    #[error("event index {0} has been cleared")]
    IndexCleared(u64),

    #[error("request timed out")]
    Timeout,

    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with something that could not be understood.
    #[error("malformed store response: {0}")]
    Malformed(String),
}

impl StoreError {
    /// Whether retrying the same request could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout | StoreError::Unavailable(_))
    }
}
