//! Registry error taxonomy.

use armada_store::StoreError;
use thiserror::Error;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Coarse classification used by callers to pick a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Conflict,
    Precondition,
    Transient,
    Invalid,
    Fatal,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A compare-and-swap lost a race; re-read and try again later.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Leadership or ownership was lost.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::NotFound(_) => ErrorKind::NotFound,
            RegistryError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            RegistryError::Conflict(_) => ErrorKind::Conflict,
            RegistryError::Precondition(_) => ErrorKind::Precondition,
            RegistryError::Transient(_) => ErrorKind::Transient,
            RegistryError::Invalid(_) => ErrorKind::Invalid,
            RegistryError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Whether the caller's next tick may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict | ErrorKind::Transient)
    }

    /// HTTP status an API surface should answer with.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotFound => 404,
            ErrorKind::AlreadyExists => 409,
            ErrorKind::Conflict | ErrorKind::Precondition | ErrorKind::Transient => 503,
            ErrorKind::Invalid => 400,
            ErrorKind::Fatal => 500,
        }
    }
}

impl From<StoreError> for RegistryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(k) => RegistryError::NotFound(k),
            StoreError::AlreadyExists(k) => RegistryError::AlreadyExists(k),
            StoreError::CompareFailed { key, reason } => {
                RegistryError::Conflict(format!("{key}: {reason}"))
            }
            e @ (StoreError::Timeout | StoreError::Unavailable(_) | StoreError::IndexCleared(_)) => {
                RegistryError::Transient(e.to_string())
            }
            StoreError::Malformed(m) => RegistryError::Fatal(m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_kinds() {
        let cases = [
            (StoreError::NotFound("k".into()), ErrorKind::NotFound),
            (StoreError::AlreadyExists("k".into()), ErrorKind::AlreadyExists),
            (
                StoreError::CompareFailed { key: "k".into(), reason: "r".into() },
                ErrorKind::Conflict,
            ),
            (StoreError::Timeout, ErrorKind::Transient),
            (StoreError::Unavailable("down".into()), ErrorKind::Transient),
            (StoreError::Malformed("junk".into()), ErrorKind::Fatal),
        ];
        for (store_err, kind) in cases {
            assert_eq!(RegistryError::from(store_err).kind(), kind);
        }
    }

    #[test]
    fn status_codes_follow_kinds() {
        assert_eq!(RegistryError::NotFound("u".into()).status_code(), 404);
        assert_eq!(RegistryError::AlreadyExists("u".into()).status_code(), 409);
        assert_eq!(RegistryError::Conflict("u".into()).status_code(), 503);
        assert_eq!(RegistryError::Precondition("u".into()).status_code(), 503);
        assert_eq!(RegistryError::Transient("u".into()).status_code(), 503);
        assert_eq!(RegistryError::Fatal("u".into()).status_code(), 500);
    }

    #[test]
    fn only_conflicts_and_transients_retry() {
        assert!(RegistryError::Conflict("x".into()).is_retryable());
        assert!(RegistryError::Transient("x".into()).is_retryable());
        assert!(!RegistryError::Precondition("x".into()).is_retryable());
        assert!(!RegistryError::Fatal("x".into()).is_retryable());
    }
}
