//! Error types for unit parsing and validation.

use thiserror::Error;

/// Result type alias for unit operations.
pub type UnitResult<T> = Result<T, UnitError>;

/// Errors raised while parsing or validating units.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnitError {
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("invalid unit name {0:?}")]
    InvalidName(String),

    #[error("unrecognized placement directive {0:?}")]
    UnknownDirective(String),

    #[error("invalid glob pattern {pattern:?}: {reason}")]
    Glob { pattern: String, reason: String },

    #[error("invalid target state {0:?}")]
    InvalidState(String),
}
