//! Engine error types.

use armada_registry::RegistryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The lease moved or expired under us; nothing was written.
    #[error("engine leadership lost: {0}")]
    LeadershipLost(String),

    #[error("reconcile exceeded its deadline of {0:?}")]
    DeadlineExceeded(std::time::Duration),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl EngineError {
    /// Fatal registry errors end the leadership term.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Registry(RegistryError::Fatal(_)))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
