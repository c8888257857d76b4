//! Agent error types.

use armada_registry::RegistryError;
use thiserror::Error;

/// Failures reported by a [`crate::UnitExecutor`].
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("unit not loaded: {0}")]
    NotLoaded(String),

    #[error("invalid unit {unit}: {reason}")]
    Invalid { unit: String, reason: String },

    #[error("{op} {unit} failed: {reason}")]
    Failed {
        op: &'static str,
        unit: String,
        reason: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Another machine holds the unit's heartbeat.
    #[error("unit {unit} is owned elsewhere: {reason}")]
    OwnedElsewhere { unit: String, reason: String },

    #[error("no unit file for {0}")]
    MissingUnitFile(String),

    #[error("spool error: {0}")]
    Spool(#[from] std::io::Error),
}

pub type AgentResult<T> = Result<T, AgentError>;

/// Rejections from the task manager.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    /// A chain for this unit is still running.
    #[error("task chain already in flight for {0}")]
    Busy(String),

    #[error("empty task chain for {0}")]
    EmptyChain(String),
}

pub type TaskResult<T> = Result<T, TaskError>;
