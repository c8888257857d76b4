//! armada-agent — per-machine unit supervision.
//!
//! Each machine runs one agent. It reads the schedule entries that target
//! it, drives the local executor to match, claims ownership of every
//! running unit with a TTL heartbeat, and reports what the executor sees.
//!
//! # Architecture
//!
//! ```text
//! Registry ──desired──┐
//!                     ▼
//!              AgentReconciler ──TaskChain──► TaskManager ──► Agent
//!                     ▲                                        │
//! executor ──current──┘                          load/start/stop/unload
//!                                                              ▼
//!                                                       UnitExecutor
//!                                                 (FakeExecutor, ProcessExecutor)
//!
//! UnitExecutor ──► UnitStateGenerator ──mpsc──► UnitStatePublisher ──► Registry
//! ```

pub mod agent;
pub mod cache;
pub mod error;
pub mod executor;
pub mod generator;
pub mod process;
pub mod publisher;
pub mod reconciler;
pub mod spool;
pub mod task;

pub use agent::{Agent, CurrentUnit, DEFAULT_AGENT_TTL, runnable_on};
pub use cache::AgentCache;
pub use error::{AgentError, AgentResult, ExecutorError, ExecutorResult, TaskError, TaskResult};
pub use executor::{FakeExecutor, FakeOp, UnitExecutor};
pub use generator::{UnitStateGenerator, UnitStateHeartbeat};
pub use process::ProcessExecutor;
pub use publisher::{DEFAULT_PUBLISH_INTERVAL, UnitStatePublisher};
pub use reconciler::{AgentReconciler, calculate_task_chain, calculate_task_chains};
pub use spool::UnitSpool;
pub use task::{Task, TaskChain, TaskHandle, TaskKind, TaskManager, TaskOutcome};
