//! armadad — the Armada daemon.
//!
//! One process per machine. It advertises the machine, runs the engine
//! unless disabled, and runs the agent that drives the local executor.
//!
//! # Usage
//!
//! ```text
//! armadad --config /etc/armada/armadad.toml
//! armadad --store memory --metadata region=us-east --log-format json
//! ```

pub mod cli;
pub mod server;

pub use cli::{Cli, LogFormat};
pub use server::Server;
