//! armada-core — shared types for the Armada unit orchestrator.
//!
//! Everything the registry, engine, and agent exchange lives here:
//!
//! ```text
//! UnitFile ──► Unit (desired) ──► ScheduledUnit (engine decision)
//!    │                                  │
//!    └── Requirements ([X-Armada])      └── UnitState (agent observation)
//!
//! MachineState ── advertised by every machine, TTL-bound in the store
//! ```
//!
//! Values are JSON-encoded when stored; field names are stable.

pub mod config;
pub mod error;
pub mod glob;
pub mod job;
pub mod machine;
pub mod requirements;
pub mod unit;

pub use config::{DaemonConfig, StoreBackend};
pub use error::{UnitError, UnitResult};
pub use glob::glob_match;
pub use job::{Job, JobState, ScheduledUnit, Unit, UnitState, determine_job_state};
pub use machine::{Capability, MachineState, parse_metadata};
pub use requirements::{PLACEMENT_SECTION, Requirements, validate_requirements};
pub use unit::{UnitFile, UnitNameInfo, UnitOption, validate_unit_name};
