//! armada-engine — the cluster-wide scheduler.
//!
//! One engine per cluster holds the `engine-leader` lease and owns every
//! schedule write.
//!
//! # Architecture
//!
//! ```text
//! Registry ──snapshot──► ClusterState ──calculate_tasks──► Vec<EngineTask>
//!                              ▲                                │
//!                          placement                   lease guard, apply
//!                  (MachineID, metadata, peers,                 │
//!                   conflicts, global, least load)              ▼
//!                                                     Registry::schedule_unit /
//!                                                     Registry::unschedule_unit
//! ```

pub mod cluster;
pub mod engine;
pub mod error;
pub mod placement;
pub mod reconciler;

pub use cluster::ClusterState;
pub use engine::{DEFAULT_RECONCILE_INTERVAL, Engine, EngineState};
pub use error::{EngineError, EngineResult};
pub use placement::Rejection;
pub use reconciler::{EngineTask, TaskKind, calculate_tasks};
