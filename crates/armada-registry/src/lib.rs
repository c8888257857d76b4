//! armada-registry — typed cluster state over the coordination store.
//!
//! # Architecture
//!
//! ```text
//! Registry (trait)
//!   ├── StoreRegistry     authoritative; every call maps to store reads/writes
//!   └── InMemoryRegistry  leader-side mirror used by the RPC fast path
//!
//! LeaseManager   TTL lease on a single key (engine leadership)
//! EventStream    store watch → cluster-significant RegistryEvents
//! Monitor/Heart  periodic machine presence beats
//! ```
//!
//! # Key layout
//!
//! ```text
//! <prefix>machines/<id>/object          MachineState (TTL)
//! <prefix>machines/<id>/metadata/<key>  dynamic metadata
//! <prefix>job/<name>/object             unit file + initial target state
//! <prefix>job/<name>/target-state       target state
//! <prefix>job/<name>/target             bound machine id
//! <prefix>job/<name>/targets/<id>       bindings of a global unit
//! <prefix>state/<name>                  UnitState (TTL)
//! <prefix>heartbeat/<name>              owning machine id (TTL)
//! <prefix>engine-leader                 engine lease (TTL)
//! ```

pub mod error;
pub mod event;
pub mod heart;
pub mod keys;
pub mod lease;
pub mod mirror;
pub mod registry;
pub mod store_registry;

pub use error::{ErrorKind, RegistryError, RegistryResult};
pub use event::{EventStream, RegistryEvent};
pub use heart::{Heart, MachineHeart, Monitor, MonitorError};
pub use keys::{KeyRef, KeySpace};
pub use lease::{ENGINE_LEASE, Lease, LeaseManager};
pub use mirror::InMemoryRegistry;
pub use registry::{Registry, assemble_jobs};
pub use store_registry::StoreRegistry;
