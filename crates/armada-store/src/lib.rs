//! armada-store — the coordination substrate under the registry.
//!
//! A [`Store`] is a hierarchical key-value store with compare-and-swap
//! writes, TTL keys, and ordered watches keyed by a global revision.
//!
//! # Backends
//!
//! ```text
//! Store (trait)
//!   ├── MemStore   in-process; TTL on tokio's clock, bounded event history
//!   └── EtcdStore  etcd v2 keys API over HTTP; endpoint rotation + backoff
//! ```
//!
//! Both are `Clone + Send + Sync` and can be shared across tasks.

pub mod error;
pub mod etcd;
pub mod kv;
pub mod memory;
pub mod retry;

pub use error::{StoreError, StoreResult};
pub use etcd::{EtcdConfig, EtcdStore};
pub use kv::{Condition, KeyValue, PutOptions, Store, WatchEvent, WatchEventKind};
pub use memory::MemStore;
pub use retry::RetryPolicy;
