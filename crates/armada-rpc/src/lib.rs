//! armada-rpc — the registry fast path through the engine leader.
//!
//! # Architecture
//!
//! ```text
//! Engine leader (GRPC)
//!   └── RpcServer  armada.RegistryService over tonic, JSON bodies
//!       └── LeaderRegistry
//!           ├── StoreRegistry     every write lands here first
//!           └── InMemoryRegistry  read cache, loaded on leadership
//!
//! Every machine
//!   └── RegistryMux
//!       ├── RpcRegistry    while the leader is GRPC-capable and ready
//!       └── StoreRegistry  otherwise, and for machine presence
//! ```
//!
//! The service is generated at build time from a manual definition, so
//! no protobuf toolchain is involved.

pub mod client;
pub mod codec;
pub mod error;
pub mod messages;
pub mod mux;
pub mod server;

/// Generated service stubs.
pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/armada.RegistryService.rs"));
}

pub use client::RpcRegistry;
pub use error::{RpcError, RpcResult};
pub use messages::ServingStatus;
pub use mux::RegistryMux;
pub use server::{DEFAULT_RPC_PORT, LeaderRegistry, RpcServer};
