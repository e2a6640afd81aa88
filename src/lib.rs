//! Registrar - lease-backed service registration with heartbeat renewal
//!
//! Advertises a service instance in a coordination store (etcd or the
//! in-process [`store::MemoryStore`]) under a TTL lease, renews the lease
//! every `ttl / 3`, and deletes the key on deregistration.

pub mod config;
pub mod error;
pub mod registry;
pub mod store;
pub mod utils;

pub use config::{NodeData, RegistrationConfig, StoreConfig};
pub use error::{RegistryError, Result};
pub use registry::{Registration, RegistrationState};
