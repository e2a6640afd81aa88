//! Coordination store abstraction.
//!
//! The registration lifecycle only needs four primitives from the store:
//! grant a lease, write a key bound to a lease, renew a lease once, and delete
//! a key. Any store offering these is substitutable:
//! - [`EtcdStore`]: etcd v3 (feature `etcd`)
//! - [`MemoryStore`]: in-process store with real TTL expiry, used by tests and
//!   `memory://` endpoints

use std::fmt;

use async_trait::async_trait;

use crate::config::StoreConfig;
use crate::error::Result;

#[cfg(feature = "etcd")]
pub mod etcd;
pub mod memory;

#[cfg(feature = "etcd")]
pub use etcd::EtcdStore;
pub use memory::{MemoryStore, StoreOp};

/// Store-assigned lease identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(i64);

impl LeaseId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lease and key primitives consumed by the heartbeat loop.
///
/// Implementations must be safe to share between several registrations
/// (`&self` methods, `Send + Sync`). Each call is a single bounded round-trip;
/// the caller applies its own timeout on top.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Grant a lease that expires after `ttl_secs` unless renewed.
    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId>;

    /// Write `key = value`, attached to `lease`.
    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<()>;

    /// Renew `lease` once, resetting its TTL countdown.
    ///
    /// Returns `RegistryError::LeaseNotFound` when the store has discarded it.
    async fn keep_alive(&self, lease: LeaseId) -> Result<()>;

    /// Remove `key`, independent of its lease.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Stores that can be opened from a [`StoreConfig`].
#[async_trait]
pub trait Connect: CoordinationStore + Sized {
    /// Open a connection, failing with `RegistryError::StoreUnavailable`.
    async fn connect(config: &StoreConfig) -> Result<Self>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_id_display() {
        let id = LeaseId::new(7587862069837405202);
        assert_eq!(id.to_string(), "7587862069837405202");
        assert_eq!(id.get(), 7587862069837405202);
    }
}
