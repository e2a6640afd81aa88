//! In-process lease store.
//!
//! Behaves like a single-node etcd for the four primitives the heartbeat loop
//! uses: leases expire on `tokio::time::Instant` (so paused-clock tests see
//! real expiry), keys attached to an expired lease disappear with it, and a
//! write against an unknown lease is rejected.
//!
//! Stores are addressed as `memory://<name>`; every connection to the same
//! name shares one instance for the life of the process. Fault injection
//! (`fail_next`, `set_available`, `revoke`) lets callers exercise the
//! heartbeat loop's error paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tokio::time::Instant;
use tracing::debug;

use crate::config::StoreConfig;
use crate::error::{RegistryError, Result};

use super::{Connect, CoordinationStore, LeaseId};

/// Named stores shared across `memory://` connections.
static NAMED_STORES: Lazy<Mutex<HashMap<String, MemoryStore>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

const SCHEME: &str = "memory://";

/// Store primitive, used for call accounting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Grant,
    Put,
    KeepAlive,
    Delete,
}

#[derive(Debug)]
struct LeaseRecord {
    ttl: Duration,
    expires_at: Instant,
}

#[derive(Debug)]
struct KeyRecord {
    value: String,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct Inner {
    available: bool,
    next_lease: i64,
    leases: HashMap<LeaseId, LeaseRecord>,
    keys: HashMap<String, KeyRecord>,
    pending_failures: HashMap<StoreOp, u32>,
    calls: HashMap<StoreOp, u64>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            available: true,
            next_lease: 1,
            leases: HashMap::new(),
            keys: HashMap::new(),
            pending_failures: HashMap::new(),
            calls: HashMap::new(),
        }
    }
}

impl Inner {
    /// Account for a call and decide whether it should fail.
    fn begin(&mut self, op: StoreOp) -> std::result::Result<(), String> {
        *self.calls.entry(op).or_insert(0) += 1;
        self.purge_expired();

        if !self.available {
            return Err("store unreachable".to_string());
        }
        if let Some(remaining) = self.pending_failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err("injected failure".to_string());
            }
        }
        Ok(())
    }

    fn purge_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            self.drop_lease(id);
            debug!(lease = %id, "Memory store lease expired");
        }
    }

    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let existed = self.leases.remove(&id).is_some();
        self.keys.retain(|_, record| record.lease != Some(id));
        existed
    }
}

/// In-process [`CoordinationStore`] with lease expiry and fault injection.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Create a private, unnamed store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the shared store registered under `name`.
    pub fn named(name: &str) -> Self {
        let mut stores = NAMED_STORES.lock().unwrap_or_else(|e| e.into_inner());
        stores.entry(name.to_string()).or_default().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current value of `key`, if present and its lease is alive.
    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.lock();
        inner.purge_expired();
        inner.keys.get(key).map(|record| record.value.clone())
    }

    /// Lease attached to `key`, if any.
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        let mut inner = self.lock();
        inner.purge_expired();
        inner.keys.get(key).and_then(|record| record.lease)
    }

    /// Time left before `lease` expires.
    #[cfg(test)]
    fn time_to_live(&self, lease: LeaseId) -> Option<Duration> {
        let mut inner = self.lock();
        inner.purge_expired();
        inner
            .leases
            .get(&lease)
            .map(|record| record.expires_at.saturating_duration_since(Instant::now()))
    }

    /// Number of live leases.
    #[cfg(test)]
    fn lease_count(&self) -> usize {
        let mut inner = self.lock();
        inner.purge_expired();
        inner.leases.len()
    }

    /// All live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut inner = self.lock();
        inner.purge_expired();
        let mut keys: Vec<String> = inner.keys.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// How many times `op` has been called, failed attempts included.
    pub fn calls(&self, op: StoreOp) -> u64 {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Make the next `count` calls of `op` fail.
    pub fn fail_next(&self, op: StoreOp, count: u32) {
        *self.lock().pending_failures.entry(op).or_insert(0) += count;
    }

    /// Simulate a partition (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    fn is_available(&self) -> bool {
        self.lock().available
    }

    /// Discard `lease` and its keys, as if it expired server-side.
    pub fn revoke(&self, lease: LeaseId) -> bool {
        self.lock().drop_lease(lease)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId> {
        let mut inner = self.lock();
        inner.begin(StoreOp::Grant).map_err(RegistryError::LeaseGrantFailed)?;

        if ttl_secs <= 0 {
            return Err(RegistryError::LeaseGrantFailed(format!(
                "invalid ttl {}",
                ttl_secs
            )));
        }

        let id = LeaseId::new(inner.next_lease);
        inner.next_lease += 1;
        let ttl = Duration::from_secs(ttl_secs.unsigned_abs());
        inner.leases.insert(
            id,
            LeaseRecord {
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(id)
    }

    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<()> {
        let mut inner = self.lock();
        let write_failed = |reason: String| RegistryError::WriteFailed {
            key: key.to_string(),
            reason,
        };
        inner.begin(StoreOp::Put).map_err(write_failed)?;

        if !inner.leases.contains_key(&lease) {
            return Err(write_failed(format!("lease {} not found", lease)));
        }
        inner.keys.insert(
            key.to_string(),
            KeyRecord {
                value: value.to_string(),
                lease: Some(lease),
            },
        );
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.lock();
        inner
            .begin(StoreOp::KeepAlive)
            .map_err(|reason| RegistryError::RenewalFailed { lease, reason })?;

        match inner.leases.get_mut(&lease) {
            Some(record) => {
                record.expires_at = Instant::now() + record.ttl;
                Ok(())
            }
            None => Err(RegistryError::LeaseNotFound(lease)),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.lock();
        inner
            .begin(StoreOp::Delete)
            .map_err(|reason| RegistryError::DeleteFailed {
                key: key.to_string(),
                reason,
            })?;
        inner.keys.remove(key);
        Ok(())
    }
}

#[async_trait]
impl Connect for MemoryStore {
    async fn connect(config: &StoreConfig) -> Result<Self> {
        let endpoint = config
            .endpoints
            .first()
            .ok_or_else(|| RegistryError::StoreUnavailable("no endpoints configured".into()))?;

        let name = endpoint.strip_prefix(SCHEME).ok_or_else(|| {
            RegistryError::StoreUnavailable(format!(
                "endpoint '{}' is not a {} address",
                endpoint, SCHEME
            ))
        })?;

        let store = Self::named(name);
        if !store.is_available() {
            return Err(RegistryError::StoreUnavailable(format!(
                "{}{} is unreachable",
                SCHEME, name
            )));
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn test_put_and_expire_with_lease() {
        let store = MemoryStore::new();
        let lease = store.grant(5).await.unwrap();
        store.put("/svc/a/1", "v", lease).await.unwrap();
        assert_eq!(store.get("/svc/a/1").as_deref(), Some("v"));
        assert_eq!(store.lease_of("/svc/a/1"), Some(lease));

        advance(Duration::from_secs(4)).await;
        assert!(store.get("/svc/a/1").is_some());

        advance(Duration::from_secs(1)).await;
        assert!(store.get("/svc/a/1").is_none());
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_resets_ttl() {
        let store = MemoryStore::new();
        let lease = store.grant(5).await.unwrap();
        store.put("k", "v", lease).await.unwrap();

        advance(Duration::from_secs(4)).await;
        store.keep_alive(lease).await.unwrap();
        assert_eq!(store.time_to_live(lease), Some(Duration::from_secs(5)));

        advance(Duration::from_secs(4)).await;
        assert!(store.get("k").is_some());
    }

    #[tokio::test]
    async fn test_keep_alive_unknown_lease() {
        let store = MemoryStore::new();
        let err = store.keep_alive(LeaseId::new(99)).await.unwrap_err();
        assert!(err.is_lease_lost());
    }

    #[tokio::test]
    async fn test_put_requires_live_lease() {
        let store = MemoryStore::new();
        let err = store.put("k", "v", LeaseId::new(3)).await.unwrap_err();
        assert!(matches!(err, RegistryError::WriteFailed { .. }));
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_revoke_removes_attached_keys() {
        let store = MemoryStore::new();
        let lease = store.grant(60).await.unwrap();
        store.put("a", "1", lease).await.unwrap();
        store.put("b", "2", lease).await.unwrap();

        assert!(store.revoke(lease));
        assert!(store.keys().is_empty());
        assert!(!store.revoke(lease));
    }

    #[tokio::test]
    async fn test_fail_next_and_call_counts() {
        let store = MemoryStore::new();
        store.fail_next(StoreOp::Grant, 2);

        assert!(store.grant(10).await.is_err());
        assert!(store.grant(10).await.is_err());
        assert!(store.grant(10).await.is_ok());
        assert_eq!(store.calls(StoreOp::Grant), 3);
        assert_eq!(store.calls(StoreOp::Delete), 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_op() {
        let store = MemoryStore::new();
        let lease = store.grant(10).await.unwrap();
        store.set_available(false);

        assert!(matches!(
            store.keep_alive(lease).await,
            Err(RegistryError::RenewalFailed { .. })
        ));
        assert!(matches!(
            store.delete("k").await,
            Err(RegistryError::DeleteFailed { .. })
        ));

        store.set_available(true);
        assert!(store.keep_alive(lease).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_named_stores_are_shared() {
        let config = StoreConfig::with_endpoints(["memory://store-tests-shared"]);
        let a = MemoryStore::connect(&config).await.unwrap();
        let b = MemoryStore::connect(&config).await.unwrap();

        let lease = a.grant(10).await.unwrap();
        a.put("shared", "yes", lease).await.unwrap();
        assert_eq!(b.get("shared").as_deref(), Some("yes"));
    }

    #[tokio::test]
    async fn test_connect_rejects_foreign_or_unreachable() {
        let config = StoreConfig::with_endpoints(["http://127.0.0.1:2379"]);
        assert!(matches!(
            MemoryStore::connect(&config).await,
            Err(RegistryError::StoreUnavailable(_))
        ));

        let config = StoreConfig::with_endpoints(Vec::<String>::new());
        assert!(matches!(
            MemoryStore::connect(&config).await,
            Err(RegistryError::StoreUnavailable(_))
        ));

        MemoryStore::named("store-tests-down").set_available(false);
        let config = StoreConfig::with_endpoints(["memory://store-tests-down"]);
        assert!(matches!(
            MemoryStore::connect(&config).await,
            Err(RegistryError::StoreUnavailable(_))
        ));
    }
}
