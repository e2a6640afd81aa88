//! Registration handle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{LeaseLossPolicy, RegistrationConfig};
use crate::error::{RegistryError, Result};
use crate::store::{Connect, CoordinationStore, LeaseId};

use super::heartbeat::Heartbeat;
use super::stats::{HeartbeatStats, StatsSnapshot};

/// Lifecycle of one registration.
///
/// `Unregistered → Leased → Active → Deregistered`. Under
/// [`LeaseLossPolicy::Regrant`] a lost lease moves `Active` back to
/// `Unregistered` until the next tick grants a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// No lease held.
    Unregistered,
    /// Lease granted and key write attempted; not yet renewed.
    Leased(LeaseId),
    /// Lease renewed at least once.
    Active(LeaseId),
    /// Heartbeat loop finished its cleanup. Terminal.
    Deregistered,
}

impl RegistrationState {
    /// Lease currently held, if any.
    pub fn lease(&self) -> Option<LeaseId> {
        match self {
            RegistrationState::Leased(id) | RegistrationState::Active(id) => Some(*id),
            RegistrationState::Unregistered | RegistrationState::Deregistered => None,
        }
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationState::Unregistered => write!(f, "unregistered"),
            RegistrationState::Leased(id) => write!(f, "leased({})", id),
            RegistrationState::Active(id) => write!(f, "active({})", id),
            RegistrationState::Deregistered => write!(f, "deregistered"),
        }
    }
}

/// Handle for a single registered service instance.
///
/// Created with [`Registration::connect`] or [`Registration::new`]; the store
/// is untouched until [`register`](Registration::register) runs. The heartbeat
/// loop owns the lease id; the handle only exposes the cancellation signal
/// and read-only state, so `deregister` can be called from any task while
/// `register` is running.
pub struct Registration<S> {
    pub(super) store: Arc<S>,
    pub(super) key: String,
    pub(super) value: String,
    pub(super) lease_ttl_secs: i64,
    pub(super) interval: Duration,
    pub(super) operation_timeout: Duration,
    pub(super) lease_loss: LeaseLossPolicy,
    pub(super) stats: HeartbeatStats,
    started: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    state_tx: watch::Sender<RegistrationState>,
}

impl<S: Connect> Registration<S> {
    /// Connect to the store named by `config.store` and build a handle.
    ///
    /// Fails with `StoreUnavailable` if the store cannot be reached; no loop
    /// is started in that case.
    pub async fn connect(config: RegistrationConfig) -> Result<Self> {
        config.validate()?;
        let store = S::connect(&config.store).await?;
        Self::new(config, Arc::new(store))
    }
}

impl<S: CoordinationStore> Registration<S> {
    /// Build a handle over an existing (possibly shared) store connection.
    pub fn new(config: RegistrationConfig, store: Arc<S>) -> Result<Self> {
        config.validate()?;
        let value = serde_json::to_string(&config.node_data)?;
        let (cancel_tx, _) = watch::channel(false);
        let (state_tx, _) = watch::channel(RegistrationState::Unregistered);

        Ok(Self {
            store,
            key: config.key(),
            value,
            lease_ttl_secs: config.lease_ttl_secs(),
            interval: config.heartbeat_interval(),
            operation_timeout: config.store.operation_timeout,
            lease_loss: config.lease_loss,
            stats: HeartbeatStats::default(),
            started: AtomicBool::new(false),
            cancel_tx,
            state_tx,
        })
    }

    /// Register and keep the registration alive until [`deregister`] is called.
    ///
    /// Performs the initial grant + put + keep-alive, then renews every
    /// `ttl / 3`. Store failures inside the loop are logged and counted, never
    /// returned. Resolves once the key has been deleted (best effort).
    ///
    /// [`deregister`]: Registration::deregister
    pub async fn register(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RegistryError::AlreadyRegistered(self.key.clone()));
        }
        Heartbeat::new(self).run().await
    }

    /// Run [`register`](Registration::register) on its own tokio task.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<Result<()>>
    where
        S: 'static,
    {
        tokio::spawn(async move { self.register().await })
    }

    /// Request deregistration and return immediately.
    ///
    /// Idempotent. The key is deleted asynchronously by the heartbeat loop;
    /// use [`wait_deregistered`](Registration::wait_deregistered) to wait for it.
    pub fn deregister(&self) -> Result<()> {
        if !self.cancel_tx.send_replace(true) {
            info!(key = %self.key, "Deregistration requested");
        } else {
            debug!(key = %self.key, "Deregistration already requested");
        }
        Ok(())
    }

    /// Resolves once the heartbeat loop has finished its cleanup.
    ///
    /// Never resolves if `register` is never called.
    pub async fn wait_deregistered(&self) {
        let mut rx = self.state_tx.subscribe();
        loop {
            let done = *rx.borrow_and_update() == RegistrationState::Deregistered;
            if done || rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Registration key: `{prefix}/{service}/{node}`.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Serialized node data written under the key.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Interval between heartbeat ticks (`ttl / 3`).
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> RegistrationState {
        *self.state_tx.borrow()
    }

    /// Lease currently held by the heartbeat loop.
    pub fn lease_id(&self) -> Option<LeaseId> {
        self.state().lease()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<RegistrationState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether `register` has been called and its loop has not finished.
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && self.state() != RegistrationState::Deregistered
    }

    pub fn is_deregister_requested(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub(super) fn cancellation(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    pub(super) fn publish(&self, state: RegistrationState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(key = %self.key, from = %previous, to = %state, "Registration state changed");
        }
    }
}

impl<S> fmt::Debug for Registration<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("key", &self.key)
            .field("state", &*self.state_tx.borrow())
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
