//! Heartbeat loop: lease acquisition, periodic renewal, and cleanup.

use std::future::Future;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::LeaseLossPolicy;
use crate::error::{RegistryError, Result};
use crate::store::{CoordinationStore, LeaseId};

use super::handle::{Registration, RegistrationState};

/// Resolves once cancellation is requested or the handle is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        let requested = *rx.borrow_and_update();
        if requested || rx.changed().await.is_err() {
            return;
        }
    }
}

/// One run of the heartbeat loop. Owns the lease id for its lifetime.
pub(super) struct Heartbeat<'a, S> {
    reg: &'a Registration<S>,
    lease: Option<LeaseId>,
}

impl<'a, S: CoordinationStore> Heartbeat<'a, S> {
    pub(super) fn new(reg: &'a Registration<S>) -> Self {
        Self { reg, lease: None }
    }

    pub(super) async fn run(mut self) -> Result<()> {
        let reg = self.reg;
        let mut cancel_rx = reg.cancellation();

        if *cancel_rx.borrow_and_update() {
            info!(key = %reg.key, "Deregistered before registration started");
            reg.publish(RegistrationState::Deregistered);
            return Ok(());
        }

        info!(
            key = %reg.key,
            ttl_secs = reg.lease_ttl_secs,
            interval_ms = reg.interval.as_millis() as u64,
            "Registering service"
        );

        if let Err(e) = self.tick().await {
            error!(key = %reg.key, error = %e, "Initial registration failed, retrying next tick");
        }

        let mut ticker = interval_at(Instant::now() + reg.interval, reg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel_rx) => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(key = %reg.key, error = %e, "Heartbeat tick failed");
                    }
                }
            }
        }

        drop(ticker);
        self.remove_key().await;
        reg.publish(RegistrationState::Deregistered);
        info!(key = %reg.key, "Heartbeat loop stopped");
        Ok(())
    }

    /// Grant + put if no lease is held, then renew once.
    ///
    /// Only a failed grant is returned; write and renewal failures are
    /// logged here and the lease is kept.
    async fn tick(&mut self) -> Result<()> {
        let reg = self.reg;
        reg.stats.record_tick();

        let lease = match self.lease {
            Some(lease) => lease,
            None => self.acquire().await?,
        };

        let renewal = self
            .bounded(reg.store.keep_alive(lease), |reason| {
                RegistryError::RenewalFailed { lease, reason }
            })
            .await;

        match renewal {
            Ok(()) => {
                reg.stats.record_renewal();
                reg.publish(RegistrationState::Active(lease));
                debug!(key = %reg.key, lease = %lease, "Lease renewed");
            }
            Err(e) => {
                reg.stats.record_renewal_failure();
                warn!(key = %reg.key, lease = %lease, error = %e, "Lease keep-alive failed");

                if e.is_lease_lost() && reg.lease_loss == LeaseLossPolicy::Regrant {
                    warn!(key = %reg.key, lease = %lease, "Lease lost, granting a new one next tick");
                    self.lease = None;
                    reg.publish(RegistrationState::Unregistered);
                }
            }
        }
        Ok(())
    }

    async fn acquire(&mut self) -> Result<LeaseId> {
        let reg = self.reg;

        let lease = self
            .bounded(
                reg.store.grant(reg.lease_ttl_secs),
                RegistryError::LeaseGrantFailed,
            )
            .await
            .map_err(|e| {
                reg.stats.record_grant_failure();
                e
            })?;

        self.lease = Some(lease);
        reg.stats.record_grant();
        reg.publish(RegistrationState::Leased(lease));

        let write = self
            .bounded(reg.store.put(&reg.key, &reg.value, lease), |reason| {
                RegistryError::WriteFailed {
                    key: reg.key.clone(),
                    reason,
                }
            })
            .await;

        match write {
            Ok(()) => info!(key = %reg.key, lease = %lease, "Registration key written"),
            Err(e) => {
                reg.stats.record_write_failure();
                warn!(key = %reg.key, lease = %lease, error = %e, "Failed to write registration key");
            }
        }
        Ok(lease)
    }

    /// Best-effort delete, issued exactly once per loop.
    async fn remove_key(&self) {
        let reg = self.reg;
        let delete = self
            .bounded(reg.store.delete(&reg.key), |reason| {
                RegistryError::DeleteFailed {
                    key: reg.key.clone(),
                    reason,
                }
            })
            .await;

        match delete {
            Ok(()) => info!(key = %reg.key, "Registration key deleted"),
            Err(e) => error!(
                key = %reg.key,
                error = %e,
                "Failed to delete registration key, leaving it to lease expiry"
            ),
        }
    }

    /// Apply the per-call operation timeout.
    async fn bounded<T, F>(
        &self,
        op: F,
        on_timeout: impl FnOnce(String) -> RegistryError,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let limit = self.reg.operation_timeout;
        match tokio::time::timeout(limit, op).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout(format!("timed out after {:?}", limit))),
        }
    }
}
