//! Heartbeat counters.
//!
//! Loop failures never surface as errors, so these counters are how a caller
//! tells a healthy registration from one that is silently failing renewal.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct HeartbeatStats {
    ticks: AtomicU64,
    grants: AtomicU64,
    grant_failures: AtomicU64,
    write_failures: AtomicU64,
    renewals: AtomicU64,
    renewal_failures: AtomicU64,
}

/// Point-in-time copy of [`HeartbeatStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Heartbeat passes, the initial one included.
    pub ticks: u64,
    /// Leases granted.
    pub grants: u64,
    pub grant_failures: u64,
    /// Puts of the registration key that failed.
    pub write_failures: u64,
    /// Successful keep-alive round-trips.
    pub renewals: u64,
    pub renewal_failures: u64,
}

impl HeartbeatStats {
    pub(crate) fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_grant(&self) {
        self.grants.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_grant_failure(&self) {
        self.grant_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_renewal(&self) {
        self.renewals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_renewal_failure(&self) {
        self.renewal_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            grants: self.grants.load(Ordering::Relaxed),
            grant_failures: self.grant_failures.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            renewals: self.renewals.load(Ordering::Relaxed),
            renewal_failures: self.renewal_failures.load(Ordering::Relaxed),
        }
    }
}
