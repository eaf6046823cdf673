//! Global atomic counters for Berth.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single `tracing::info!`
//! event (the CLI does so before exiting).

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    deploys_committed: AtomicU64,
    deploys_rolled_back: AtomicU64,
    deploys_faulted: AtomicU64,
    validations_run: AtomicU64,
    installs_started: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub deploys_committed: u64,
    pub deploys_rolled_back: u64,
    pub deploys_faulted: u64,
    pub validations_run: u64,
    pub installs_started: u64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            deploys_committed: AtomicU64::new(0),
            deploys_rolled_back: AtomicU64::new(0),
            deploys_faulted: AtomicU64::new(0),
            validations_run: AtomicU64::new(0),
            installs_started: AtomicU64::new(0),
        }
    }

    pub fn inc_deploys_committed(&self) {
        self.deploys_committed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "deploys_committed", "counter incremented");
    }

    pub fn inc_deploys_rolled_back(&self) {
        self.deploys_rolled_back.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "deploys_rolled_back", "counter incremented");
    }

    pub fn inc_deploys_faulted(&self) {
        self.deploys_faulted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "deploys_faulted", "counter incremented");
    }

    pub fn inc_validations(&self) {
        self.validations_run.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "validations_run", "counter incremented");
    }

    pub fn inc_installs(&self) {
        self.installs_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "installs_started", "counter incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            deploys_committed: self.deploys_committed.load(Ordering::Relaxed),
            deploys_rolled_back: self.deploys_rolled_back.load(Ordering::Relaxed),
            deploys_faulted: self.deploys_faulted.load(Ordering::Relaxed),
            validations_run: self.validations_run.load(Ordering::Relaxed),
            installs_started: self.installs_started.load(Ordering::Relaxed),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            deploys_committed = s.deploys_committed,
            deploys_rolled_back = s.deploys_rolled_back,
            deploys_faulted = s.deploys_faulted,
            validations_run = s.validations_run,
            installs_started = s.installs_started,
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.deploys_committed.store(0, Ordering::Relaxed);
        self.deploys_rolled_back.store(0, Ordering::Relaxed);
        self.deploys_faulted.store(0, Ordering::Relaxed);
        self.validations_run.store(0, Ordering::Relaxed);
        self.installs_started.store(0, Ordering::Relaxed);
    }
}
