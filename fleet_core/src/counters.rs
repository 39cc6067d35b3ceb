//! Fleet-wide delivery counters.
//!
//! Mutated concurrently by every driver; each field is an independent atomic
//! so no increment is ever lost and no driver waits on another.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared outcome counters.
#[derive(Debug, Default)]
pub struct FleetCounters {
    generated: AtomicU64,
    sent: AtomicU64,
    ok: AtomicU64,
    not_ok: AtomicU64,
    errors: AtomicU64,
    recovered: AtomicU64,
    discarded: AtomicU64,
    finally_pending: AtomicU64,
    /// Gauge: events currently waiting for a retry sweep
    pending: AtomicU64,
    /// Highest publish latency seen during the run (ms)
    max_delay_ms: AtomicU64,
    /// Highest publish latency since the last status sample (ms)
    current_delay_ms: AtomicU64,
}

/// Point-in-time copy of [`FleetCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub generated: u64,
    pub sent: u64,
    pub ok: u64,
    pub not_ok: u64,
    pub errors: u64,
    pub recovered: u64,
    pub discarded: u64,
    pub finally_pending: u64,
    pub pending: u64,
    pub max_delay_ms: u64,
    pub current_delay_ms: u64,
}

impl CounterSnapshot {
    /// True when some delivery was refused or failed.
    pub fn has_failures(&self) -> bool {
        self.not_ok > 0 || self.errors > 0
    }
}

impl FleetCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_generated(&self, n: u64) {
        self.generated.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_sent(&self, n: u64) {
        self.sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_ok(&self, n: u64) {
        self.ok.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_not_ok(&self, n: u64) {
        self.not_ok.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_errors(&self, n: u64) {
        self.errors.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_recovered(&self, n: u64) {
        self.recovered.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_discarded(&self, n: u64) {
        self.discarded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_finally_pending(&self, n: u64) {
        self.finally_pending.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_pending(&self, n: u64) {
        self.pending.fetch_add(n, Ordering::Relaxed);
    }

    /// Lowers the pending gauge, saturating at zero.
    pub fn remove_pending(&self, n: u64) {
        let _ = self
            .pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| Some(p.saturating_sub(n)));
    }

    /// Folds one observed publish latency into both watermarks.
    pub fn record_delay(&self, delay_ms: u64) {
        self.max_delay_ms.fetch_max(delay_ms, Ordering::Relaxed);
        self.current_delay_ms.fetch_max(delay_ms, Ordering::Relaxed);
    }

    /// Returns the current-delay watermark and resets it to 0.
    pub fn take_current_delay(&self) -> u64 {
        self.current_delay_ms.swap(0, Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            generated: self.generated.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            ok: self.ok.load(Ordering::Relaxed),
            not_ok: self.not_ok.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            finally_pending: self.finally_pending.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            max_delay_ms: self.max_delay_ms.load(Ordering::Relaxed),
            current_delay_ms: self.current_delay_ms.load(Ordering::Relaxed),
        }
    }

    /// Zeroes everything. Only called when a new run starts.
    pub fn reset(&self) {
        for counter in [
            &self.generated,
            &self.sent,
            &self.ok,
            &self.not_ok,
            &self.errors,
            &self.recovered,
            &self.discarded,
            &self.finally_pending,
            &self.pending,
            &self.max_delay_ms,
            &self.current_delay_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
