//! Core environment context trait for fleet components.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};

/// The central interface for environment interaction.
///
/// Abstracts the clock and task spawning so that the orchestrator and the
/// drivers can run against real time (tokio) or a manually advanced
/// virtual clock in tests.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`
/// - **Simulation**: `SimContext` (in `fleet_sim`) - virtual clock + seed
///
/// # Determinism
///
/// All per-agent randomness is derived from [`FleetContext::seed`]. A seed of
/// `0` means "draw from OS entropy".
#[async_trait]
pub trait FleetContext: Send + Sync + 'static {
    /// Returns the monotonic time since context creation.
    ///
    /// Used for the watchdog and for the per-agent simulation budget.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used for event and status timestamps.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    async fn sleep(&self, duration: Duration);

    /// Spawns a named background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Returns the context's seed (0 when not seeded).
    fn seed(&self) -> u64;

    /// Wall-clock time as milliseconds since the Unix epoch.
    fn epoch_millis(&self) -> i64 {
        self.system_time()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// The monotonic clock of a [`FleetContext`], usable as a trait object.
///
/// Components that only time work (the publisher measuring delivery
/// latency) hold an `Arc<dyn Clock>` instead of being generic over the
/// whole context.
pub trait Clock: Send + Sync {
    /// Monotonic time since the clock's origin.
    fn now(&self) -> Duration;
}

impl<C: FleetContext> Clock for C {
    fn now(&self) -> Duration {
        FleetContext::now(self)
    }
}
