//! Production implementation of FleetContext using Tokio.

use crate::FleetContext;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::Instrument;

/// Production context backed by the Tokio clock.
///
/// Uses `tokio::time::Instant`, so a paused test runtime drives it too.
pub struct TokioContext {
    /// Start time for monotonic duration calculations
    start: Instant,

    /// Seed for per-agent randomness (0 = OS entropy)
    seed: u64,
}

impl TokioContext {
    /// Creates a new unseeded TokioContext.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Creates a context whose agents draw randomness from `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            start: Instant::now(),
            seed,
        }
    }

    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FleetContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let span = tracing::info_span!("task", name = %name);
        tokio::spawn(future.instrument(span));
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tokio_context_time() {
        let ctx = TokioContext::new();
        let t1 = ctx.now();
        ctx.sleep(Duration::from_millis(10)).await;
        let t2 = ctx.now();

        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_context_follows_paused_clock() {
        let ctx = TokioContext::new();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(ctx.now() >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_tokio_context_spawn_runs() {
        let ctx = TokioContext::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        ctx.spawn("ping", async move {
            let _ = tx.send(7u8);
        });
        assert_eq!(rx.await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_object_shares_context_time() {
        let ctx = TokioContext::shared();
        let clock: Arc<dyn crate::Clock> = ctx.clone();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(clock.now(), FleetContext::now(ctx.as_ref()));
    }

    #[test]
    fn test_tokio_context_seed() {
        assert_eq!(TokioContext::new().seed(), 0);
        assert_eq!(TokioContext::with_seed(9).seed(), 9);
        assert!(TokioContext::new().epoch_millis() > 0);
    }
}
