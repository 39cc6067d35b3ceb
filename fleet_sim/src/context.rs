//! Simulation context implementing FleetContext for deterministic testing.

use async_trait::async_trait;
use fleet_env::FleetContext;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::Instrument;

/// Mixing constant for deriving independent RNG streams from one seed.
const STREAM_MIX: u64 = 0x517c_c1b7_2722_0a95;

/// Derives a deterministic RNG for one stream (agent index, subsystem...).
///
/// A `seed` of 0 draws from OS entropy instead.
pub fn derive_rng(seed: u64, stream: u64) -> ChaCha8Rng {
    if seed == 0 {
        return ChaCha8Rng::from_entropy();
    }
    ChaCha8Rng::seed_from_u64(seed.wrapping_mul(STREAM_MIX) ^ stream)
}

/// Simulation context backed by a virtual clock and a fixed seed.
///
/// This implements `FleetContext` using:
/// - A virtual clock that only moves when advanced (or slept on)
/// - A fixed wall-clock epoch so event timestamps are reproducible
///
/// Periodic tasks still run on tokio timers; tests pause tokio time and
/// advance this clock explicitly to drive the watchdog.
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    virtual_time_ns: Arc<Mutex<u64>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(Mutex::new(0)),
            epoch: UNIX_EPOCH + Duration::from_secs(1_704_067_200), // 2024-01-01 00:00:00 UTC
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Advances virtual time by the given duration.
    pub fn advance_time(&self, duration: Duration) {
        if let Ok(mut time) = self.virtual_time_ns.lock() {
            *time += duration.as_nanos() as u64;
        }
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        self.virtual_time_ns.lock().map(|t| *t).unwrap_or(0)
    }

    /// Deterministic RNG for one stream of this simulation.
    pub fn derive_rng(&self, stream: u64) -> ChaCha8Rng {
        derive_rng(self.seed, stream)
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl FleetContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        // Sleeping only moves the virtual clock
        self.advance_time(duration);
        tokio::task::yield_now().await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let span = tracing::info_span!("sim_task", name = %name);
        tokio::spawn(future.instrument(span));
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}
