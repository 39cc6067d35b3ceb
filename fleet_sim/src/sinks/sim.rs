//! Simulated broker with deterministic fault injection.

use async_trait::async_trait;
use fleet_env::{EventKind, EventSink, PublishOutcome, SinkError, SourceId, TelemetryEvent};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::context::derive_rng;

#[derive(Debug, Default)]
struct BrokerState {
    outage: AtomicBool,
    accepted_locations: AtomicU64,
    accepted_sections: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
}

/// Fault injection settings shared by every [`SimSink`] of a run.
///
/// Cloning shares the outage switch and the broker-side counters.
#[derive(Debug, Clone)]
pub struct SinkFaultController {
    seed: u64,

    /// Probability that a batch is refused (NOT_OK)
    reject_rate: f64,

    /// Probability that a batch never reaches the broker
    error_rate: f64,

    /// Mean publish latency (ms)
    latency_mean_ms: f64,

    /// Publish latency standard deviation (ms)
    latency_std_ms: f64,

    state: Arc<BrokerState>,
}

impl SinkFaultController {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            reject_rate: 0.0,
            error_rate: 0.0,
            latency_mean_ms: 0.0,
            latency_std_ms: 0.0,
            state: Arc::new(BrokerState::default()),
        }
    }

    pub fn with_reject_rate(mut self, rate: f64) -> Self {
        self.reject_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_error_rate(mut self, rate: f64) -> Self {
        self.error_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_latency(mut self, mean_ms: f64, std_ms: f64) -> Self {
        self.latency_mean_ms = mean_ms.max(0.0);
        self.latency_std_ms = std_ms.max(0.0);
        self
    }

    /// Switches the whole broker off (every publish and reconnect fails).
    pub fn set_outage(&self, outage: bool) {
        self.state.outage.store(outage, Ordering::SeqCst);
    }

    pub fn is_outage(&self) -> bool {
        self.state.outage.load(Ordering::SeqCst)
    }

    /// Events acknowledged for one event kind.
    pub fn accepted(&self, kind: EventKind) -> u64 {
        match kind {
            EventKind::VehicleLocation => self.state.accepted_locations.load(Ordering::Relaxed),
            EventKind::DataSection => self.state.accepted_sections.load(Ordering::Relaxed),
        }
    }

    /// Batches refused so far.
    pub fn rejected_batches(&self) -> u64 {
        self.state.rejected.load(Ordering::Relaxed)
    }

    /// Batches lost to injected transport errors so far.
    pub fn failed_batches(&self) -> u64 {
        self.state.failed.load(Ordering::Relaxed)
    }

    /// Creates the sink of one driver, with its own RNG stream.
    pub fn create(&self, source: &SourceId) -> Result<Box<dyn EventSink>, SinkError> {
        Ok(Box::new(SimSink::new(self.clone(), source)))
    }
}

/// Per-driver handle to the simulated broker.
pub struct SimSink {
    controller: SinkFaultController,
    rng: ChaCha8Rng,
    latency: Option<Normal<f64>>,
    closed: bool,
}

impl SimSink {
    pub fn new(controller: SinkFaultController, source: &SourceId) -> Self {
        let mut hasher = DefaultHasher::new();
        source.as_str().hash(&mut hasher);
        let rng = derive_rng(controller.seed, hasher.finish());

        let latency = if controller.latency_mean_ms > 0.0 || controller.latency_std_ms > 0.0 {
            Normal::new(controller.latency_mean_ms, controller.latency_std_ms).ok()
        } else {
            None
        };

        Self {
            controller,
            rng,
            latency,
            closed: false,
        }
    }
}

#[async_trait]
impl EventSink for SimSink {
    async fn publish(&mut self, events: &[TelemetryEvent]) -> PublishOutcome {
        if self.closed {
            return PublishOutcome::TransportError(SinkError::Closed);
        }
        let state = &self.controller.state;
        if self.controller.is_outage() {
            state.failed.fetch_add(1, Ordering::Relaxed);
            return PublishOutcome::TransportError(SinkError::transport("broker unreachable"));
        }

        if let Some(latency) = &self.latency {
            let ms = latency.sample(&mut self.rng).max(0.0);
            if ms > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(ms / 1000.0)).await;
            }
        }

        let draw: f64 = self.rng.gen();
        if draw < self.controller.error_rate {
            state.failed.fetch_add(1, Ordering::Relaxed);
            return PublishOutcome::TransportError(SinkError::transport("connection reset"));
        }
        if draw < self.controller.error_rate + self.controller.reject_rate {
            state.rejected.fetch_add(1, Ordering::Relaxed);
            return PublishOutcome::NotOk("broker refused the batch".into());
        }

        for event in events {
            let counter = match event.event_type {
                EventKind::VehicleLocation => &state.accepted_locations,
                EventKind::DataSection => &state.accepted_sections,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        PublishOutcome::Ok
    }

    async fn reconnect(&mut self) -> Result<(), SinkError> {
        if self.controller.is_outage() {
            return Err(SinkError::transport("broker unreachable"));
        }
        self.closed = false;
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
    }

    fn name(&self) -> &'static str {
        "sim"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_env::RetryBudget;
    use serde_json::Map;

    fn events(kind: EventKind, n: usize) -> Vec<TelemetryEvent> {
        (0..n)
            .map(|_| TelemetryEvent::new(SourceId::from_hex("01"), kind, Utc::now(), Map::new(), RetryBudget::UNLIMITED))
            .collect()
    }

    #[tokio::test]
    async fn test_healthy_broker_accepts() {
        let controller = SinkFaultController::new(42);
        let mut sink = controller.create(&SourceId::derive(0, "a")).unwrap();

        assert_eq!(sink.publish(&events(EventKind::DataSection, 3)).await, PublishOutcome::Ok);
        assert_eq!(controller.accepted(EventKind::DataSection), 3);
        assert_eq!(controller.accepted(EventKind::VehicleLocation), 0);
    }

    #[tokio::test]
    async fn test_reject_and_error_rates() {
        let rejecting = SinkFaultController::new(1).with_reject_rate(1.0);
        let mut sink = rejecting.create(&SourceId::derive(0, "a")).unwrap();
        assert!(matches!(
            sink.publish(&events(EventKind::VehicleLocation, 1)).await,
            PublishOutcome::NotOk(_)
        ));
        assert_eq!(rejecting.rejected_batches(), 1);

        let failing = SinkFaultController::new(1).with_error_rate(1.0);
        let mut sink = failing.create(&SourceId::derive(0, "a")).unwrap();
        assert!(matches!(
            sink.publish(&events(EventKind::VehicleLocation, 1)).await,
            PublishOutcome::TransportError(SinkError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_same_seed_same_outcomes() {
        let outcomes = |seed| async move {
            let controller = SinkFaultController::new(seed).with_reject_rate(0.5);
            let mut sink = SimSink::new(controller, &SourceId::derive(0, "a"));
            let mut labels = Vec::new();
            for _ in 0..32 {
                labels.push(sink.publish(&events(EventKind::VehicleLocation, 1)).await.label());
            }
            labels
        };
        let first = outcomes(9).await;
        assert_eq!(first, outcomes(9).await);
        assert!(first.contains(&"ok") && first.contains(&"not_ok"));
    }

    #[tokio::test]
    async fn test_outage_blocks_publish_and_reconnect() {
        let controller = SinkFaultController::new(3);
        let mut sink = controller.create(&SourceId::derive(0, "a")).unwrap();

        controller.set_outage(true);
        assert!(!sink.publish(&events(EventKind::DataSection, 1)).await.is_ok());
        assert!(sink.reconnect().await.is_err());

        controller.set_outage(false);
        assert!(sink.reconnect().await.is_ok());
        assert!(sink.publish(&events(EventKind::DataSection, 1)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_applied() {
        let controller = SinkFaultController::new(5).with_latency(200.0, 0.0);
        let mut sink = controller.create(&SourceId::derive(0, "a")).unwrap();

        let started = tokio::time::Instant::now();
        sink.publish(&events(EventKind::VehicleLocation, 1)).await;
        assert!(started.elapsed() >= Duration::from_millis(199));
    }
}
