//! Reliable Event Publisher.
//!
//! Per-driver delivery logic on top of an [`EventSink`]:
//!
//! ```text
//!  primary send ──ok──► ok+1
//!       │
//!    not ok / error ──► not_ok+1 | errors+1
//!       │
//!       ▼ (retry-on-fail)
//!  reconnect, budget 0 ? ──yes──► discarded+1
//!       │ no
//!       ▼
//!  pending queue ──sweep ok──► recovered+n
//!       │
//!    sweep fails ──► budget-1 each ──► reaching 0 ──► discarded+1
//! ```
//!
//! One queue per event kind. A queue is swept as a single batch, at most
//! once per tick, and only on ticks where that kind's primary cadence did
//! not fire.
//!
//! Delivery latency is measured on the context [`Clock`], so a paused or
//! virtual clock yields the simulated delay.

use crate::counters::FleetCounters;
use chrono::{DateTime, Utc};
use fleet_env::{Clock, EventKind, EventSink, PublishOutcome, RetryBudget, SourceId, TelemetryEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Seconds between two location sends.
pub const LOCATION_INTERVAL_SECS: u64 = 10;

/// How failed deliveries are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Queue failed events for later sweeps
    pub retry_on_fail: bool,

    /// Minimum seconds between two sweeps of the same queue
    pub seconds_between_retries: u64,

    /// Budget stamped on every new event
    pub budget: RetryBudget,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_on_fail: true,
            seconds_between_retries: 60,
            budget: RetryBudget::UNLIMITED,
        }
    }
}

impl RetryPolicy {
    pub fn with_retry_on_fail(mut self, enabled: bool) -> Self {
        self.retry_on_fail = enabled;
        self
    }

    pub fn with_seconds_between_retries(mut self, seconds: u64) -> Self {
        self.seconds_between_retries = seconds;
        self
    }

    pub fn with_budget(mut self, budget: RetryBudget) -> Self {
        self.budget = budget;
        self
    }
}

/// One delivery attempt, for monitoring exports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatusRecord {
    pub id: SourceId,
    pub timestamp: DateTime<Utc>,
    pub delay_ms: u64,
    pub payload_bytes: usize,
}

/// One generated event, for monitoring exports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Records collected by one driver while monitoring is enabled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentMonitoring {
    pub statuses: Vec<AgentStatusRecord>,
    pub events: Vec<EventRecord>,
}

#[derive(Debug, Default)]
struct PendingQueue {
    events: Vec<TelemetryEvent>,
    seconds_since_retry: u64,
}

/// Delivery state of one driver.
pub struct Publisher {
    source: SourceId,
    sink: Box<dyn EventSink>,
    counters: Arc<FleetCounters>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    locations: PendingQueue,
    sections: PendingQueue,
    seconds_since_location: u64,
    max_delay_ms: u64,
    current_delay_ms: u64,
    monitoring: Option<AgentMonitoring>,
    closed: bool,
}

impl Publisher {
    pub fn new(
        source: SourceId,
        sink: Box<dyn EventSink>,
        counters: Arc<FleetCounters>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            sink,
            counters,
            policy,
            clock,
            locations: PendingQueue::default(),
            sections: PendingQueue::default(),
            seconds_since_location: 0,
            max_delay_ms: 0,
            current_delay_ms: 0,
            monitoring: None,
            closed: false,
        }
    }

    /// Enables collection of per-attempt and per-event records.
    pub fn with_monitoring(mut self, enabled: bool) -> Self {
        self.monitoring = enabled.then(AgentMonitoring::default);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn queue(&self, kind: EventKind) -> &PendingQueue {
        match kind {
            EventKind::VehicleLocation => &self.locations,
            EventKind::DataSection => &self.sections,
        }
    }

    fn queue_mut(&mut self, kind: EventKind) -> &mut PendingQueue {
        match kind {
            EventKind::VehicleLocation => &mut self.locations,
            EventKind::DataSection => &mut self.sections,
        }
    }

    /// True once the location cadence is due.
    pub fn location_due(&self) -> bool {
        self.seconds_since_location >= LOCATION_INTERVAL_SECS
    }

    /// Restarts the location cadence.
    pub fn reset_location_clock(&mut self) {
        self.seconds_since_location = 0;
    }

    /// True when the `kind` queue may be swept on this tick.
    pub fn retry_due(&self, kind: EventKind) -> bool {
        let queue = self.queue(kind);
        !queue.events.is_empty() && queue.seconds_since_retry >= self.policy.seconds_between_retries
    }

    /// Attempts first delivery of a freshly generated event.
    pub async fn send(&mut self, event: TelemetryEvent) -> PublishOutcome {
        self.counters.add_generated(1);
        self.counters.add_sent(1);
        if let Some(monitoring) = self.monitoring.as_mut() {
            monitoring.events.push(EventRecord {
                event_id: event.event_id.to_string(),
                timestamp: event.timestamp,
            });
        }

        let started = self.clock.now();
        let outcome = self.sink.publish(std::slice::from_ref(&event)).await;
        self.observe(started, event.payload_size(), event.timestamp);

        if outcome.is_ok() {
            self.counters.add_ok(1);
            trace!(source = %self.source, kind = %event.event_type, "Event delivered");
            return outcome;
        }
        match &outcome {
            PublishOutcome::Ok => {}
            PublishOutcome::NotOk(reason) => {
                self.counters.add_not_ok(1);
                warn!(source = %self.source, kind = %event.event_type, reason = %reason, "Event rejected");
            }
            PublishOutcome::TransportError(err) => {
                self.counters.add_errors(1);
                warn!(source = %self.source, kind = %event.event_type, error = %err, "Event delivery failed");
            }
        }

        if self.policy.retry_on_fail {
            if event.retries.is_exhausted() {
                self.counters.add_discarded(1);
                debug!(source = %self.source, event_id = %event.event_id, "No retries allowed, event discarded");
            } else {
                let kind = event.event_type;
                self.queue_mut(kind).events.push(event);
                self.counters.add_pending(1);
            }
            self.reconnect().await;
        }

        outcome
    }

    /// Flushes the whole `kind` queue as one batch.
    ///
    /// Returns `None` when the queue was empty.
    pub async fn sweep(&mut self, kind: EventKind) -> Option<PublishOutcome> {
        if self.queue(kind).events.is_empty() {
            return None;
        }
        self.queue_mut(kind).seconds_since_retry = 0;
        self.counters.add_sent(1);

        let batch = std::mem::take(&mut self.queue_mut(kind).events);
        let payload: usize = batch.iter().map(TelemetryEvent::payload_size).sum();
        let timestamp = batch.last().map(|e| e.timestamp).unwrap_or_else(Utc::now);

        let started = self.clock.now();
        let outcome = self.sink.publish(&batch).await;
        self.observe(started, payload, timestamp);

        if outcome.is_ok() {
            let n = batch.len() as u64;
            self.counters.add_recovered(n);
            self.counters.remove_pending(n);
            debug!(source = %self.source, kind = %kind, recovered = n, "Pending events recovered");
            return Some(outcome);
        }

        warn!(
            source = %self.source,
            kind = %kind,
            batch = batch.len(),
            outcome = outcome.label(),
            "Retry sweep failed"
        );
        self.reconnect().await;

        let mut kept = Vec::with_capacity(batch.len());
        for mut event in batch {
            if event.retries.consume() {
                self.counters.add_discarded(1);
                self.counters.remove_pending(1);
                debug!(source = %self.source, event_id = %event.event_id, "Retry budget exhausted, event discarded");
            } else {
                kept.push(event);
            }
        }
        self.queue_mut(kind).events = kept;

        Some(outcome)
    }

    async fn reconnect(&mut self) {
        if let Err(err) = self.sink.reconnect().await {
            warn!(source = %self.source, sink = self.sink.name(), error = %err, "Reconnect failed");
        }
    }

    fn observe(&mut self, started: Duration, payload_bytes: usize, timestamp: DateTime<Utc>) {
        let delay_ms = self.clock.now().saturating_sub(started).as_millis() as u64;
        self.max_delay_ms = self.max_delay_ms.max(delay_ms);
        self.current_delay_ms = self.current_delay_ms.max(delay_ms);
        self.counters.record_delay(delay_ms);

        if let Some(monitoring) = self.monitoring.as_mut() {
            monitoring.statuses.push(AgentStatusRecord {
                id: self.source.clone(),
                timestamp,
                delay_ms,
                payload_bytes,
            });
        }
    }

    /// Advances the cadence and retry clocks by one second.
    pub fn end_tick(&mut self) {
        self.seconds_since_location += 1;
        for queue in [&mut self.locations, &mut self.sections] {
            if !queue.events.is_empty() {
                queue.seconds_since_retry += 1;
            }
        }
    }

    /// Events waiting in both queues.
    pub fn pending_count(&self) -> usize {
        self.locations.events.len() + self.sections.events.len()
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    /// Returns the agent's delay watermark since the last call and resets it.
    pub fn take_current_delay(&mut self) -> u64 {
        std::mem::take(&mut self.current_delay_ms)
    }

    /// Counts everything still pending as finally-pending and closes the
    /// sink. Later calls do nothing.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let n = self.pending_count() as u64;
        if n > 0 {
            self.counters.add_finally_pending(n);
            self.counters.remove_pending(n);
            debug!(source = %self.source, pending = n, "Events left pending at close");
        }
        self.locations.events.clear();
        self.sections.events.clear();
        self.sink.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Hands over the collected monitoring records.
    pub fn take_monitoring(&mut self) -> Option<AgentMonitoring> {
        self.monitoring.as_mut().map(std::mem::take)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fleet_env::{SinkError, TokioContext};
    use proptest::prelude::*;
    use serde_json::Map;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted outcomes, then falls back to a fixed one.
    struct ScriptedSink {
        script: VecDeque<PublishOutcome>,
        fallback: PublishOutcome,
        batches: Arc<Mutex<Vec<usize>>>,
        reconnects: Arc<Mutex<u32>>,
    }

    impl ScriptedSink {
        fn new(script: Vec<PublishOutcome>, fallback: PublishOutcome) -> Self {
            Self {
                script: script.into(),
                fallback,
                batches: Arc::new(Mutex::new(Vec::new())),
                reconnects: Arc::new(Mutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl EventSink for ScriptedSink {
        async fn publish(&mut self, events: &[TelemetryEvent]) -> PublishOutcome {
            self.batches.lock().unwrap().push(events.len());
            self.script.pop_front().unwrap_or_else(|| self.fallback.clone())
        }

        async fn reconnect(&mut self) -> Result<(), SinkError> {
            *self.reconnects.lock().unwrap() += 1;
            Ok(())
        }

        async fn close(&mut self) {}

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    /// Clock moved by hand; publishing on [`SlowSink`] advances it.
    #[derive(Default)]
    struct ManualClock(Mutex<Duration>);

    impl Clock for ManualClock {
        fn now(&self) -> Duration {
            *self.0.lock().unwrap()
        }
    }

    struct SlowSink {
        clock: Arc<ManualClock>,
        latency: Duration,
    }

    #[async_trait]
    impl EventSink for SlowSink {
        async fn publish(&mut self, _events: &[TelemetryEvent]) -> PublishOutcome {
            *self.clock.0.lock().unwrap() += self.latency;
            PublishOutcome::Ok
        }

        async fn reconnect(&mut self) -> Result<(), SinkError> {
            Ok(())
        }

        async fn close(&mut self) {}

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    fn rejected() -> PublishOutcome {
        PublishOutcome::NotOk("rejected".into())
    }

    fn event(kind: EventKind, budget: RetryBudget) -> TelemetryEvent {
        TelemetryEvent::new(SourceId::from_hex("abcdef01"), kind, Utc::now(), Map::new(), budget)
    }

    fn publisher(sink: ScriptedSink, policy: RetryPolicy) -> (Publisher, Arc<FleetCounters>) {
        let counters = Arc::new(FleetCounters::new());
        let publisher = Publisher::new(
            SourceId::from_hex("abcdef01"),
            Box::new(sink),
            Arc::clone(&counters),
            policy,
            TokioContext::shared(),
        );
        (publisher, counters)
    }

    /// Ticks until the `kind` queue is sweepable, then sweeps it.
    async fn sweep_when_due(publisher: &mut Publisher, kind: EventKind) -> Option<PublishOutcome> {
        for _ in 0..1000 {
            if publisher.retry_due(kind) {
                return publisher.sweep(kind).await;
            }
            publisher.end_tick();
        }
        None
    }

    #[tokio::test]
    async fn test_ok_send_counts() {
        let sink = ScriptedSink::new(vec![], PublishOutcome::Ok);
        let (mut publisher, counters) = publisher(sink, RetryPolicy::default());

        let outcome = publisher.send(event(EventKind::VehicleLocation, RetryBudget::UNLIMITED)).await;
        assert!(outcome.is_ok());

        let snap = counters.snapshot();
        assert_eq!((snap.generated, snap.sent, snap.ok), (1, 1, 1));
        assert_eq!(publisher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_always_rejected_budget_two_is_discarded_once() {
        let sink = ScriptedSink::new(vec![], rejected());
        let batches = Arc::clone(&sink.batches);
        let policy = RetryPolicy::default()
            .with_seconds_between_retries(3)
            .with_budget(RetryBudget::new(2));
        let (mut publisher, counters) = publisher(sink, policy);

        publisher.send(event(EventKind::DataSection, policy.budget)).await;
        assert_eq!(publisher.pending_count(), 1);
        assert_eq!(counters.snapshot().pending, 1);

        sweep_when_due(&mut publisher, EventKind::DataSection).await;
        assert_eq!(publisher.pending_count(), 1);
        sweep_when_due(&mut publisher, EventKind::DataSection).await;
        assert_eq!(publisher.pending_count(), 0);
        assert_eq!(sweep_when_due(&mut publisher, EventKind::DataSection).await, None);

        let snap = counters.snapshot();
        assert_eq!(snap.discarded, 1);
        assert_eq!(snap.recovered, 0);
        assert_eq!(snap.not_ok, 1);
        assert_eq!(snap.sent, 3);
        assert_eq!(snap.pending, 0);
        assert_eq!(*batches.lock().unwrap(), vec![1, 1, 1]);
    }

    #[tokio::test]
    async fn test_zero_budget_is_discarded_on_first_failure() {
        let sink = ScriptedSink::new(vec![], PublishOutcome::TransportError(SinkError::Closed));
        let reconnects = Arc::clone(&sink.reconnects);
        let policy = RetryPolicy::default().with_budget(RetryBudget::new(0));
        let (mut publisher, counters) = publisher(sink, policy);

        publisher.send(event(EventKind::VehicleLocation, policy.budget)).await;

        let snap = counters.snapshot();
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.discarded, 1);
        assert_eq!(publisher.pending_count(), 0);
        assert_eq!(*reconnects.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retry_disabled_drops_silently() {
        let sink = ScriptedSink::new(vec![], rejected());
        let reconnects = Arc::clone(&sink.reconnects);
        let policy = RetryPolicy::default().with_retry_on_fail(false);
        let (mut publisher, counters) = publisher(sink, policy);

        publisher.send(event(EventKind::VehicleLocation, policy.budget)).await;

        let snap = counters.snapshot();
        assert_eq!(snap.not_ok, 1);
        assert_eq!(snap.discarded, 0);
        assert_eq!(publisher.pending_count(), 0);
        // Reconnecting only serves later retries
        assert_eq!(*reconnects.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_latency_is_measured_on_the_context_clock() {
        let clock = Arc::new(ManualClock::default());
        let sink = SlowSink {
            clock: Arc::clone(&clock),
            latency: Duration::from_millis(40),
        };
        let counters = Arc::new(FleetCounters::new());
        let mut publisher = Publisher::new(
            SourceId::from_hex("abcdef01"),
            Box::new(sink),
            Arc::clone(&counters),
            RetryPolicy::default(),
            clock,
        );

        publisher.send(event(EventKind::VehicleLocation, RetryBudget::UNLIMITED)).await;

        assert_eq!(publisher.max_delay_ms(), 40);
        assert_eq!(publisher.take_current_delay(), 40);
        assert_eq!(publisher.take_current_delay(), 0);
        assert_eq!(counters.snapshot().max_delay_ms, 40);
    }

    #[tokio::test]
    async fn test_sweep_recovers_whole_batch() {
        let sink = ScriptedSink::new(vec![rejected(), rejected()], PublishOutcome::Ok);
        let batches = Arc::clone(&sink.batches);
        let policy = RetryPolicy::default().with_seconds_between_retries(2);
        let (mut publisher, counters) = publisher(sink, policy);

        publisher.send(event(EventKind::VehicleLocation, policy.budget)).await;
        publisher.send(event(EventKind::VehicleLocation, policy.budget)).await;
        assert!(!publisher.retry_due(EventKind::VehicleLocation));
        assert!(!publisher.retry_due(EventKind::DataSection));

        let outcome = sweep_when_due(&mut publisher, EventKind::VehicleLocation).await;
        assert_eq!(outcome, Some(PublishOutcome::Ok));

        let snap = counters.snapshot();
        assert_eq!(snap.recovered, 2);
        assert_eq!(snap.pending, 0);
        assert!(snap.recovered <= snap.not_ok + snap.errors);
        assert_eq!(batches.lock().unwrap().last(), Some(&2));
    }

    #[tokio::test]
    async fn test_unlimited_budget_is_never_discarded() {
        let sink = ScriptedSink::new(vec![], rejected());
        let policy = RetryPolicy::default().with_seconds_between_retries(1);
        let (mut publisher, counters) = publisher(sink, policy);

        publisher.send(event(EventKind::DataSection, RetryBudget::UNLIMITED)).await;
        for _ in 0..50 {
            sweep_when_due(&mut publisher, EventKind::DataSection).await;
        }

        assert_eq!(publisher.pending_count(), 1);
        assert_eq!(counters.snapshot().discarded, 0);
    }

    #[tokio::test]
    async fn test_close_counts_finally_pending_once() {
        let sink = ScriptedSink::new(vec![], rejected());
        let (mut publisher, counters) = publisher(sink, RetryPolicy::default());

        publisher.send(event(EventKind::VehicleLocation, RetryBudget::UNLIMITED)).await;
        publisher.send(event(EventKind::DataSection, RetryBudget::UNLIMITED)).await;
        publisher.close().await;
        publisher.close().await;

        let snap = counters.snapshot();
        assert_eq!(snap.finally_pending, 2);
        assert_eq!(snap.pending, 0);
        assert!(publisher.is_closed());
    }

    #[tokio::test]
    async fn test_monitoring_records() {
        let sink = ScriptedSink::new(vec![rejected()], PublishOutcome::Ok);
        let policy = RetryPolicy::default().with_seconds_between_retries(0);
        let (publisher, _) = publisher(sink, policy);
        let mut publisher = publisher.with_monitoring(true);

        let first = event(EventKind::VehicleLocation, policy.budget);
        let id = first.event_id.to_string();
        publisher.send(first).await;
        publisher.sweep(EventKind::VehicleLocation).await;

        let monitoring = publisher.take_monitoring().unwrap();
        assert_eq!(monitoring.events.len(), 1);
        assert_eq!(monitoring.events[0].event_id, id);
        assert_eq!(monitoring.statuses.len(), 2);
        assert!(monitoring.statuses.iter().all(|s| s.payload_bytes > 0));
    }

    proptest! {
        #[test]
        fn prop_budget_bounds_sweeps(budget in 0i32..8) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let sink = ScriptedSink::new(vec![], rejected());
                let batches = Arc::clone(&sink.batches);
                let policy = RetryPolicy::default()
                    .with_seconds_between_retries(1)
                    .with_budget(RetryBudget::new(budget));
                let (mut publisher, counters) = publisher(sink, policy);

                publisher.send(event(EventKind::DataSection, policy.budget)).await;
                for _ in 0..20 {
                    sweep_when_due(&mut publisher, EventKind::DataSection).await;
                }

                // One primary attempt plus at most `budget` sweeps
                assert_eq!(batches.lock().unwrap().len(), 1 + budget as usize);
                assert_eq!(counters.snapshot().discarded, 1);
            });
        }

        #[test]
        fn prop_counters_are_conserved(
            outcomes in proptest::collection::vec(0u8..3, 0..40),
            ops in proptest::collection::vec((0u8..4, any::<bool>()), 1..60),
            budget in -1i32..=5,
            between in 0u64..4,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let script = outcomes
                    .iter()
                    .map(|o| match o {
                        0 => PublishOutcome::Ok,
                        1 => rejected(),
                        _ => PublishOutcome::TransportError(SinkError::Closed),
                    })
                    .collect();
                let sink = ScriptedSink::new(script, PublishOutcome::Ok);
                let policy = RetryPolicy::default()
                    .with_seconds_between_retries(between)
                    .with_budget(RetryBudget::new(budget));
                let (mut publisher, counters) = publisher(sink, policy);

                for (op, location) in ops {
                    let kind = if location { EventKind::VehicleLocation } else { EventKind::DataSection };
                    match op {
                        0 | 1 => {
                            publisher.send(event(kind, policy.budget)).await;
                        }
                        2 => {
                            if publisher.retry_due(kind) {
                                publisher.sweep(kind).await;
                            }
                        }
                        _ => {}
                    }
                    publisher.end_tick();

                    let snap = counters.snapshot();
                    assert!(snap.recovered <= snap.not_ok + snap.errors);
                    assert_eq!(snap.pending, publisher.pending_count() as u64);
                }
                publisher.close().await;

                let snap = counters.snapshot();
                assert!(snap.ok + snap.discarded + snap.finally_pending <= snap.generated);
                assert!(snap.recovered <= snap.not_ok + snap.errors);
                assert_eq!(snap.pending, 0);
                assert_eq!(snap.ok + snap.recovered + snap.discarded + snap.finally_pending, snap.generated);
            });
        }
    }
}
