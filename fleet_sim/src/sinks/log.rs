//! In-process partitioned append log.
//!
//! ```text
//!  LogSink ──append(key, bytes, ack)──► mpsc ──► partition task ──► offset
//!     ▲                                              │
//!     └──────────────── oneshot ack ◄────────────────┘
//! ```
//!
//! Two topics ("VehicleLocation", "DataSection"), each split into N
//! partitions. A record is routed by the hash of its source id, so one
//! driver's records stay ordered within a partition.

use async_trait::async_trait;
use fleet_env::{EventKind, EventSink, PublishOutcome, SinkError, SourceId, TelemetryEvent};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::DEFAULT_ACK_TIMEOUT;

/// Largest record a partition accepts (bytes).
pub const DEFAULT_MAX_RECORD_BYTES: usize = 1024 * 1024;

const PARTITION_QUEUE: usize = 1024;

struct Append {
    payload: Vec<u8>,
    ack: oneshot::Sender<Result<u64, SinkError>>,
}

#[derive(Default)]
struct TopicStats {
    records: AtomicU64,
    bytes: AtomicU64,
}

struct BrokerInner {
    locations: Vec<mpsc::Sender<Append>>,
    sections: Vec<mpsc::Sender<Append>>,
    location_stats: Arc<TopicStats>,
    section_stats: Arc<TopicStats>,
    shutdown: CancellationToken,
    ack_timeout: Duration,
}

/// The broker: owns the partition tasks of both topics.
#[derive(Clone)]
pub struct LogBroker {
    inner: Arc<BrokerInner>,
}

impl LogBroker {
    /// Spawns `partitions` tasks per topic.
    pub fn start(partitions: usize) -> Self {
        Self::with_limits(partitions, DEFAULT_MAX_RECORD_BYTES, DEFAULT_ACK_TIMEOUT)
    }

    pub fn with_limits(partitions: usize, max_record_bytes: usize, ack_timeout: Duration) -> Self {
        let shutdown = CancellationToken::new();
        let location_stats = Arc::new(TopicStats::default());
        let section_stats = Arc::new(TopicStats::default());

        let spawn_topic = |stats: &Arc<TopicStats>| {
            (0..partitions.max(1))
                .map(|_| {
                    let (tx, rx) = mpsc::channel(PARTITION_QUEUE);
                    tokio::spawn(run_partition(rx, Arc::clone(stats), max_record_bytes, shutdown.clone()));
                    tx
                })
                .collect::<Vec<_>>()
        };
        let locations = spawn_topic(&location_stats);
        let sections = spawn_topic(&section_stats);

        Self {
            inner: Arc::new(BrokerInner {
                locations,
                sections,
                location_stats,
                section_stats,
                shutdown,
                ack_timeout,
            }),
        }
    }

    /// Stops every partition. Pending and later appends fail.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Records appended to the topic of `kind`.
    pub fn record_count(&self, kind: EventKind) -> u64 {
        self.stats(kind).records.load(Ordering::Relaxed)
    }

    /// Bytes appended to the topic of `kind`.
    pub fn byte_count(&self, kind: EventKind) -> u64 {
        self.stats(kind).bytes.load(Ordering::Relaxed)
    }

    fn stats(&self, kind: EventKind) -> &TopicStats {
        match kind {
            EventKind::VehicleLocation => &self.inner.location_stats,
            EventKind::DataSection => &self.inner.section_stats,
        }
    }

    pub fn partitions(&self) -> usize {
        self.inner.locations.len()
    }

    /// Partition index of a record key.
    pub fn partition_for(&self, key: &SourceId) -> usize {
        let mut hasher = DefaultHasher::new();
        key.as_str().hash(&mut hasher);
        (hasher.finish() % self.partitions() as u64) as usize
    }

    fn handles(&self, key: &SourceId) -> Result<PartitionHandles, SinkError> {
        if self.is_shutdown() {
            return Err(SinkError::Closed);
        }
        let partition = self.partition_for(key);
        Ok(PartitionHandles {
            location: self.inner.locations[partition].clone(),
            section: self.inner.sections[partition].clone(),
        })
    }

    /// Creates the sink of one driver.
    pub fn create(&self, source: &SourceId) -> Result<Box<dyn EventSink>, SinkError> {
        Ok(Box::new(LogSink::connect(self.clone(), source.clone())?))
    }
}

async fn run_partition(
    mut rx: mpsc::Receiver<Append>,
    stats: Arc<TopicStats>,
    max_record_bytes: usize,
    shutdown: CancellationToken,
) {
    let mut next_offset = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            append = rx.recv() => {
                let Some(append) = append else { break };
                let result = if append.payload.len() > max_record_bytes {
                    Err(SinkError::rejected(format!(
                        "record of {} bytes exceeds {}",
                        append.payload.len(),
                        max_record_bytes
                    )))
                } else {
                    let offset = next_offset;
                    next_offset += 1;
                    stats.records.fetch_add(1, Ordering::Relaxed);
                    stats.bytes.fetch_add(append.payload.len() as u64, Ordering::Relaxed);
                    Ok(offset)
                };
                // The producer may have timed out already
                let _ = append.ack.send(result);
            }
        }
    }
    debug!(offsets = next_offset, "Partition stopped");
}

struct PartitionHandles {
    location: mpsc::Sender<Append>,
    section: mpsc::Sender<Append>,
}

/// One driver's producer on the append log.
pub struct LogSink {
    broker: LogBroker,
    key: SourceId,
    handles: Option<PartitionHandles>,
}

impl LogSink {
    pub fn connect(broker: LogBroker, key: SourceId) -> Result<Self, SinkError> {
        let handles = broker.handles(&key)?;
        Ok(Self {
            broker,
            key,
            handles: Some(handles),
        })
    }

    async fn append(&self, event: &TelemetryEvent) -> Result<u64, SinkError> {
        if self.broker.is_shutdown() {
            return Err(SinkError::Closed);
        }
        let handles = self.handles.as_ref().ok_or(SinkError::Closed)?;
        let sender = match event.event_type {
            EventKind::VehicleLocation => &handles.location,
            EventKind::DataSection => &handles.section,
        };

        let payload = serde_json::to_vec(event)?;
        let (ack, acked) = oneshot::channel();
        sender
            .send(Append { payload, ack })
            .await
            .map_err(|_| SinkError::Closed)?;

        let timeout = self.broker.inner.ack_timeout;
        match tokio::time::timeout(timeout, acked).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SinkError::Closed),
            Err(_) => Err(SinkError::Timeout(timeout.as_millis() as u64)),
        }
    }
}

#[async_trait]
impl EventSink for LogSink {
    async fn publish(&mut self, events: &[TelemetryEvent]) -> PublishOutcome {
        for event in events {
            if let Err(err) = self.append(event).await {
                return Err::<(), _>(err).into();
            }
        }
        PublishOutcome::Ok
    }

    async fn reconnect(&mut self) -> Result<(), SinkError> {
        self.handles = Some(self.broker.handles(&self.key)?);
        Ok(())
    }

    async fn close(&mut self) {
        self.handles = None;
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_env::RetryBudget;
    use serde_json::{json, Map};

    fn event(kind: EventKind, body_bytes: usize) -> TelemetryEvent {
        let mut body = Map::new();
        body.insert("pad".into(), json!("x".repeat(body_bytes)));
        TelemetryEvent::new(SourceId::derive(0, "log-test"), kind, Utc::now(), body, RetryBudget::UNLIMITED)
    }

    #[tokio::test]
    async fn test_appends_are_acknowledged_per_topic() {
        let broker = LogBroker::start(3);
        let mut sink = broker.create(&SourceId::derive(0, "log-test")).unwrap();

        let batch = vec![event(EventKind::VehicleLocation, 10), event(EventKind::VehicleLocation, 10)];
        assert_eq!(sink.publish(&batch).await, PublishOutcome::Ok);
        assert_eq!(sink.publish(&[event(EventKind::DataSection, 10)]).await, PublishOutcome::Ok);

        assert_eq!(broker.record_count(EventKind::VehicleLocation), 2);
        assert_eq!(broker.record_count(EventKind::DataSection), 1);
        assert!(broker.byte_count(EventKind::DataSection) > 0);
    }

    #[tokio::test]
    async fn test_oversized_record_is_not_ok() {
        let broker = LogBroker::with_limits(1, 256, DEFAULT_ACK_TIMEOUT);
        let mut sink = broker.create(&SourceId::derive(0, "log-test")).unwrap();

        let outcome = sink.publish(&[event(EventKind::DataSection, 1024)]).await;
        assert!(matches!(outcome, PublishOutcome::NotOk(_)));
        assert_eq!(broker.record_count(EventKind::DataSection), 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_transport_error_and_blocks_reconnect() {
        let broker = LogBroker::start(2);
        let mut sink = broker.create(&SourceId::derive(0, "log-test")).unwrap();

        broker.shutdown();
        tokio::task::yield_now().await;

        let outcome = sink.publish(&[event(EventKind::VehicleLocation, 1)]).await;
        assert!(matches!(outcome, PublishOutcome::TransportError(_)));
        assert_eq!(sink.reconnect().await, Err(SinkError::Closed));
        assert!(broker.create(&SourceId::derive(0, "other")).is_err());
    }

    #[tokio::test]
    async fn test_closed_sink_fails_until_reconnected() {
        let broker = LogBroker::start(1);
        let mut sink = broker.create(&SourceId::derive(0, "log-test")).unwrap();

        sink.close().await;
        assert_eq!(
            sink.publish(&[event(EventKind::VehicleLocation, 1)]).await,
            PublishOutcome::TransportError(SinkError::Closed)
        );
        sink.reconnect().await.unwrap();
        assert!(sink.publish(&[event(EventKind::VehicleLocation, 1)]).await.is_ok());
    }

    #[test]
    fn test_partition_routing_is_stable() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let _guard = runtime.enter();
        let broker = LogBroker::start(8);
        let key = SourceId::derive(7, "driver-7");
        let partition = broker.partition_for(&key);
        assert!(partition < 8);
        assert_eq!(broker.partition_for(&key), partition);
    }
}
