//! Event sink abstraction for telemetry delivery.

use async_trait::async_trait;
use crate::error::SinkError;
use crate::types::{SourceId, TelemetryEvent};

/// Result of one delivery attempt.
///
/// ```text
/// Driver                     Sink                      Broker
///   |                          |                          |
///   |-- publish([events]) ---->|-- request/append ------->|
///   |                          |<------ ack / reject -----|
///   |<-- Ok | NotOk | Err -----|                          |
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    /// The broker accepted and acknowledged every event in the batch
    Ok,

    /// The broker answered but refused the batch
    NotOk(String),

    /// The request never got a broker answer
    TransportError(SinkError),
}

impl PublishOutcome {
    /// Returns true for [`PublishOutcome::Ok`].
    pub fn is_ok(&self) -> bool {
        matches!(self, PublishOutcome::Ok)
    }

    /// Short label used in logs and monitoring records.
    pub fn label(&self) -> &'static str {
        match self {
            PublishOutcome::Ok => "ok",
            PublishOutcome::NotOk(_) => "not_ok",
            PublishOutcome::TransportError(_) => "error",
        }
    }
}

impl From<Result<(), SinkError>> for PublishOutcome {
    fn from(result: Result<(), SinkError>) -> Self {
        match result {
            Ok(()) => PublishOutcome::Ok,
            Err(SinkError::Rejected(reason)) => PublishOutcome::NotOk(reason),
            Err(err) => PublishOutcome::TransportError(err),
        }
    }
}

/// Delivery endpoint owned exclusively by one driver.
///
/// # Implementations
///
/// - **HTTP**: publish-and-acknowledge over a JSON POST
/// - **Append log**: partitioned log with per-record asynchronous acks
/// - **Simulated broker**: seeded fault injection for tests and dry runs
///
/// A sink must survive a [`PublishOutcome::TransportError`]: the owner calls
/// [`EventSink::reconnect`] and keeps using the same value.
#[async_trait]
pub trait EventSink: Send + 'static {
    /// Delivers a batch of events as one unit.
    ///
    /// The batch either succeeds or fails as a whole; primary sends pass a
    /// single event, retry sweeps pass the whole pending queue.
    async fn publish(&mut self, events: &[TelemetryEvent]) -> PublishOutcome;

    /// Re-establishes the underlying connection after a failure.
    async fn reconnect(&mut self) -> Result<(), SinkError>;

    /// Flushes and releases the connection. Further publishes may fail.
    async fn close(&mut self);

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// Produces one sink per driver from a run-wide producer resource.
pub trait SinkFactory: Send + Sync + 'static {
    /// Creates the sink for the driver identified by `source`.
    fn create(&self, source: &SourceId) -> Result<Box<dyn EventSink>, SinkError>;
}
