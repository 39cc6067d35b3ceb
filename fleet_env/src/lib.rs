//! Fleet Environment Abstraction Layer
//!
//! This crate holds everything a simulated driver touches outside its own
//! state: the clock, task spawning, and the event sink it publishes to.
//!
//! # Core Concept
//!
//! Drivers and the orchestrator never call `tokio::time` or a broker client
//! directly:
//! - Time (`now()`, `sleep()`, `system_time()`)
//! - Background tasks (`spawn()`)
//! - Delivery (`EventSink::publish()`, `reconnect()`, `close()`)
//!
//! Tests swap in a virtual clock and scripted sinks; production uses
//! [`TokioContext`] and a real backend.
//!
//! # Example
//!
//! ```ignore
//! use fleet_env::{EventSink, FleetContext, PublishOutcome};
//!
//! async fn deliver<Ctx: FleetContext>(ctx: &Ctx, sink: &mut dyn EventSink, events: &[TelemetryEvent]) {
//!     let started = ctx.now();
//!     if let PublishOutcome::TransportError(_) = sink.publish(events).await {
//!         let _ = sink.reconnect().await;
//!     }
//!     tracing::debug!("publish took {:?}", ctx.now() - started);
//! }
//! ```

mod context;
mod error;
mod sink;
mod tokio_impl;
mod types;

pub use context::{Clock, FleetContext};
pub use error::SinkError;
pub use sink::{EventSink, PublishOutcome, SinkFactory};
pub use tokio_impl::TokioContext;
pub use types::{EventKind, RetryBudget, SourceId, TelemetryEvent, APPLICATION_ID, EVENT_SYNTAX};
