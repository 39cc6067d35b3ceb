//! Sink backends and the run-wide sink factory.
//!
//! | Backend | Producer resource        | Per-driver sink |
//! |---------|--------------------------|-----------------|
//! | `sim`   | [`SinkFaultController`]  | [`SimSink`]     |
//! | `log`   | [`LogBroker`]            | [`LogSink`]     |
//! | `http`  | shared `reqwest::Client` | [`HttpSink`]    |

pub mod http;
pub mod log;
pub mod sim;

pub use http::{HttpSink, HttpSinkFactory};
pub use log::{LogBroker, LogSink};
pub use sim::{SimSink, SinkFaultController};

use crate::config::{FleetConfig, SinkKind};
use fleet_env::{EventSink, SinkError, SinkFactory, SourceId};
use std::time::Duration;

/// Request / acknowledgement timeout used by the networked backends.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// The producer resource of one run.
pub enum SinkBuilder {
    Sim(SinkFaultController),
    Log(LogBroker),
    Http(HttpSinkFactory),
}

impl SinkBuilder {
    /// Opens the backend selected by the configuration.
    ///
    /// Must run inside a tokio runtime (the log broker spawns its partitions).
    pub fn open(config: &FleetConfig) -> Result<Self, SinkError> {
        match config.sink {
            SinkKind::Sim => Ok(SinkBuilder::Sim(
                SinkFaultController::new(config.seed)
                    .with_reject_rate(config.reject_rate)
                    .with_error_rate(config.error_rate),
            )),
            SinkKind::Log => Ok(SinkBuilder::Log(LogBroker::start(config.partitions.max(1)))),
            SinkKind::Http => {
                let url = config
                    .url
                    .as_deref()
                    .ok_or_else(|| SinkError::invalid_endpoint("http sink requires a url"))?;
                Ok(SinkBuilder::Http(HttpSinkFactory::new(url, DEFAULT_ACK_TIMEOUT)?))
            }
        }
    }

    pub fn kind(&self) -> SinkKind {
        match self {
            SinkBuilder::Sim(_) => SinkKind::Sim,
            SinkBuilder::Log(_) => SinkKind::Log,
            SinkBuilder::Http(_) => SinkKind::Http,
        }
    }
}

impl SinkFactory for SinkBuilder {
    fn create(&self, source: &SourceId) -> Result<Box<dyn EventSink>, SinkError> {
        match self {
            SinkBuilder::Sim(controller) => controller.create(source),
            SinkBuilder::Log(broker) => broker.create(source),
            SinkBuilder::Http(factory) => factory.create(source),
        }
    }
}
