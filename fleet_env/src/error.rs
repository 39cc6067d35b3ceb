//! Error types for the fleet environment abstraction.

use thiserror::Error;

/// Errors raised by event sinks.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SinkError {
    /// I/O or connection level failure (connection refused, reset, ...)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The broker answered but refused the event
    #[error("Rejected by broker: {0}")]
    Rejected(String),

    /// The sink endpoint cannot be used at all (malformed URL, ...)
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Event serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The sink or its broker was shut down
    #[error("Sink closed")]
    Closed,

    /// No acknowledgement arrived in time
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl SinkError {
    /// Creates a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Creates a rejection error.
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// Creates an invalid endpoint error.
    pub fn invalid_endpoint(endpoint: impl std::fmt::Display) -> Self {
        Self::InvalidEndpoint(endpoint.to_string())
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
