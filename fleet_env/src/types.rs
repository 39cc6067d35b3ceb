//! Common wire types shared by drivers, sinks and the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Application id stamped on every event.
pub const APPLICATION_ID: &str = "SmartDriver";

/// Media type of the event body.
pub const EVENT_SYNTAX: &str = "application/json";

/// Identifier of a simulated driver on the wire.
///
/// Lowercase hex SHA-256 of the creation instant and the driver label, so two
/// drivers built in the same millisecond still get distinct ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    /// Derives the id from the creation time (ms since epoch) and a label.
    pub fn derive(epoch_millis: i64, label: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(epoch_millis.to_string().as_bytes());
        hasher.update(label.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wraps an already computed id.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Returns the full hex id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0[..self.0.len().min(8)])
    }
}

/// The two telemetry event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Periodic position report
    #[serde(rename = "Vehicle Location")]
    VehicleLocation,

    /// Per-500 m statistical summary
    #[serde(rename = "Data Section")]
    DataSection,
}

impl EventKind {
    /// Event type string carried on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::VehicleLocation => "Vehicle Location",
            EventKind::DataSection => "Data Section",
        }
    }

    /// Topic name used by append-log brokers.
    pub fn topic(&self) -> &'static str {
        match self {
            EventKind::VehicleLocation => "VehicleLocation",
            EventKind::DataSection => "DataSection",
        }
    }

    /// Both kinds, in tick processing order.
    pub fn all() -> [EventKind; 2] {
        [EventKind::VehicleLocation, EventKind::DataSection]
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Remaining retry sweeps for a pending event. `-1` is unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetryBudget(i32);

impl RetryBudget {
    /// Never decremented, never exhausted.
    pub const UNLIMITED: RetryBudget = RetryBudget(-1);

    /// Creates a budget; any negative value means unlimited.
    pub fn new(retries: i32) -> Self {
        if retries < 0 {
            Self::UNLIMITED
        } else {
            Self(retries)
        }
    }

    /// Returns the raw value (`-1` for unlimited).
    pub fn value(&self) -> i32 {
        self.0
    }

    /// Returns true for the unlimited budget.
    pub fn is_unlimited(&self) -> bool {
        self.0 < 0
    }

    /// Returns true once no retries are left.
    pub fn is_exhausted(&self) -> bool {
        self.0 == 0
    }

    /// Spends one retry. Returns true when the budget is now exhausted.
    pub fn consume(&mut self) -> bool {
        if self.is_unlimited() {
            return false;
        }
        if self.0 > 0 {
            self.0 -= 1;
        }
        self.0 == 0
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::UNLIMITED
    }
}

/// A telemetry event as delivered to a sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    /// Unique event id
    pub event_id: Uuid,

    /// Emitting driver
    pub source_id: SourceId,

    /// Body media type
    pub syntax: String,

    /// Emitting application
    pub application_id: String,

    /// "Vehicle Location" or "Data Section"
    pub event_type: EventKind,

    /// Creation time
    pub timestamp: DateTime<Utc>,

    /// Kind-specific payload
    pub body: Map<String, Value>,

    /// Local retry bookkeeping, never serialized
    #[serde(skip)]
    pub retries: RetryBudget,
}

impl TelemetryEvent {
    /// Creates a new event with a fresh id.
    pub fn new(
        source_id: SourceId,
        event_type: EventKind,
        timestamp: DateTime<Utc>,
        body: Map<String, Value>,
        retries: RetryBudget,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            source_id,
            syntax: EVENT_SYNTAX.to_string(),
            application_id: APPLICATION_ID.to_string(),
            event_type,
            timestamp,
            body,
            retries,
        }
    }

    /// Serialized size in bytes (0 if the body cannot be serialized).
    pub fn payload_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}
