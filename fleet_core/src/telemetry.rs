//! Event body builders for the two telemetry kinds.

use crate::path::PathPoint;
use crate::section::DataSection;
use chrono::{DateTime, Utc};
use fleet_env::{EventKind, RetryBudget, SinkError, SourceId, TelemetryEvent};
use serde::{Deserialize, Serialize};
use serde_json::Map;

/// Body of a "Vehicle Location" event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleLocation {
    pub latitude: f64,
    pub longitude: f64,
    /// km/h
    pub speed: f64,
    pub accuracy: u32,
    pub score: u32,
    pub time_stamp: DateTime<Utc>,
}

impl VehicleLocation {
    pub fn at(point: &PathPoint, time_stamp: DateTime<Utc>) -> Self {
        Self {
            latitude: point.position.lat,
            longitude: point.position.lon,
            speed: point.speed_kmh,
            accuracy: 0,
            score: 0,
            time_stamp,
        }
    }
}

/// Wraps a payload under its event-type key.
fn body<T: Serialize>(kind: EventKind, payload: &T) -> Result<Map<String, serde_json::Value>, SinkError> {
    let mut map = Map::new();
    map.insert(kind.as_str().to_string(), serde_json::to_value(payload)?);
    Ok(map)
}

/// Builds a "Vehicle Location" event for the driver's current point.
pub fn location_event(
    source: &SourceId,
    point: &PathPoint,
    at: DateTime<Utc>,
    retries: RetryBudget,
) -> Result<TelemetryEvent, SinkError> {
    let kind = EventKind::VehicleLocation;
    let payload = VehicleLocation::at(point, at);
    Ok(TelemetryEvent::new(source.clone(), kind, at, body(kind, &payload)?, retries))
}

/// Builds a "Data Section" event.
pub fn section_event(
    source: &SourceId,
    section: &DataSection,
    at: DateTime<Utc>,
    retries: RetryBudget,
) -> Result<TelemetryEvent, SinkError> {
    let kind = EventKind::DataSection;
    Ok(TelemetryEvent::new(source.clone(), kind, at, body(kind, section)?, retries))
}
