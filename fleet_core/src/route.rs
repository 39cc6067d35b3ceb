//! Raw route geometry as returned by external route providers.
//!
//! Two provider shapes are accepted:
//! - **Legs**: directions-style legs with a total distance and duration, and
//!   their points either listed or packed in an encoded polyline.
//! - **Annotated**: road-network simulation output, one `[lng, lat]` pair per
//!   point plus the speed at that point.

use crate::geo::GeoPoint;
use crate::path::PathError;
use serde::{Deserialize, Serialize};

/// Raw route geometry in one of the supported provider shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum RouteGeometry {
    /// Legs annotated with total distance/duration
    Legs { legs: Vec<RouteLeg> },

    /// Points annotated with an explicit speed
    Annotated { points: Vec<SpeedWaypoint> },
}

/// One directions leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteLeg {
    /// Total leg length in metres
    pub distance_m: f64,

    /// Total leg duration in seconds
    pub duration_s: f64,

    /// Explicit points, used when no polyline is given
    #[serde(default)]
    pub points: Vec<GeoPoint>,

    /// Encoded polyline (precision 1e5)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polyline: Option<String>,
}

impl RouteLeg {
    /// Returns the leg's points, decoding the polyline if present.
    pub fn resolved_points(&self) -> Result<Vec<GeoPoint>, PathError> {
        match &self.polyline {
            Some(encoded) => decode_polyline(encoded),
            None => Ok(self.points.clone()),
        }
    }
}

/// A point with the speed the provider simulated there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedWaypoint {
    /// `[longitude, latitude]`
    pub coordinates: Vec<f64>,

    /// Speed in km/h
    pub speed_kmh: f64,
}

impl SpeedWaypoint {
    pub fn new(point: GeoPoint, speed_kmh: f64) -> Self {
        Self {
            coordinates: vec![point.lon, point.lat],
            speed_kmh,
        }
    }

    /// Returns the position, or `None` when fewer than two coordinates exist.
    pub fn position(&self) -> Option<GeoPoint> {
        match self.coordinates.as_slice() {
            [lon, lat, ..] => Some(GeoPoint::new(*lat, *lon)),
            _ => None,
        }
    }
}

/// Decodes an encoded polyline (precision 1e5).
pub fn decode_polyline(encoded: &str) -> Result<Vec<GeoPoint>, PathError> {
    let bytes = encoded.as_bytes();
    let mut points = Vec::new();
    let mut index = 0;
    let mut lat: i64 = 0;
    let mut lon: i64 = 0;

    while index < bytes.len() {
        let (d_lat, next) = decode_value(bytes, index)?;
        let (d_lon, next) = decode_value(bytes, next)?;
        index = next;

        lat += d_lat;
        lon += d_lon;
        points.push(GeoPoint::new(lat as f64 / 1e5, lon as f64 / 1e5));
    }

    Ok(points)
}

fn decode_value(bytes: &[u8], mut index: usize) -> Result<(i64, usize), PathError> {
    let mut result: i64 = 0;
    let mut shift = 0;

    loop {
        let byte = *bytes
            .get(index)
            .ok_or_else(|| PathError::InvalidPolyline("truncated value".to_string()))?;
        if !(63..127).contains(&byte) || shift > 30 {
            return Err(PathError::InvalidPolyline(format!("bad byte at {}", index)));
        }
        let chunk = (byte - 63) as i64;
        result |= (chunk & 0x1f) << shift;
        shift += 5;
        index += 1;
        if chunk < 0x20 {
            break;
        }
    }

    let value = if result & 1 != 0 { !(result >> 1) } else { result >> 1 };
    Ok((value, index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_decode_reference_polyline() {
        // Reference example from the polyline algorithm documentation
        let points = decode_polyline("_p~iF~ps|U_ulLnnqC_mqNvxq`@").unwrap();
        assert_eq!(points.len(), 3);
        assert_relative_eq!(points[0].lat, 38.5, epsilon = 1e-9);
        assert_relative_eq!(points[0].lon, -120.2, epsilon = 1e-9);
        assert_relative_eq!(points[1].lat, 40.7, epsilon = 1e-9);
        assert_relative_eq!(points[1].lon, -120.95, epsilon = 1e-9);
        assert_relative_eq!(points[2].lat, 43.252, epsilon = 1e-9);
        assert_relative_eq!(points[2].lon, -126.453, epsilon = 1e-9);
    }

    #[test]
    fn test_decode_truncated_polyline_fails() {
        assert!(matches!(
            decode_polyline("_p~iF~ps|U_"),
            Err(PathError::InvalidPolyline(_))
        ));
    }

    #[test]
    fn test_speed_waypoint_coordinate_order() {
        let wp = SpeedWaypoint {
            coordinates: vec![-5.98, 37.38],
            speed_kmh: 50.0,
        };
        assert_eq!(wp.position(), Some(GeoPoint::new(37.38, -5.98)));

        let short = SpeedWaypoint {
            coordinates: vec![-5.98],
            speed_kmh: 50.0,
        };
        assert_eq!(short.position(), None);
    }

    #[test]
    fn test_geometry_json_shape_tag() {
        let json = r#"{"shape":"annotated","points":[{"coordinates":[-5.9,37.3],"speed_kmh":30.0}]}"#;
        let geometry: RouteGeometry = serde_json::from_str(json).unwrap();
        assert!(matches!(geometry, RouteGeometry::Annotated { ref points } if points.len() == 1));
    }
}
