//! Path Preprocessor - turns raw route geometry into a dense, time-annotated
//! sequence of positions for second-granularity playback.
//!
//! # Pipeline
//!
//! ```text
//! RouteGeometry ──► from_geometry ──► interpolated(2.5 m) ──► personalised(f, h)
//!   (provider)       durations,         no gap wider than        per-agent speed
//!                    speeds, R-R        the resolution           and HR factors
//! ```
//!
//! The resolution is chosen so that an agent at the minimum simulated speed
//! (10 km/h, 2.78 m/s) never skips more than one point per tick.

use crate::geo::GeoPoint;
use crate::route::RouteGeometry;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// No agent is ever simulated slower than this (km/h).
pub const MIN_SPEED_KMH: f64 = 10.0;

/// Maximum spacing between consecutive points after interpolation (m).
pub const INTERPOLATION_RESOLUTION_M: f64 = 2.5;

/// Resting R-R interval assigned to every provider point (ms).
pub const DEFAULT_RR_MS: u32 = 850;

/// Heart rate in bpm for an R-R interval in ms: `ceil(60000 / rr)`.
pub fn heart_rate_from_rr(rr_ms: u32) -> u32 {
    if rr_ms == 0 {
        return 0;
    }
    60_000u32.div_ceil(rr_ms)
}

/// Errors raised while building a path. All of them are recoverable: the
/// caller discards the candidate and asks for a new origin/destination.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PathError {
    /// Fewer than two usable points
    #[error("Path needs at least 2 usable points, got {0}")]
    TooFewPoints(usize),

    /// Coordinate outside WGS-84 ranges or not finite
    #[error("Invalid coordinate ({lat}, {lon})")]
    InvalidCoordinate { lat: f64, lon: f64 },

    /// A leg with points but no length
    #[error("Leg {0} has zero length but spans distinct points")]
    ZeroLengthLeg(usize),

    /// A moving point annotated with a non-positive speed
    #[error("Point {index} has non-positive speed {speed_kmh} km/h")]
    NonPositiveSpeed { index: usize, speed_kmh: f64 },

    /// Seconds-to-arrive decreases between two points
    #[error("Seconds-to-arrive decreases at point {0}")]
    NonMonotonicTime(usize),

    /// Encoded polyline is malformed
    #[error("Invalid polyline: {0}")]
    InvalidPolyline(String),
}

/// One time-annotated position along a path. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PathPoint {
    /// Position
    pub position: GeoPoint,

    /// Speed at this point (km/h)
    pub speed_kmh: f64,

    /// Heart rate (bpm)
    pub heart_rate: u32,

    /// R-R interval (ms)
    pub rr_ms: u32,

    /// Cumulative seconds from path start to reach this point
    pub seconds_to_arrive: u64,
}

impl PathPoint {
    /// Creates a point with resting R-R and heart rate.
    pub fn resting(position: GeoPoint, speed_kmh: f64, seconds_to_arrive: u64) -> Self {
        Self {
            position,
            speed_kmh,
            heart_rate: heart_rate_from_rr(DEFAULT_RR_MS),
            rr_ms: DEFAULT_RR_MS,
            seconds_to_arrive,
        }
    }
}

/// An ordered, non-empty path with non-decreasing seconds-to-arrive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPath {
    points: Vec<PathPoint>,
    distance_m: f64,
}

impl AgentPath {
    /// Validates and wraps a point sequence.
    pub fn new(points: Vec<PathPoint>) -> Result<Self, PathError> {
        if points.len() < 2 {
            return Err(PathError::TooFewPoints(points.len()));
        }
        for (i, point) in points.iter().enumerate() {
            if !point.position.is_valid() {
                return Err(PathError::InvalidCoordinate {
                    lat: point.position.lat,
                    lon: point.position.lon,
                });
            }
            if i > 0 && point.seconds_to_arrive < points[i - 1].seconds_to_arrive {
                return Err(PathError::NonMonotonicTime(i));
            }
        }

        let distance_m = points
            .windows(2)
            .map(|w| w[0].position.distance_m(w[1].position))
            .sum();

        Ok(Self { points, distance_m })
    }

    /// Builds a path from provider geometry, accepting either shape.
    ///
    /// Consecutive duplicate positions are dropped.
    pub fn from_geometry(geometry: &RouteGeometry) -> Result<Self, PathError> {
        let mut points: Vec<PathPoint> = Vec::new();
        let mut elapsed: u64 = 0;

        match geometry {
            RouteGeometry::Legs { legs } => {
                for (leg_index, leg) in legs.iter().enumerate() {
                    for position in leg.resolved_points()? {
                        check_coordinate(position)?;
                        let distance = points
                            .last()
                            .map(|p| p.position.distance_m(position))
                            .unwrap_or(0.0);
                        if !points.is_empty() && distance == 0.0 {
                            continue;
                        }
                        if distance > 0.0 && leg.distance_m <= 0.0 {
                            return Err(PathError::ZeroLengthLeg(leg_index));
                        }

                        let duration = if distance > 0.0 {
                            (leg.duration_s * distance / leg.distance_m).ceil().max(0.0) as u64
                        } else {
                            0
                        };
                        let speed = if duration > 0 {
                            distance * 3.6 / duration as f64
                        } else {
                            0.0
                        };

                        elapsed += duration;
                        points.push(PathPoint::resting(position, speed, elapsed));
                    }
                }
            }
            RouteGeometry::Annotated { points: waypoints } => {
                for (index, waypoint) in waypoints.iter().enumerate() {
                    let Some(position) = waypoint.position() else {
                        continue;
                    };
                    check_coordinate(position)?;
                    let distance = points
                        .last()
                        .map(|p| p.position.distance_m(position))
                        .unwrap_or(0.0);
                    if !points.is_empty() && distance == 0.0 {
                        continue;
                    }
                    if distance > 0.0 && waypoint.speed_kmh <= 0.0 {
                        return Err(PathError::NonPositiveSpeed {
                            index,
                            speed_kmh: waypoint.speed_kmh,
                        });
                    }

                    let duration = if distance > 0.0 {
                        (distance / (waypoint.speed_kmh / 3.6)).ceil() as u64
                    } else {
                        0
                    };

                    elapsed += duration;
                    points.push(PathPoint::resting(position, waypoint.speed_kmh, elapsed));
                }
            }
        }

        Self::new(points)
    }

    /// Inserts blended points so no gap exceeds `resolution_m`.
    ///
    /// Each segment contributes its start point plus `ceil(d / resolution) - 1`
    /// inner points; the destination is appended once at the end.
    pub fn interpolated(&self, resolution_m: f64) -> AgentPath {
        let mut out = Vec::with_capacity(self.points.len());

        for pair in self.points.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            let distance = a.position.distance_m(b.position);
            let steps = (distance / resolution_m).ceil().max(1.0) as usize;

            for i in 0..steps {
                let t = i as f64 / steps as f64;
                out.push(blend(&a, &b, t));
            }
        }
        if let Some(last) = self.points.last() {
            out.push(*last);
        }

        AgentPath {
            distance_m: self.distance_m,
            points: out,
        }
    }

    /// Derives the path travelled backwards, with the segment timings kept.
    pub fn reversed(&self) -> AgentPath {
        let total = self.total_seconds();
        let points = self
            .points
            .iter()
            .rev()
            .map(|p| PathPoint {
                seconds_to_arrive: total - p.seconds_to_arrive,
                ..*p
            })
            .collect();

        AgentPath {
            points,
            distance_m: self.distance_m,
        }
    }

    /// Applies a per-agent driving style.
    ///
    /// Speeds are scaled by `speed_factor` and clamped to [`MIN_SPEED_KMH`];
    /// arrival times are rescaled to match; heart rates are scaled by
    /// `hr_factor`. `personalised(1.0, 1.0)` only applies the clamp.
    pub fn personalised(&self, speed_factor: f64, hr_factor: f64) -> AgentPath {
        let mut previous_arrival = 0u64;
        let points = self
            .points
            .iter()
            .map(|p| {
                let scaled = p.speed_kmh * speed_factor;
                let (speed_kmh, arrival) = if scaled < MIN_SPEED_KMH {
                    let s = p.seconds_to_arrive as f64 * (p.speed_kmh / MIN_SPEED_KMH);
                    (MIN_SPEED_KMH, s.ceil() as u64)
                } else {
                    let s = p.seconds_to_arrive as f64 / speed_factor;
                    (scaled, s.ceil() as u64)
                };
                // Clamped points may otherwise arrive before their predecessor
                previous_arrival = previous_arrival.max(arrival);

                PathPoint {
                    speed_kmh,
                    heart_rate: (p.heart_rate as f64 * hr_factor) as u32,
                    seconds_to_arrive: previous_arrival,
                    ..*p
                }
            })
            .collect();

        AgentPath {
            points,
            distance_m: self.distance_m,
        }
    }

    pub fn points(&self) -> &[PathPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Always false for a validated path.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn origin(&self) -> &PathPoint {
        &self.points[0]
    }

    pub fn destination(&self) -> &PathPoint {
        &self.points[self.points.len() - 1]
    }

    /// Seconds needed to reach the destination.
    pub fn total_seconds(&self) -> u64 {
        self.destination().seconds_to_arrive
    }

    /// Great-circle length of the path (m).
    pub fn distance_m(&self) -> f64 {
        self.distance_m
    }
}

fn check_coordinate(position: GeoPoint) -> Result<(), PathError> {
    if position.is_valid() {
        Ok(())
    } else {
        Err(PathError::InvalidCoordinate {
            lat: position.lat,
            lon: position.lon,
        })
    }
}

fn blend(a: &PathPoint, b: &PathPoint, t: f64) -> PathPoint {
    let lerp = |x: f64, y: f64| x + (y - x) * t;
    PathPoint {
        position: a.position.lerp(b.position, t),
        speed_kmh: lerp(a.speed_kmh, b.speed_kmh),
        heart_rate: lerp(a.heart_rate as f64, b.heart_rate as f64) as u32,
        rr_ms: lerp(a.rr_ms as f64, b.rr_ms as f64) as u32,
        seconds_to_arrive: lerp(a.seconds_to_arrive as f64, b.seconds_to_arrive as f64) as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{RouteLeg, SpeedWaypoint};
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    /// Moves `meters` north of `from`.
    fn north(from: GeoPoint, meters: f64) -> GeoPoint {
        GeoPoint::new(from.lat + meters / 111_194.93, from.lon)
    }

    fn three_point_geometry() -> RouteGeometry {
        let a = GeoPoint::new(37.0, -6.0);
        let b = north(a, 100.0);
        let c = north(b, 100.0);
        RouteGeometry::Annotated {
            points: vec![
                SpeedWaypoint::new(a, 36.0),
                SpeedWaypoint::new(b, 36.0),
                SpeedWaypoint::new(c, 36.0),
            ],
        }
    }

    #[test]
    fn test_heart_rate_from_rr() {
        assert_eq!(heart_rate_from_rr(850), 71);
        assert_eq!(heart_rate_from_rr(1000), 60);
        assert_eq!(heart_rate_from_rr(0), 0);
    }

    #[test]
    fn test_annotated_uniform_speed_timings() {
        let path = AgentPath::from_geometry(&three_point_geometry()).unwrap();
        let stbh: Vec<u64> = path.points().iter().map(|p| p.seconds_to_arrive).collect();
        assert_eq!(stbh, vec![0, 10, 20]);
        assert_relative_eq!(path.distance_m(), 200.0, epsilon = 0.01);
        assert_eq!(path.origin().rr_ms, DEFAULT_RR_MS);
    }

    #[test]
    fn test_legs_distribute_duration() {
        let a = GeoPoint::new(37.0, -6.0);
        let b = north(a, 300.0);
        let c = north(b, 100.0);
        let geometry = RouteGeometry::Legs {
            legs: vec![RouteLeg {
                distance_m: 400.0,
                duration_s: 40.0,
                points: vec![a, b, c],
                polyline: None,
            }],
        };
        let path = AgentPath::from_geometry(&geometry).unwrap();
        assert_eq!(path.points()[1].seconds_to_arrive, 30);
        assert_eq!(path.points()[2].seconds_to_arrive, 40);
        assert_relative_eq!(path.points()[1].speed_kmh, 36.0, epsilon = 0.01);
        // First point has no travelled distance
        assert_eq!(path.origin().speed_kmh, 0.0);
    }

    #[test]
    fn test_rejects_short_and_invalid_paths() {
        let single = RouteGeometry::Annotated {
            points: vec![SpeedWaypoint::new(GeoPoint::new(1.0, 1.0), 50.0)],
        };
        assert_eq!(AgentPath::from_geometry(&single), Err(PathError::TooFewPoints(1)));

        let bad = RouteGeometry::Annotated {
            points: vec![
                SpeedWaypoint::new(GeoPoint::new(1.0, 1.0), 50.0),
                SpeedWaypoint::new(GeoPoint::new(95.0, 1.0), 50.0),
            ],
        };
        assert!(matches!(
            AgentPath::from_geometry(&bad),
            Err(PathError::InvalidCoordinate { .. })
        ));

        let a = GeoPoint::new(37.0, -6.0);
        let stopped = RouteGeometry::Annotated {
            points: vec![SpeedWaypoint::new(a, 30.0), SpeedWaypoint::new(north(a, 50.0), 0.0)],
        };
        assert!(matches!(
            AgentPath::from_geometry(&stopped),
            Err(PathError::NonPositiveSpeed { index: 1, .. })
        ));
    }

    #[test]
    fn test_duplicate_points_are_dropped() {
        let a = GeoPoint::new(37.0, -6.0);
        let b = north(a, 100.0);
        let geometry = RouteGeometry::Annotated {
            points: vec![
                SpeedWaypoint::new(a, 36.0),
                SpeedWaypoint::new(a, 36.0),
                SpeedWaypoint::new(b, 36.0),
            ],
        };
        assert_eq!(AgentPath::from_geometry(&geometry).unwrap().len(), 2);
    }

    #[test]
    fn test_interpolation_keeps_endpoints_once() {
        let path = AgentPath::from_geometry(&three_point_geometry()).unwrap();
        let dense = path.interpolated(INTERPOLATION_RESOLUTION_M);

        // 100 m / 2.5 m = 40 steps per segment, plus the destination
        assert_eq!(dense.len(), 81);
        assert_eq!(dense.origin(), path.origin());
        assert_eq!(dense.destination(), path.destination());
        assert_eq!(dense.points()[40].position, path.points()[1].position);
        assert_eq!(dense.points()[40].seconds_to_arrive, 10);
    }

    #[test]
    fn test_reversed_keeps_segment_timings() {
        let a = GeoPoint::new(37.0, -6.0);
        let geometry = RouteGeometry::Annotated {
            points: vec![
                SpeedWaypoint::new(a, 36.0),
                SpeedWaypoint::new(north(a, 100.0), 36.0),
                SpeedWaypoint::new(north(a, 400.0), 36.0),
            ],
        };
        let path = AgentPath::from_geometry(&geometry).unwrap();
        let back = path.reversed();

        let stbh: Vec<u64> = back.points().iter().map(|p| p.seconds_to_arrive).collect();
        assert_eq!(stbh, vec![0, 30, 40]);
        assert_eq!(back.origin().position, path.destination().position);
        assert_eq!(back.reversed(), path);
    }

    #[test]
    fn test_personalised_clamps_to_min_speed() {
        let a = GeoPoint::new(37.0, -6.0);
        let points = vec![
            PathPoint::resting(a, 50.0, 0),
            PathPoint::resting(north(a, 100.0), 50.0, 100),
            PathPoint::resting(north(a, 110.0), 5.0, 110),
        ];
        let path = AgentPath::new(points).unwrap();

        let same = path.personalised(1.0, 1.0);
        assert_eq!(same.points()[1].seconds_to_arrive, 100);
        assert_eq!(same.points()[2].speed_kmh, MIN_SPEED_KMH);
        // ceil(110 * 5/10) = 55 would go backwards, so it is held at 100
        assert_eq!(same.points()[2].seconds_to_arrive, 100);

        let fast = path.personalised(1.25, 1.1);
        assert_relative_eq!(fast.points()[1].speed_kmh, 62.5);
        assert_eq!(fast.points()[1].seconds_to_arrive, 80);
        assert_eq!(fast.points()[1].heart_rate, (71.0 * 1.1) as u32);
    }

    proptest! {
        #[test]
        fn prop_interpolation_density(
            lat in -60.0f64..60.0,
            lon in -170.0f64..170.0,
            hops in proptest::collection::vec((1.0f64..400.0, 0.0f64..360.0, 10.0f64..130.0), 1..6),
        ) {
            let mut position = GeoPoint::new(lat, lon);
            let mut waypoints = vec![SpeedWaypoint::new(position, 30.0)];
            for (meters, heading, speed) in hops {
                let rad = heading.to_radians();
                position = GeoPoint::new(
                    position.lat + meters * rad.cos() / 111_194.93,
                    position.lon + meters * rad.sin() / (111_194.93 * position.lat.to_radians().cos()),
                );
                waypoints.push(SpeedWaypoint::new(position, speed));
            }

            let path = AgentPath::from_geometry(&RouteGeometry::Annotated { points: waypoints }).unwrap();
            let dense = path.interpolated(INTERPOLATION_RESOLUTION_M);

            for pair in dense.points().windows(2) {
                let gap = pair[0].position.distance_m(pair[1].position);
                prop_assert!(gap <= INTERPOLATION_RESOLUTION_M * 1.001, "gap {} too wide", gap);
                prop_assert!(pair[0].seconds_to_arrive <= pair[1].seconds_to_arrive);
            }
        }
    }
}
