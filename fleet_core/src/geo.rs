//! Geodesy helpers: great-circle distance, bearing, random disc sampling.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Mean Earth radius in metres.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Kilometres per degree of latitude, as used for disc sampling.
const KM_PER_DEGREE: f64 = 111.0;

/// A WGS-84 coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    #[inline]
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Returns true for finite coordinates inside the WGS-84 ranges.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    /// Haversine great-circle distance in metres.
    pub fn distance_m(self, other: GeoPoint) -> f64 {
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lon = (other.lon - self.lon).to_radians();

        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();

        let a = (d_lat * 0.5).sin().powi(2)
            + lat1.cos() * lat2.cos() * (d_lon * 0.5).sin().powi(2);

        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_M * c
    }

    /// Initial bearing towards `other`, in degrees within `[0, 360)`.
    pub fn bearing_to(self, other: GeoPoint) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let d_lon = (other.lon - self.lon).to_radians();

        let y = d_lon.sin() * lat2.cos();
        let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * d_lon.cos();

        (y.atan2(x).to_degrees() + 360.0) % 360.0
    }

    /// Linear blend between `self` (t = 0) and `other` (t = 1).
    pub fn lerp(self, other: GeoPoint, t: f64) -> GeoPoint {
        GeoPoint {
            lat: self.lat + (other.lat - self.lat) * t,
            lon: self.lon + (other.lon - self.lon) * t,
        }
    }
}

impl std::fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.6}, {:.6})", self.lat, self.lon)
    }
}

/// Smallest angle between two bearings, in degrees within `[0, 180]`.
pub fn bearing_deviation(a: f64, b: f64) -> f64 {
    let diff = (a - b).abs() % 360.0;
    if diff > 180.0 {
        360.0 - diff
    } else {
        diff
    }
}

/// Picks a point uniformly inside a disc of `radius_km` around `center`.
///
/// `u` and `v` are independent uniform samples in `[0, 1)`; the caller owns
/// the RNG so generation stays reproducible.
pub fn random_location(center: GeoPoint, radius_km: f64, u: f64, v: f64) -> GeoPoint {
    let radius_deg = radius_km / KM_PER_DEGREE;

    let w = radius_deg * u.sqrt();
    let t = 2.0 * PI * v;
    let x = w * t.cos();
    let y = w * t.sin();

    // Shrink the east-west offset with latitude
    let new_x = x / center.lat.to_radians().cos();

    GeoPoint::new(center.lat + y, center.lon + new_x)
}
