//! Section statistics
//! ==================
//!
//! Every 500 m of travelled distance a driver condenses its buffered
//! per-tick samples (`RoadSection`) into one `DataSection`:
//! - **Descriptive statistics** of speed, heart rate and R-R
//! - **Acceleration profile**: mean acceleration / deceleration and counts
//!   of harsh events
//! - **PKE**: positive kinetic energy per metre, a driving-aggressiveness
//!   indicator

use serde::{Deserialize, Serialize};

/// Summary distance between two data sections (m).
pub const SECTION_DISTANCE_M: f64 = 500.0;

/// Acceleration above which a sample counts as harsh (m/s²).
pub const HIGH_ACCELERATION_THRESHOLD: f64 = 2.5;

/// Deceleration below which a sample counts as harsh (m/s²).
pub const HIGH_DECELERATION_THRESHOLD: f64 = -3.5;

/// One tick's sampled telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoadSection {
    /// Sample time, ms since the Unix epoch
    pub time: i64,
    pub latitude: f64,
    pub longitude: f64,
    /// km/h
    pub speed: f64,
    /// bpm
    pub heart_rate: u32,
    /// ms
    pub rr_time: u32,
    pub accuracy: u32,
}

// =============================================================================
// DESCRIPTIVE STATISTICS
// =============================================================================

/// Mean, median, extremes and sample standard deviation of one series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesStats {
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub standard_deviation: f64,
}

impl SeriesStats {
    /// Computes the statistics; an empty series yields all zeros.
    ///
    /// # Formula
    /// ```text
    /// s = sqrt( Σ (x_i - mean)² / (n - 1) )      (0 when n < 2)
    /// ```
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        let standard_deviation = if values.len() < 2 {
            0.0
        } else {
            let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
            (ss / (n - 1.0)).sqrt()
        };

        Self {
            mean,
            median,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            standard_deviation,
        }
    }
}

// =============================================================================
// DATA SECTION
// =============================================================================

/// Summary of the samples collected over one section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSection {
    pub speed: SeriesStats,
    pub heart_rate: SeriesStats,
    pub rr: SeriesStats,
    /// Mean of the positive accelerations (m/s²)
    pub average_acceleration: f64,
    /// Mean of the negative accelerations (m/s²)
    pub average_deceleration: f64,
    pub num_high_accelerations: u32,
    pub num_high_decelerations: u32,
    /// Σ(v² - v_prev²) over speed increases, divided by section distance
    pub pke: f64,
    pub rr_section: Vec<u32>,
    pub road_section: Vec<RoadSection>,
}

impl DataSection {
    /// Builds the summary from buffered samples.
    ///
    /// Acceleration between consecutive samples is the speed delta (converted
    /// to m/s) over the timestamp delta (s); pairs with no time difference
    /// contribute nothing.
    pub fn from_samples(samples: &[RoadSection], cumulative_pke: f64, distance_m: f64) -> Self {
        let speeds: Vec<f64> = samples.iter().map(|s| s.speed).collect();
        let heart_rates: Vec<f64> = samples.iter().map(|s| s.heart_rate as f64).collect();
        let rrs: Vec<f64> = samples.iter().map(|s| s.rr_time as f64).collect();

        let mut accelerations = Vec::new();
        let mut decelerations = Vec::new();
        let mut num_high_accelerations = 0;
        let mut num_high_decelerations = 0;

        for pair in samples.windows(2) {
            let (prev, cur) = (&pair[0], &pair[1]);
            let v_diff = (cur.speed - prev.speed) / 3.6;
            let t_diff = (cur.time - prev.time) as f64 / 1000.0;
            let acceleration = if t_diff > 0.0 { v_diff / t_diff } else { 0.0 };

            if acceleration > 0.0 {
                accelerations.push(acceleration);
                if acceleration > HIGH_ACCELERATION_THRESHOLD {
                    num_high_accelerations += 1;
                }
            } else if acceleration < 0.0 {
                decelerations.push(acceleration);
                if acceleration < HIGH_DECELERATION_THRESHOLD {
                    num_high_decelerations += 1;
                }
            }
        }

        Self {
            speed: SeriesStats::from_values(&speeds),
            heart_rate: SeriesStats::from_values(&heart_rates),
            rr: SeriesStats::from_values(&rrs),
            average_acceleration: mean_or_zero(&accelerations),
            average_deceleration: mean_or_zero(&decelerations),
            num_high_accelerations,
            num_high_decelerations,
            pke: if distance_m > 0.0 { cumulative_pke / distance_m } else { 0.0 },
            rr_section: samples.iter().map(|s| s.rr_time).collect(),
            road_section: samples.to_vec(),
        }
    }
}

fn mean_or_zero(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

// =============================================================================
// POSITIVE KINETIC ENERGY
// =============================================================================

/// PKE contribution of one move: `v² - v_prev²` (m/s) when speed increased,
/// otherwise 0.
pub fn pke_contribution(previous_kmh: f64, current_kmh: f64) -> f64 {
    let previous = previous_kmh / 3.6;
    let current = current_kmh / 3.6;
    if current > previous {
        current * current - previous * previous
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn sample(time_s: i64, speed: f64, heart_rate: u32, rr_time: u32) -> RoadSection {
        RoadSection {
            time: time_s * 1000,
            latitude: 37.0,
            longitude: -6.0,
            speed,
            heart_rate,
            rr_time,
            accuracy: 0,
        }
    }

    #[test]
    fn test_series_stats() {
        let stats = SeriesStats::from_values(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_relative_eq!(stats.mean, 5.0);
        assert_relative_eq!(stats.median, 4.5);
        assert_relative_eq!(stats.min, 2.0);
        assert_relative_eq!(stats.max, 9.0);
        assert_relative_eq!(stats.standard_deviation, (32.0f64 / 7.0).sqrt());

        let single = SeriesStats::from_values(&[3.0]);
        assert_eq!(single.standard_deviation, 0.0);
        assert_eq!(single.median, 3.0);

        assert_eq!(SeriesStats::from_values(&[]), SeriesStats::default());
    }

    #[test]
    fn test_data_section_accelerations() {
        let samples = [
            sample(0, 36.0, 70, 850),
            sample(1, 54.0, 72, 830), // +5 m/s²
            sample(2, 57.6, 74, 810), // +1 m/s²
            sample(3, 36.0, 75, 800), // -6 m/s²
            sample(4, 28.8, 75, 800), // -2 m/s²
        ];
        let section = DataSection::from_samples(&samples, 250.0, 500.0);

        assert_eq!(section.num_high_accelerations, 1);
        assert_eq!(section.num_high_decelerations, 1);
        assert_relative_eq!(section.average_acceleration, 3.0, epsilon = 1e-9);
        assert_relative_eq!(section.average_deceleration, -4.0, epsilon = 1e-9);
        assert_relative_eq!(section.pke, 0.5);
        assert_eq!(section.rr_section, vec![850, 830, 810, 800, 800]);
        assert_eq!(section.road_section.len(), 5);
        assert_relative_eq!(section.speed.max, 57.6);
        assert_relative_eq!(section.heart_rate.min, 70.0);
    }

    #[test]
    fn test_data_section_zero_distance_pke() {
        let section = DataSection::from_samples(&[sample(0, 36.0, 70, 850)], 10.0, 0.0);
        assert_eq!(section.pke, 0.0);
        assert_eq!(section.average_acceleration, 0.0);
    }

    #[test]
    fn test_data_section_json_keys() {
        let section = DataSection::from_samples(&[sample(0, 36.0, 70, 850)], 0.0, 10.0);
        let json = serde_json::to_value(&section).unwrap();
        assert!(json.get("rrSection").is_some());
        assert!(json["speed"].get("standardDeviation").is_some());
        assert_eq!(json["roadSection"][0]["rrTime"], 850);
    }

    #[test]
    fn test_pke_contribution() {
        assert_relative_eq!(pke_contribution(36.0, 72.0), 300.0, epsilon = 1e-9);
        assert_eq!(pke_contribution(72.0, 36.0), 0.0);
        assert_eq!(pke_contribution(50.0, 50.0), 0.0);
    }

    proptest! {
        #[test]
        fn prop_pke_non_negative(prev in 0.0f64..250.0, cur in 0.0f64..250.0) {
            let pke = pke_contribution(prev, cur);
            prop_assert!(pke >= 0.0);
            if cur <= prev {
                prop_assert_eq!(pke, 0.0);
            }
        }
    }
}
