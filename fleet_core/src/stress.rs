//! Stress heuristic and R-R / heart-rate derivation.
//!
//! Stress is a non-negative integer load. Each tick starts out "relaxing";
//! a sharp bearing change or speed jump adds load and cancels relaxing,
//! calm driving removes one unit per factor.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Youngest simulated driver.
pub const MIN_AGE: u32 = 18;

/// Oldest simulated driver.
pub const MAX_AGE: u32 = 65;

/// Load at and above which R-R is pinned to the driver's minimum.
pub const HIGH_STRESS_LOAD: u32 = 5;

/// Effect of one stress factor on the load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StressDelta {
    /// Remove one unit (never below zero)
    Relax,

    /// Add units and stop relaxing
    Add(u32),
}

// Bearing tiers in degrees. The second and third tiers share the same 45°
// bound, so the +2 tier can never be selected and a 45°+ turn scores +5.
// TODO: confirm the intended bound of the +2 tier (likely 90°) with the
// telemetry consumers before changing scores.
const DEVIATION_TIERS: [(f64, StressDelta); 3] = [
    (25.0, StressDelta::Relax),
    (45.0, StressDelta::Add(1)),
    (45.0, StressDelta::Add(2)),
];
const DEVIATION_OVERFLOW: StressDelta = StressDelta::Add(5);

// Absolute speed change between positions, km/h.
const SPEED_TIERS: [(f64, StressDelta); 3] = [
    (30.0, StressDelta::Relax),
    (50.0, StressDelta::Add(1)),
    (100.0, StressDelta::Add(2)),
];
const SPEED_OVERFLOW: StressDelta = StressDelta::Add(5);

fn classify(value: f64, tiers: &[(f64, StressDelta)], overflow: StressDelta) -> StressDelta {
    tiers
        .iter()
        .find(|(bound, _)| value < *bound)
        .map(|(_, delta)| *delta)
        .unwrap_or(overflow)
}

/// Stress contribution of a bearing deviation (degrees).
pub fn deviation_delta(bearing_diff_deg: f64) -> StressDelta {
    classify(bearing_diff_deg, &DEVIATION_TIERS, DEVIATION_OVERFLOW)
}

/// Stress contribution of a speed change (km/h).
pub fn speed_delta(speed_diff_kmh: f64) -> StressDelta {
    classify(speed_diff_kmh, &SPEED_TIERS, SPEED_OVERFLOW)
}

/// Running stress state of one driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StressState {
    /// Current load (>= 0)
    pub load: u32,

    /// True while no factor added load during this tick
    pub relaxing: bool,
}

impl StressState {
    /// Resets the relaxing flag at the start of a tick.
    pub fn begin_tick(&mut self) {
        self.relaxing = true;
    }

    /// Applies one factor.
    pub fn apply(&mut self, delta: StressDelta) {
        match delta {
            StressDelta::Relax => self.load = self.load.saturating_sub(1),
            StressDelta::Add(units) => {
                self.load += units;
                self.relaxing = false;
            }
        }
    }

    /// Derives the R-R interval (ms) for the new position.
    ///
    /// - no load: the point's own R-R
    /// - relaxing: moves back towards the point's R-R by `1/load` of the gap
    /// - light load: drops by `min_rr / load`
    /// - high load: pinned to `min_rr`
    ///
    /// The result never goes below `min_rr`.
    pub fn next_rr(&self, previous_rr: u32, point_rr: u32, min_rr: u32) -> u32 {
        let prev = previous_rr as i64;
        let point = point_rr as i64;
        let min = min_rr as i64;
        let load = self.load as i64;

        let rr = if load == 0 {
            point
        } else if self.relaxing {
            prev - (prev - point) / load
        } else if self.load < HIGH_STRESS_LOAD {
            prev - min / load
        } else {
            min
        };

        rr.max(min) as u32
    }
}

/// Physiological constants of one driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverProfile {
    /// Age in years
    pub age: u32,

    /// Shortest R-R interval (ms), from the max heart rate `220 - age`
    pub min_rr_ms: u32,
}

impl DriverProfile {
    pub fn from_age(age: u32) -> Self {
        let max_hr = 220u32.saturating_sub(age).max(1);
        Self {
            age,
            min_rr_ms: 60_000u32.div_ceil(max_hr),
        }
    }

    /// Draws an age uniformly in `MIN_AGE..=MAX_AGE`.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self::from_age(rng.gen_range(MIN_AGE..=MAX_AGE))
    }
}
