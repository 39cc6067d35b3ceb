//! Agent Motion & Stress Model.
//!
//! Pure per-agent computation, one step per simulated second:
//!
//! ```text
//!  elapsed >= next.seconds_to_arrive ?
//!        │ no ──► Idle
//!        ▼ yes
//!  advance index (may skip points) ──► distance, bearing
//!        │
//!  stress(bearing deviation) + stress(speed delta) ──► R-R ──► heart rate
//!        │
//!  section distance += d, PKE += max(0, v² - v_prev²), buffer RoadSection
//!        │
//!  index == last ? ──► Arrived (or Reversed when looping)
//! ```
//!
//! The clock is advanced separately by [`MotionModel::end_tick`] so that the
//! publishing cadences of the same tick observe the pre-increment time.

use crate::geo::bearing_deviation;
use crate::path::{heart_rate_from_rr, AgentPath, PathPoint};
use crate::section::{pke_contribution, DataSection, RoadSection, SECTION_DISTANCE_M};
use crate::stress::{deviation_delta, speed_delta, DriverProfile, StressState};
use std::sync::Arc;

/// What one step did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    /// Next point not due yet
    Idle,

    /// Moved to a new point
    Moved(RoadSection),

    /// Moved onto the destination; the path is complete
    Arrived(RoadSection),

    /// Moved onto the destination and restarted on the reversed path
    Reversed(RoadSection),

    /// Already complete, nothing happens
    Finished,
}

impl StepOutcome {
    /// The sample recorded by this step, if any.
    pub fn sample(&self) -> Option<&RoadSection> {
        match self {
            StepOutcome::Moved(s) | StepOutcome::Arrived(s) | StepOutcome::Reversed(s) => Some(s),
            StepOutcome::Idle | StepOutcome::Finished => None,
        }
    }
}

/// Mutable state of one agent. Owned by its motion model only.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentState {
    /// Index of the last point reached
    pub index: usize,

    /// Simulated seconds since (re)starting the path
    pub elapsed_secs: u64,

    /// Stress load and relaxing flag
    pub stress: StressState,

    /// Current R-R interval (ms)
    pub rr_ms: u32,

    /// Current heart rate (bpm)
    pub heart_rate: u32,

    /// Distance since the last data section (m)
    pub section_distance_m: f64,

    /// PKE accumulated since the last data section
    pub cumulative_pke: f64,

    /// Samples since the last data section
    pub road_sections: Vec<RoadSection>,

    /// Position changed since the last successful location send
    pub location_changed: bool,

    /// Path completed (never set when looping)
    pub finished: bool,

    /// Completed traversals in looping mode
    pub laps: u32,

    /// Simulated seconds across all laps
    pub total_secs: u64,
}

impl AgentState {
    fn at_start(origin: &PathPoint) -> Self {
        Self {
            index: 0,
            elapsed_secs: 0,
            stress: StressState::default(),
            rr_ms: origin.rr_ms,
            heart_rate: origin.heart_rate,
            section_distance_m: 0.0,
            cumulative_pke: 0.0,
            road_sections: Vec::new(),
            location_changed: false,
            finished: false,
            laps: 0,
            total_secs: 0,
        }
    }
}

/// Drives one agent along its path.
#[derive(Debug, Clone)]
pub struct MotionModel {
    path: Arc<AgentPath>,
    profile: DriverProfile,
    infinite: bool,
    epoch_ms: i64,
    state: AgentState,
}

impl MotionModel {
    /// Creates a model at the path origin.
    ///
    /// `epoch_ms` is the wall-clock instant of simulated second 0; sample
    /// timestamps are `epoch_ms + elapsed * 1000`.
    pub fn new(path: Arc<AgentPath>, profile: DriverProfile, infinite: bool, epoch_ms: i64) -> Self {
        let state = AgentState::at_start(path.origin());
        Self {
            path,
            profile,
            infinite,
            epoch_ms,
            state,
        }
    }

    /// Advances the position if the next point is due.
    pub fn step(&mut self) -> StepOutcome {
        if self.state.finished {
            return StepOutcome::Finished;
        }
        self.state.stress.begin_tick();

        let points = self.path.points();
        let last = points.len() - 1;
        let elapsed = self.state.elapsed_secs;

        if self.state.index >= last || points[self.state.index + 1].seconds_to_arrive > elapsed {
            return StepOutcome::Idle;
        }

        let previous_index = self.state.index;
        let mut index = previous_index + 1;
        while index < last && points[index + 1].seconds_to_arrive <= elapsed {
            index += 1;
        }
        self.state.index = index;

        let sample = self.move_between(previous_index, index);

        if index < last {
            StepOutcome::Moved(sample)
        } else if self.infinite {
            self.path = Arc::new(self.path.reversed());
            self.state.index = 0;
            self.state.elapsed_secs = 0;
            self.state.laps += 1;
            StepOutcome::Reversed(sample)
        } else {
            self.state.finished = true;
            StepOutcome::Arrived(sample)
        }
    }

    /// Bearing deviation is scored from the third point on: the leg into
    /// `previous_index` must itself follow an earlier leg.
    fn move_between(&mut self, previous_index: usize, index: usize) -> RoadSection {
        let points = self.path.points();
        let previous = &points[previous_index];
        let current = &points[index];

        let distance = previous.position.distance_m(current.position);
        let bearing = previous.position.bearing_to(current.position);

        if previous_index > 1 {
            let before = &points[previous_index - 1];
            let previous_bearing = before.position.bearing_to(previous.position);
            self.state
                .stress
                .apply(deviation_delta(bearing_deviation(bearing, previous_bearing)));
        }
        self.state
            .stress
            .apply(speed_delta((current.speed_kmh - previous.speed_kmh).abs()));

        let rr = self
            .state
            .stress
            .next_rr(self.state.rr_ms, current.rr_ms, self.profile.min_rr_ms);
        self.state.rr_ms = rr;
        self.state.heart_rate = heart_rate_from_rr(rr);

        self.state.section_distance_m += distance;
        self.state.cumulative_pke += pke_contribution(previous.speed_kmh, current.speed_kmh);

        let t_diff = current.seconds_to_arrive.saturating_sub(previous.seconds_to_arrive);
        let speed = if t_diff > 0 {
            distance * 3.6 / t_diff as f64
        } else {
            previous.speed_kmh
        };

        let sample = RoadSection {
            time: self.epoch_ms + (self.state.total_secs as i64) * 1000,
            latitude: current.position.lat,
            longitude: current.position.lon,
            speed,
            heart_rate: self.state.heart_rate,
            rr_time: rr,
            accuracy: 0,
        };
        self.state.road_sections.push(sample);
        self.state.location_changed = true;

        sample
    }

    /// Advances the simulated clock by one second.
    pub fn end_tick(&mut self) {
        if !self.state.finished {
            self.state.elapsed_secs += 1;
            self.state.total_secs += 1;
        }
    }

    /// True once at least [`SECTION_DISTANCE_M`] has been covered.
    pub fn section_due(&self) -> bool {
        self.state.section_distance_m >= SECTION_DISTANCE_M
    }

    /// True when samples are buffered.
    pub fn has_samples(&self) -> bool {
        !self.state.road_sections.is_empty()
    }

    /// Summarises and clears the section buffer and accumulators.
    ///
    /// Returns `None` when nothing was buffered.
    pub fn take_section(&mut self) -> Option<DataSection> {
        let section = if self.state.road_sections.is_empty() {
            None
        } else {
            Some(DataSection::from_samples(
                &self.state.road_sections,
                self.state.cumulative_pke,
                self.state.section_distance_m,
            ))
        };
        self.state.road_sections.clear();
        self.state.section_distance_m = 0.0;
        self.state.cumulative_pke = 0.0;
        section
    }

    /// Marks the current position as reported.
    pub fn clear_location_changed(&mut self) {
        self.state.location_changed = false;
    }

    /// The point the agent is at.
    pub fn current_point(&self) -> &PathPoint {
        &self.path.points()[self.state.index]
    }

    /// Wall-clock time (ms) of the current simulated second.
    pub fn current_time_ms(&self) -> i64 {
        self.epoch_ms + (self.state.total_secs as i64) * 1000
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn profile(&self) -> &DriverProfile {
        &self.profile
    }

    pub fn path(&self) -> &Arc<AgentPath> {
        &self.path
    }
}
