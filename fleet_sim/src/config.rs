//! Fleet configuration: options, enumerations and validation.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use fleet_core::GeoPoint;
use fleet_env::RetryBudget;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Seville city centre, the default path-generation centre.
pub const DEFAULT_CENTER: GeoPoint = GeoPoint {
    lat: 37.389_835_8,
    lon: -5.986_069,
};

/// Hard cap on simultaneously simulated agents.
pub const MAX_AGENTS: usize = 10_000;

/// Format of the scheduled start time (local time), e.g. `2026-10-16_08.30.00`.
pub const SCHEDULE_FORMAT: &str = "%Y-%m-%d_%H.%M.%S";

/// Errors raised while loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("distance_from_center_km must be in 1..=100, got {0}")]
    DistanceFromCenter(u32),

    #[error("max_path_distance_km must be in 1..=100, got {0}")]
    MaxPathDistance(u32),

    #[error("paths must be in 1..=10, got {0}")]
    Paths(usize),

    #[error("drivers_per_path must be in 1..=3000, got {0}")]
    DriversPerPath(usize),

    #[error("retries must be in -1..=5, got {0}")]
    Retries(i32),

    #[error("seconds_between_retries must be in 1..=60, got {0}")]
    SecondsBetweenRetries(u64),

    #[error("status_interval_secs must be positive")]
    StatusInterval,

    #[error("pool_size must be positive")]
    PoolSize,

    #[error("max_duration_secs must be positive")]
    MaxDuration,

    #[error("reject and error rates must be in 0.0..=1.0")]
    FaultRate,

    #[error("Invalid schedule '{0}', expected yyyy-MM-dd_HH.mm.ss")]
    InvalidScheduleFormat(String),

    #[error("Invalid notification e-mail '{0}'")]
    InvalidEmail(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Start-time stagger policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartingMode {
    /// Uniformly random delay below one minute
    Aleatory,

    /// A tenth of the fleet every 10 s
    Lineal,

    /// Everyone at once
    #[default]
    SameTime,
}

impl StartingMode {
    /// Upper bound of the random initial delay (ms).
    pub const MAX_ALEATORY_DELAY_MS: u64 = 60_000;

    /// Delay between two linear bunches (ms).
    pub const LINEAL_STEP_MS: u64 = 10_000;

    pub fn all() -> Vec<StartingMode> {
        vec![StartingMode::Aleatory, StartingMode::Lineal, StartingMode::SameTime]
    }

    pub fn name(&self) -> &'static str {
        match self {
            StartingMode::Aleatory => "aleatory",
            StartingMode::Lineal => "lineal",
            StartingMode::SameTime => "same_time",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            StartingMode::Aleatory => "Each driver starts after a random delay below 60 s",
            StartingMode::Lineal => "10% of the drivers start every 10 s",
            StartingMode::SameTime => "All drivers start at once",
        }
    }

    /// Extra start delay (ms) of driver `index` out of `total`.
    ///
    /// `random_unit` is a draw in `[0, 1)`, only used by `Aleatory`.
    pub fn stagger_ms(&self, index: usize, total: usize, random_unit: f64) -> u64 {
        match self {
            StartingMode::Aleatory => (random_unit * Self::MAX_ALEATORY_DELAY_MS as f64) as u64,
            StartingMode::Lineal => {
                let bunch = if total > 10 { (total / 10).max(1) } else { 1 };
                Self::LINEAL_STEP_MS * (index / bunch) as u64
            }
            StartingMode::SameTime => 0,
        }
    }
}

impl std::fmt::Display for StartingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for StartingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "aleatory" | "random" => Ok(StartingMode::Aleatory),
            "lineal" | "linear" => Ok(StartingMode::Lineal),
            "same_time" | "sametime" | "same-time" => Ok(StartingMode::SameTime),
            _ => Err(format!("Unknown starting mode: {}", s)),
        }
    }
}

/// Wall-clock length of one simulated second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeRate {
    #[default]
    X1,
    X10,
    X100,
    X1000,
}

impl TimeRate {
    pub fn all() -> Vec<TimeRate> {
        vec![TimeRate::X1, TimeRate::X10, TimeRate::X100, TimeRate::X1000]
    }

    pub fn name(&self) -> &'static str {
        match self {
            TimeRate::X1 => "x1",
            TimeRate::X10 => "x10",
            TimeRate::X100 => "x100",
            TimeRate::X1000 => "x1000",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            TimeRate::X1 => "Real time",
            TimeRate::X10 => "Ten times faster",
            TimeRate::X100 => "A hundred times faster",
            TimeRate::X1000 => "A thousand times faster",
        }
    }

    pub fn millis_per_tick(&self) -> u64 {
        match self {
            TimeRate::X1 => 1000,
            TimeRate::X10 => 100,
            TimeRate::X100 => 10,
            TimeRate::X1000 => 1,
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.millis_per_tick())
    }
}

impl std::fmt::Display for TimeRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for TimeRate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "x1" | "1" => Ok(TimeRate::X1),
            "x10" | "10" => Ok(TimeRate::X10),
            "x100" | "100" => Ok(TimeRate::X100),
            "x1000" | "1000" => Ok(TimeRate::X1000),
            _ => Err(format!("Unknown time rate: {}", s)),
        }
    }
}

/// Delivery backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// In-process broker with fault injection
    #[default]
    Sim,

    /// In-process partitioned append log
    Log,

    /// JSON POST to a remote endpoint
    Http,
}

impl SinkKind {
    pub fn all() -> Vec<SinkKind> {
        vec![SinkKind::Sim, SinkKind::Log, SinkKind::Http]
    }

    pub fn name(&self) -> &'static str {
        match self {
            SinkKind::Sim => "sim",
            SinkKind::Log => "log",
            SinkKind::Http => "http",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            SinkKind::Sim => "Simulated broker with seeded rejects, errors and latency",
            SinkKind::Log => "Partitioned append log with per-record acknowledgements",
            SinkKind::Http => "HTTP publish-and-acknowledge",
        }
    }
}

impl std::fmt::Display for SinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sim" | "simulated" => Ok(SinkKind::Sim),
            "log" | "append_log" | "kafka" => Ok(SinkKind::Log),
            "http" | "rest" => Ok(SinkKind::Http),
            _ => Err(format!("Unknown sink: {}", s)),
        }
    }
}

/// Where routes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathSourceKind {
    #[default]
    Synthetic,
    Files,
}

impl PathSourceKind {
    pub fn all() -> Vec<PathSourceKind> {
        vec![PathSourceKind::Synthetic, PathSourceKind::Files]
    }

    pub fn name(&self) -> &'static str {
        match self {
            PathSourceKind::Synthetic => "synthetic",
            PathSourceKind::Files => "files",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            PathSourceKind::Synthetic => "Offline routes with seeded detours and speed limits",
            PathSourceKind::Files => "Route JSON files loaded from a directory",
        }
    }
}

impl std::fmt::Display for PathSourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for PathSourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "synthetic" | "offline" => Ok(PathSourceKind::Synthetic),
            "files" | "file" | "dir" => Ok(PathSourceKind::Files),
            _ => Err(format!("Unknown path source: {}", s)),
        }
    }
}

/// Everything a run needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Centre of the path-generation area
    pub center: GeoPoint,

    /// Origins are drawn within this radius of the centre (km)
    pub distance_from_center_km: u32,

    /// Destinations are drawn within this radius of the origin (km)
    pub max_path_distance_km: u32,

    /// Distinct paths to generate
    pub paths: usize,

    /// Drivers sharing each path
    pub drivers_per_path: usize,

    pub path_source: PathSourceKind,

    /// Directory of route files for [`PathSourceKind::Files`]
    pub routes_dir: Option<PathBuf>,

    pub starting_mode: StartingMode,

    pub retry_on_fail: bool,

    pub seconds_between_retries: u64,

    /// Retry budget per event, -1 for unlimited
    pub retries: i32,

    pub time_rate: TimeRate,

    /// Restart drivers on the reversed path instead of finishing
    pub infinite: bool,

    /// Per-driver speed and heart-rate factors
    pub randomize_behaviour: bool,

    /// Simulation budget (s); the watchdog adds a safety margin
    pub max_duration_secs: u64,

    pub status_interval_secs: u64,

    /// Concurrent ticks allowed fleet-wide
    pub pool_size: usize,

    pub sink: SinkKind,

    /// Endpoint of the HTTP sink
    pub url: Option<String>,

    /// Simulated broker reject probability
    pub reject_rate: f64,

    /// Simulated broker transport-error probability
    pub error_rate: f64,

    /// Partitions per topic of the append log
    pub partitions: usize,

    /// Collect per-attempt and per-event monitoring records
    pub monitor: bool,

    /// Named in the end-of-run summary
    pub notify_email: Option<String>,

    /// 0 draws from OS entropy
    pub seed: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            center: DEFAULT_CENTER,
            distance_from_center_km: 1,
            max_path_distance_km: 10,
            paths: 1,
            drivers_per_path: 1,
            path_source: PathSourceKind::Synthetic,
            routes_dir: None,
            starting_mode: StartingMode::SameTime,
            retry_on_fail: true,
            seconds_between_retries: 10,
            retries: -1,
            time_rate: TimeRate::X1,
            infinite: false,
            randomize_behaviour: true,
            max_duration_secs: 14_400,
            status_interval_secs: 2,
            pool_size: 100,
            sink: SinkKind::Sim,
            url: None,
            reject_rate: 0.0,
            error_rate: 0.0,
            partitions: 4,
            monitor: false,
            notify_email: None,
            seed: 42,
        }
    }
}

impl FleetConfig {
    /// Loads a configuration from a JSON file. Missing keys take defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn with_paths(mut self, paths: usize) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_drivers_per_path(mut self, drivers: usize) -> Self {
        self.drivers_per_path = drivers;
        self
    }

    pub fn with_starting_mode(mut self, mode: StartingMode) -> Self {
        self.starting_mode = mode;
        self
    }

    pub fn with_time_rate(mut self, rate: TimeRate) -> Self {
        self.time_rate = rate;
        self
    }

    pub fn with_retries(mut self, retries: i32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_on_fail(mut self, enabled: bool) -> Self {
        self.retry_on_fail = enabled;
        self
    }

    pub fn with_seconds_between_retries(mut self, seconds: u64) -> Self {
        self.seconds_between_retries = seconds;
        self
    }

    pub fn with_infinite(mut self, infinite: bool) -> Self {
        self.infinite = infinite;
        self
    }

    pub fn with_max_duration_secs(mut self, seconds: u64) -> Self {
        self.max_duration_secs = seconds;
        self
    }

    pub fn with_sink(mut self, sink: SinkKind) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_fault_rates(mut self, reject_rate: f64, error_rate: f64) -> Self {
        self.reject_rate = reject_rate;
        self.error_rate = error_rate;
        self
    }

    pub fn with_monitor(mut self, monitor: bool) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Checks every option against its allowed range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.distance_from_center_km) {
            return Err(ConfigError::DistanceFromCenter(self.distance_from_center_km));
        }
        if !(1..=100).contains(&self.max_path_distance_km) {
            return Err(ConfigError::MaxPathDistance(self.max_path_distance_km));
        }
        if !(1..=10).contains(&self.paths) {
            return Err(ConfigError::Paths(self.paths));
        }
        if !(1..=3000).contains(&self.drivers_per_path) {
            return Err(ConfigError::DriversPerPath(self.drivers_per_path));
        }
        if !(-1..=5).contains(&self.retries) {
            return Err(ConfigError::Retries(self.retries));
        }
        if !(1..=60).contains(&self.seconds_between_retries) {
            return Err(ConfigError::SecondsBetweenRetries(self.seconds_between_retries));
        }
        if self.status_interval_secs == 0 {
            return Err(ConfigError::StatusInterval);
        }
        if self.pool_size == 0 {
            return Err(ConfigError::PoolSize);
        }
        if self.max_duration_secs == 0 {
            return Err(ConfigError::MaxDuration);
        }
        let rate_ok = |r: f64| (0.0..=1.0).contains(&r);
        if !rate_ok(self.reject_rate) || !rate_ok(self.error_rate) {
            return Err(ConfigError::FaultRate);
        }
        if let Some(email) = &self.notify_email {
            if !is_valid_email(email) {
                return Err(ConfigError::InvalidEmail(email.clone()));
            }
        }
        Ok(())
    }

    /// Retry budget stamped on new events.
    pub fn retry_budget(&self) -> RetryBudget {
        RetryBudget::new(self.retries)
    }

    /// Drivers per path after applying the fleet-wide cap.
    pub fn effective_drivers_per_path(&self, paths: usize) -> usize {
        self.drivers_per_path.min(MAX_AGENTS / paths.max(1))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }
}

fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !email.chars().any(char::is_whitespace)
        && domain.split('.').count() >= 2
        && domain.split('.').all(|label| !label.is_empty())
}

/// Parses a `yyyy-MM-dd_HH.mm.ss` local time.
pub fn parse_schedule(input: &str) -> Result<DateTime<Local>, ConfigError> {
    let naive = NaiveDateTime::parse_from_str(input, SCHEDULE_FORMAT)
        .map_err(|_| ConfigError::InvalidScheduleFormat(input.to_string()))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| ConfigError::InvalidScheduleFormat(input.to_string()))
}
