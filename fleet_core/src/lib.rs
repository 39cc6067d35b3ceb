//! Fleet Core - simulated drivers that turn a route into telemetry.
//!
//! This library covers everything that happens inside one agent:
//! 1. **Path preprocessing**: provider geometry to a dense, time-annotated path
//! 2. **Motion & stress**: per-second position, R-R interval and heart rate
//! 3. **Reliable publishing**: two event kinds, bounded retries, shared counters
//!
//! Orchestrating thousands of drivers lives in `fleet_sim`.

pub mod counters;
pub mod driver;
pub mod geo;
pub mod motion;
pub mod path;
pub mod publisher;
pub mod route;
pub mod section;
pub mod stress;
pub mod telemetry;

// Re-export key types for convenience
pub use counters::{CounterSnapshot, FleetCounters};
pub use driver::{DriverConfig, SimulatedDriver, TickStatus};
pub use geo::GeoPoint;
pub use motion::{AgentState, MotionModel, StepOutcome};
pub use path::{AgentPath, PathError, PathPoint, INTERPOLATION_RESOLUTION_M, MIN_SPEED_KMH};
pub use publisher::{AgentMonitoring, AgentStatusRecord, EventRecord, Publisher, RetryPolicy};
pub use route::{RouteGeometry, RouteLeg, SpeedWaypoint};
pub use section::{DataSection, RoadSection, SeriesStats};
pub use stress::{DriverProfile, StressState};
