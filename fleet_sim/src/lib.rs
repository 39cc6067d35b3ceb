//! Fleet Simulator Harness
//!
//! Runs thousands of simulated drivers against a pluggable event sink.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                           Fleet                             │
//! │   state machine · sampler · watchdog · bounded worker pool  │
//! │       │                                                     │
//! │  ┌────▼─────┐   ┌──────────┐          ┌──────────┐          │
//! │  │ Driver 1 │   │ Driver 2 │   ...    │ Driver N │          │
//! │  └────┬─────┘   └────┬─────┘          └────┬─────┘          │
//! │       │ EventSink    │                     │                │
//! └───────┼──────────────┼─────────────────────┼────────────────┘
//!         ▼              ▼                     ▼
//!    sim broker  |  append log  |  HTTP endpoint
//! ```
//!
//! Paths come from a [`RouteSource`] (synthetic or recorded files), are
//! preprocessed by `fleet_core`, and are shared by the drivers assigned to
//! them.
//!
//! # Usage
//!
//! ```ignore
//! use fleet_sim::{Fleet, FleetConfig, SyntheticRouteSource};
//! use fleet_env::TokioContext;
//!
//! let fleet = Fleet::new(TokioContext::shared(), FleetConfig::default().with_paths(3));
//! let paths = fleet.prepare_paths(&SyntheticRouteSource::new(42)).await?;
//! fleet.start(paths)?;
//! let summary = fleet.wait().await;
//! ```

pub mod config;
mod context;
pub mod exporter;
pub mod orchestrator;
pub mod routes;
pub mod sinks;

pub use config::{ConfigError, FleetConfig, PathSourceKind, SinkKind, StartingMode, TimeRate};
pub use context::{derive_rng, SimContext};
pub use exporter::{ExportError, MonitoringExport};
pub use orchestrator::{Fleet, FleetError, FleetState, RunSummary, StatusSnapshot, StopReason};
pub use routes::{
    generate_paths, relate_paths_and_drivers, AgentAssignment, FileRouteSource, RouteError, RouteSource,
    SyntheticRouteSource,
};
pub use sinks::{HttpSinkFactory, LogBroker, SinkBuilder, SinkFaultController};
