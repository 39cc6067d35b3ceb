//! Simulated driver - one agent's per-second tick.
//!
//! Glues the motion model to the publisher. Nothing here is shared: the
//! orchestrator owns each driver inside its periodic task, so a tick is never
//! re-entered.
//!
//! # Tick order
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ 1. motion step           (advance, stress, sample)           │
//! │ 2. location cadence      (10 s since last, moved) | or retry  │
//! │ 3. summary cadence       (every 500 m)         | or retry     │
//! │ 4. arrival               final section flush, close           │
//! │ 5. end of tick           clocks += 1 s                        │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use crate::motion::{MotionModel, StepOutcome};
use crate::publisher::{AgentMonitoring, Publisher};
use crate::telemetry::{location_event, section_event};
use chrono::{DateTime, Utc};
use fleet_env::{EventKind, SinkError, SourceId};
use tracing::{debug, info};

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStatus {
    /// Still travelling
    Running,

    /// Reached the destination; the sink is closed
    Finished,
}

/// Per-driver settings.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Human-readable name (for logging)
    pub label: String,

    /// Restart on the reversed path instead of finishing
    pub infinite: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            label: "driver".to_string(),
            infinite: false,
        }
    }
}

/// A single simulated driver.
pub struct SimulatedDriver {
    id: SourceId,
    config: DriverConfig,
    motion: MotionModel,
    publisher: Publisher,
    ticks: u64,
    finished: bool,
}

impl SimulatedDriver {
    pub fn new(id: SourceId, config: DriverConfig, motion: MotionModel, publisher: Publisher) -> Self {
        Self {
            id,
            config,
            motion,
            publisher,
            ticks: 0,
            finished: false,
        }
    }

    pub fn id(&self) -> &SourceId {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.config.label
    }

    pub fn motion(&self) -> &MotionModel {
        &self.motion
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn publisher_mut(&mut self) -> &mut Publisher {
        &mut self.publisher
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Ticks run so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    fn now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.motion.current_time_ms()).unwrap_or_else(Utc::now)
    }

    /// Runs one simulated second.
    ///
    /// Errors only come from serializing an event body; the driver is left
    /// in a consistent state and may be ticked again or aborted.
    pub async fn tick(&mut self) -> Result<TickStatus, SinkError> {
        if self.finished {
            return Ok(TickStatus::Finished);
        }

        let step = self.motion.step();
        if step == StepOutcome::Finished {
            self.finish().await?;
            return Ok(TickStatus::Finished);
        }

        self.location_cadence().await?;
        self.summary_cadence().await?;

        if let StepOutcome::Reversed(_) = step {
            debug!(driver = %self.config.label, laps = self.motion.state().laps, "Path reversed");
        }
        if let StepOutcome::Arrived(_) = step {
            self.finish().await?;
            return Ok(TickStatus::Finished);
        }

        self.motion.end_tick();
        self.publisher.end_tick();
        self.ticks += 1;
        Ok(TickStatus::Running)
    }

    /// Sends the location once it changed and the cadence is due; any
    /// other tick may sweep pending locations instead.
    async fn location_cadence(&mut self) -> Result<(), SinkError> {
        if self.motion.state().location_changed && self.publisher.location_due() {
            let event = location_event(
                &self.id,
                self.motion.current_point(),
                self.now(),
                self.publisher.policy().budget,
            )?;
            if self.publisher.send(event).await.is_ok() {
                self.motion.clear_location_changed();
            }
            self.publisher.reset_location_clock();
        } else if self.publisher.retry_due(EventKind::VehicleLocation) {
            self.publisher.sweep(EventKind::VehicleLocation).await;
        }
        Ok(())
    }

    async fn summary_cadence(&mut self) -> Result<(), SinkError> {
        if self.motion.section_due() {
            self.send_section().await?;
        } else if self.publisher.retry_due(EventKind::DataSection) {
            self.publisher.sweep(EventKind::DataSection).await;
        }
        Ok(())
    }

    async fn send_section(&mut self) -> Result<(), SinkError> {
        let at = self.now();
        if let Some(section) = self.motion.take_section() {
            let event = section_event(&self.id, &section, at, self.publisher.policy().budget)?;
            self.publisher.send(event).await;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), SinkError> {
        self.finished = true;
        let flushed = if self.motion.has_samples() {
            self.send_section().await
        } else {
            Ok(())
        };
        let pending = self.publisher.pending_count();
        self.publisher.close().await;
        info!(
            driver = %self.config.label,
            source = %self.id,
            seconds = self.motion.state().total_secs,
            pending,
            "Driver finished"
        );
        flushed
    }

    /// Stops the driver without a final section flush.
    pub async fn abort(&mut self) {
        if !self.finished {
            self.finished = true;
            debug!(driver = %self.config.label, pending = self.publisher.pending_count(), "Driver aborted");
        }
        self.publisher.close().await;
    }

    /// Hands over the monitoring records collected so far.
    pub fn take_monitoring(&mut self) -> Option<AgentMonitoring> {
        self.publisher.take_monitoring()
    }
}
