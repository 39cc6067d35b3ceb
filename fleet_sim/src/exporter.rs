//! Monitoring export.
//!
//! Writes one directory per run:
//! - `status.csv`: fleet status samples
//! - `agents.csv`: per-agent delivery attempts (monitoring mode only)
//! - `events.csv`: generated events (monitoring mode only)
//! - `summary.json`: the end-of-run summary

use crate::orchestrator::{Fleet, RunSummary, StatusSnapshot};
use csv::Writer;
use fleet_core::{AgentStatusRecord, EventRecord};
use fleet_env::FleetContext;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything a run leaves behind for offline inspection.
#[derive(Debug, Clone, Default)]
pub struct MonitoringExport {
    pub statuses: Vec<StatusSnapshot>,
    pub agents: Vec<AgentStatusRecord>,
    pub events: Vec<EventRecord>,
    pub summary: Option<RunSummary>,
}

impl MonitoringExport {
    /// Collects the records of the fleet's last run.
    pub fn collect<Ctx: FleetContext>(fleet: &Fleet<Ctx>) -> Self {
        Self {
            statuses: fleet.status_history(),
            agents: fleet.agent_records(),
            events: fleet.event_records(),
            summary: fleet.summaries().pop(),
        }
    }

    /// Writes the export into `dir`, creating it if missing.
    pub fn write_to(&self, dir: &Path) -> Result<Vec<PathBuf>, ExportError> {
        std::fs::create_dir_all(dir)?;
        let mut written = Vec::with_capacity(4);

        let path = dir.join("status.csv");
        let mut status = Writer::from_path(&path)?;
        status.write_record([
            "timestamp",
            "generated",
            "sent",
            "ok",
            "not_ok",
            "errors",
            "recovered",
            "pending",
            "discarded",
            "finally_pending",
            "remaining_agents",
            "max_delay_ms",
            "current_delay_ms",
        ])?;
        for row in &self.statuses {
            status.write_record(&[
                row.timestamp.to_rfc3339(),
                row.generated.to_string(),
                row.sent.to_string(),
                row.ok.to_string(),
                row.not_ok.to_string(),
                row.errors.to_string(),
                row.recovered.to_string(),
                row.pending.to_string(),
                row.discarded.to_string(),
                row.finally_pending.to_string(),
                row.remaining_agents.to_string(),
                row.max_delay_ms.to_string(),
                row.current_delay_ms.to_string(),
            ])?;
        }
        status.flush()?;
        written.push(path);

        let path = dir.join("agents.csv");
        let mut agents = Writer::from_path(&path)?;
        agents.write_record(["id", "timestamp", "delay_ms", "payload_bytes"])?;
        for row in &self.agents {
            agents.write_record(&[
                row.id.as_str().to_string(),
                row.timestamp.to_rfc3339(),
                row.delay_ms.to_string(),
                row.payload_bytes.to_string(),
            ])?;
        }
        agents.flush()?;
        written.push(path);

        let path = dir.join("events.csv");
        let mut events = Writer::from_path(&path)?;
        events.write_record(["event_id", "timestamp"])?;
        for row in &self.events {
            events.write_record([row.event_id.as_str(), row.timestamp.to_rfc3339().as_str()])?;
        }
        events.flush()?;
        written.push(path);

        if let Some(summary) = &self.summary {
            let path = dir.join("summary.json");
            std::fs::write(&path, serde_json::to_string_pretty(summary)?)?;
            written.push(path);
        }

        info!(
            dir = %dir.display(),
            statuses = self.statuses.len(),
            agents = self.agents.len(),
            events = self.events.len(),
            "Monitoring export written"
        );
        Ok(written)
    }
}
