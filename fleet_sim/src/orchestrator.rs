//! Fleet orchestrator - lifecycle, scheduling and teardown of every driver.
//!
//! # State machine
//!
//! ```text
//!            schedule              timer fires
//!   READY ─────────────► SCHEDULED ────────────┐
//!     ▲  ◄─────────────      │                 │
//!     │   cancel_schedule    │ start           ▼
//!     │                      └──────────► SIMULATING ──► ENDED        (all agents done)
//!     │ reset                              │  ▲    └──► INTERRUPTED  (stop | watchdog | launch failure)
//!     └────────────────────────────────────┘  └──── start (from a terminal state)
//! ```
//!
//! # Tasks of one run
//!
//! | Task       | Period            | Ends the run when                  |
//! |------------|-------------------|------------------------------------|
//! | agent (×N) | time rate         | never (deregisters itself)         |
//! | sampler    | status interval   | the registry is empty (ENDED)      |
//! | watchdog   | 5 s               | max duration + 60 s (INTERRUPTED)  |
//! | reaper     | once, at teardown | publishes the [`RunSummary`]       |
//!
//! Every transition goes through `watch::Sender::send_if_modified`, so the
//! sampler, the watchdog and a user stop racing each other produce exactly
//! one teardown.

use crate::config::FleetConfig;
use crate::context::derive_rng;
use crate::routes::{generate_paths, relate_paths_and_drivers, RouteError, RouteSource};
use crate::sinks::SinkBuilder;
use chrono::{DateTime, Utc};
use fleet_core::{
    AgentPath, AgentStatusRecord, CounterSnapshot, DriverConfig, EventRecord, FleetCounters, MotionModel,
    Publisher, RetryPolicy, SimulatedDriver, TickStatus,
};
use fleet_env::{FleetContext, SinkError, SinkFactory, SourceId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// How often the watchdog checks the run's age.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

/// Slack the watchdog grants beyond the max simulation duration.
pub const WATCHDOG_MARGIN: Duration = Duration::from_secs(60);

/// Time agents get to release their sinks at teardown.
pub const TEARDOWN_GRACE: Duration = Duration::from_secs(10);

/// Base launch delay of every agent (ms); agent `i` adds `i` ms.
pub const LAUNCH_BASE_DELAY_MS: u64 = 100;

const PATHS_STREAM: u64 = 0x5041_5448;
const ASSIGN_STREAM: u64 = 0x4153_5347;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// States, reasons, errors
// ============================================================================

/// Lifecycle of the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetState {
    #[default]
    Ready,
    Scheduled,
    Simulating,
    Ended,
    Interrupted,
}

impl FleetState {
    pub fn all() -> Vec<FleetState> {
        vec![
            FleetState::Ready,
            FleetState::Scheduled,
            FleetState::Simulating,
            FleetState::Ended,
            FleetState::Interrupted,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            FleetState::Ready => "ready",
            FleetState::Scheduled => "scheduled",
            FleetState::Simulating => "simulating",
            FleetState::Ended => "ended",
            FleetState::Interrupted => "interrupted",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            FleetState::Ready => "Ready to simulate",
            FleetState::Scheduled => "Waiting for the scheduled start",
            FleetState::Simulating => "Drivers are running",
            FleetState::Ended => "Every driver finished",
            FleetState::Interrupted => "The run was cut short",
        }
    }

    /// ENDED or INTERRUPTED.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FleetState::Ended | FleetState::Interrupted)
    }
}

impl std::fmt::Display for FleetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Why a run was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    UserRequested,
    Watchdog,
    LaunchFailure,
}

impl StopReason {
    pub fn name(&self) -> &'static str {
        match self {
            StopReason::UserRequested => "user_requested",
            StopReason::Watchdog => "watchdog",
            StopReason::LaunchFailure => "launch_failure",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Errors surfaced by fleet operations.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Cannot {action} while {from}")]
    InvalidTransition { from: FleetState, action: &'static str },

    #[error("No paths to simulate")]
    NoPaths,

    #[error("Scheduled start {0} is in the past")]
    ScheduleInPast(DateTime<Utc>),

    #[error("Launch failed: {0}")]
    Launch(#[from] SinkError),

    #[error("Path generation failed: {0}")]
    Route(#[from] RouteError),
}

// ============================================================================
// Monitoring records
// ============================================================================

/// One sample of the fleet status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub timestamp: DateTime<Utc>,
    pub generated: u64,
    pub sent: u64,
    pub ok: u64,
    pub not_ok: u64,
    pub errors: u64,
    pub recovered: u64,
    pub pending: u64,
    pub discarded: u64,
    pub finally_pending: u64,
    pub remaining_agents: usize,
    pub max_delay_ms: u64,
    pub current_delay_ms: u64,
}

impl StatusSnapshot {
    /// Reads the counters and swaps the current-delay watermark back to 0.
    pub fn capture(timestamp: DateTime<Utc>, counters: &FleetCounters, remaining_agents: usize) -> Self {
        let current_delay_ms = counters.take_current_delay();
        let c = counters.snapshot();
        Self {
            timestamp,
            generated: c.generated,
            sent: c.sent,
            ok: c.ok,
            not_ok: c.not_ok,
            errors: c.errors,
            recovered: c.recovered,
            pending: c.pending,
            discarded: c.discarded,
            finally_pending: c.finally_pending,
            remaining_agents,
            max_delay_ms: c.max_delay_ms,
            current_delay_ms,
        }
    }
}

/// End-of-run report, published once per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub outcome: FleetState,
    pub reason: Option<StopReason>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub agents: usize,
    pub remaining_agents: usize,
    pub counters: CounterSnapshot,
}

impl RunSummary {
    /// Detailed breakdown for interrupted or lossy runs, one line otherwise.
    pub fn log(&self, recipient: Option<&str>) {
        let c = &self.counters;
        if self.outcome == FleetState::Interrupted || c.has_failures() {
            info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            match self.reason {
                Some(reason) => warn!("Simulation {} ({})", self.outcome, reason),
                None => info!("Simulation {}", self.outcome),
            }
            info!("  Elapsed:         {:.1} s", self.elapsed_secs);
            info!("  Agents:          {} ({} still running)", self.agents, self.remaining_agents);
            info!("  Generated:       {}", c.generated);
            info!("  Sent:            {}", c.sent);
            info!("  OK:              {}", c.ok);
            info!("  Not OK:          {}", c.not_ok);
            info!("  Errors:          {}", c.errors);
            info!("  Recovered:       {}", c.recovered);
            info!("  Discarded:       {}", c.discarded);
            info!("  Finally pending: {}", c.finally_pending);
            info!("  Max delay:       {} ms", c.max_delay_ms);
            info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        } else {
            info!(
                outcome = %self.outcome,
                agents = self.agents,
                generated = c.generated,
                ok = c.ok,
                elapsed_secs = self.elapsed_secs,
                "Simulation summary"
            );
        }
        if let Some(recipient) = recipient {
            info!(recipient, "Summary addressed to notification recipient");
        }
    }
}

// ============================================================================
// Shared state
// ============================================================================

struct RunHandle {
    id: u64,
    cancel: CancellationToken,
    agents: JoinSet<()>,
    started: Duration,
    started_at: DateTime<Utc>,
    total_agents: usize,
}

struct Shared<Ctx: FleetContext> {
    ctx: Arc<Ctx>,
    config: FleetConfig,
    counters: Arc<FleetCounters>,
    state: watch::Sender<FleetState>,
    summary: watch::Sender<Option<RunSummary>>,
    factory: Mutex<Option<Arc<dyn SinkFactory>>>,
    run_id: AtomicU64,
    run: Mutex<Option<RunHandle>>,
    schedule: Mutex<Option<CancellationToken>>,
    /// Agents still running in the current run, by source id
    registry: Mutex<HashMap<SourceId, String>>,
    history: Mutex<Vec<StatusSnapshot>>,
    agent_records: Mutex<Vec<AgentStatusRecord>>,
    event_records: Mutex<Vec<EventRecord>>,
    summaries: Mutex<Vec<RunSummary>>,
}

impl<Ctx: FleetContext> Shared<Ctx> {
    fn wall_clock(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.ctx.system_time())
    }

    fn remaining_agents(&self) -> usize {
        lock(&self.registry).len()
    }

    fn sample(&self) -> usize {
        let remaining = self.remaining_agents();
        let snapshot = StatusSnapshot::capture(self.wall_clock(), &self.counters, remaining);
        debug!(
            generated = snapshot.generated,
            ok = snapshot.ok,
            pending = snapshot.pending,
            remaining,
            "Fleet status"
        );
        lock(&self.history).push(snapshot);
        remaining
    }

    /// Moves SIMULATING to a terminal state and starts the teardown.
    ///
    /// Returns false when the fleet was not simulating (someone else won).
    fn finish(self: &Arc<Self>, outcome: FleetState, reason: Option<StopReason>) -> bool {
        let won = self.state.send_if_modified(|state| {
            if *state == FleetState::Simulating {
                *state = outcome;
                true
            } else {
                false
            }
        });
        if !won {
            return false;
        }

        let Some(run) = lock(&self.run).take() else {
            return true;
        };
        run.cancel.cancel();
        let remaining = self.remaining_agents();
        match reason {
            Some(reason) => warn!(%outcome, %reason, remaining, "Simulation interrupted"),
            None => info!(%outcome, "Simulation ended"),
        }

        let shared = Arc::clone(self);
        self.ctx
            .spawn("reaper", async move { shared.reap(run, outcome, reason, remaining).await });
        true
    }

    async fn reap(self: Arc<Self>, mut run: RunHandle, outcome: FleetState, reason: Option<StopReason>, remaining: usize) {
        let drained = time::timeout(TEARDOWN_GRACE, async {
            while run.agents.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(left = run.agents.len(), "Agents did not release their sinks in time, aborting them");
            run.agents.abort_all();
        }

        let current = self.run_id.load(Ordering::SeqCst) == run.id;
        if current {
            lock(&self.registry).clear();
        }

        let summary = RunSummary {
            outcome,
            reason,
            started_at: run.started_at,
            ended_at: self.wall_clock(),
            elapsed_secs: self.ctx.now().saturating_sub(run.started).as_secs_f64(),
            agents: run.total_agents,
            remaining_agents: remaining,
            counters: self.counters.snapshot(),
        };
        summary.log(self.config.notify_email.as_deref());

        lock(&self.summaries).push(summary.clone());
        if current {
            self.summary.send_replace(Some(summary));
        }
    }

    fn release_agent(&self, driver: &mut SimulatedDriver, completed: bool) {
        if let Some(monitoring) = driver.take_monitoring() {
            lock(&self.agent_records).extend(monitoring.statuses);
            lock(&self.event_records).extend(monitoring.events);
        }
        debug!(
            driver = driver.label(),
            ticks = driver.ticks(),
            max_delay_ms = driver.publisher().max_delay_ms(),
            completed,
            "Agent released"
        );
        if completed {
            lock(&self.registry).remove(driver.id());
        }
    }
}

// ============================================================================
// Fleet
// ============================================================================

/// Per-agent launch parameters.
struct Launch {
    delay: Duration,
    period: Duration,
    run_started: Duration,
    pool: Arc<Semaphore>,
    cancel: CancellationToken,
}

/// Handle to the fleet. Clones share the same fleet.
pub struct Fleet<Ctx: FleetContext> {
    shared: Arc<Shared<Ctx>>,
}

impl<Ctx: FleetContext> Clone for Fleet<Ctx> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<Ctx: FleetContext> Fleet<Ctx> {
    pub fn new(ctx: Arc<Ctx>, config: FleetConfig) -> Self {
        let (state, _) = watch::channel(FleetState::Ready);
        let (summary, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                ctx,
                config,
                counters: Arc::new(FleetCounters::new()),
                state,
                summary,
                factory: Mutex::new(None),
                run_id: AtomicU64::new(0),
                run: Mutex::new(None),
                schedule: Mutex::new(None),
                registry: Mutex::new(HashMap::new()),
                history: Mutex::new(Vec::new()),
                agent_records: Mutex::new(Vec::new()),
                event_records: Mutex::new(Vec::new()),
                summaries: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Uses `factory` for every run instead of opening the configured backend.
    pub fn with_factory(self, factory: Arc<dyn SinkFactory>) -> Self {
        *lock(&self.shared.factory) = Some(factory);
        self
    }

    pub fn config(&self) -> &FleetConfig {
        &self.shared.config
    }

    pub fn state(&self) -> FleetState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<FleetState> {
        self.shared.state.subscribe()
    }

    pub fn counters(&self) -> Arc<FleetCounters> {
        Arc::clone(&self.shared.counters)
    }

    pub fn status_history(&self) -> Vec<StatusSnapshot> {
        lock(&self.shared.history).clone()
    }

    pub fn agent_records(&self) -> Vec<AgentStatusRecord> {
        lock(&self.shared.agent_records).clone()
    }

    pub fn event_records(&self) -> Vec<EventRecord> {
        lock(&self.shared.event_records).clone()
    }

    /// Summaries of every finished run, oldest first.
    pub fn summaries(&self) -> Vec<RunSummary> {
        lock(&self.shared.summaries).clone()
    }

    /// Agents of the current run that have not finished yet.
    pub fn remaining_agents(&self) -> usize {
        self.shared.remaining_agents()
    }

    /// Generates the configured number of paths from `source`.
    pub async fn prepare_paths(&self, source: &dyn RouteSource) -> Result<Vec<Arc<AgentPath>>, FleetError> {
        let mut rng = derive_rng(self.shared.ctx.seed(), PATHS_STREAM);
        let paths = generate_paths(&self.shared.config, source, &mut rng).await?;
        info!(paths = paths.len(), source = source.name(), "Paths ready");
        Ok(paths)
    }

    /// Launches one driver per assignment: READY/SCHEDULED/terminal to SIMULATING.
    pub fn start(&self, paths: Vec<Arc<AgentPath>>) -> Result<(), FleetError> {
        if paths.is_empty() {
            return Err(FleetError::NoPaths);
        }
        let shared = &self.shared;
        let config = &shared.config;

        let run_id = shared.run_id.load(Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let run_started = shared.ctx.now();
        let mut handle = Some(RunHandle {
            id: run_id,
            cancel: cancel.clone(),
            agents: JoinSet::new(),
            started: run_started,
            started_at: shared.wall_clock(),
            total_agents: 0,
        });

        let started = shared.state.send_if_modified(|state| {
            if *state == FleetState::Simulating {
                return false;
            }
            shared.run_id.store(run_id, Ordering::SeqCst);
            *lock(&shared.run) = handle.take();
            *state = FleetState::Simulating;
            true
        });
        if !started {
            return Err(FleetError::InvalidTransition {
                from: self.state(),
                action: "start",
            });
        }
        if let Some(schedule) = lock(&shared.schedule).take() {
            schedule.cancel();
        }

        shared.counters.reset();
        shared.summary.send_replace(None);
        lock(&shared.registry).clear();
        lock(&shared.history).clear();
        lock(&shared.agent_records).clear();
        lock(&shared.event_records).clear();

        let override_factory = lock(&shared.factory).clone();
        let factory: Arc<dyn SinkFactory> = match override_factory {
            Some(factory) => factory,
            None => match SinkBuilder::open(config) {
                Ok(builder) => Arc::new(builder),
                Err(err) => {
                    error!(error = %err, sink = %config.sink, "Cannot open the sink backend");
                    shared.finish(FleetState::Interrupted, Some(StopReason::LaunchFailure));
                    return Err(FleetError::Launch(err));
                }
            },
        };

        let mut rng = derive_rng(shared.ctx.seed(), ASSIGN_STREAM ^ run_id);
        let assignments = relate_paths_and_drivers(&paths, config, &mut rng);
        let total = assignments.len();
        let pool = Arc::new(Semaphore::new(config.pool_size.max(1)));
        let policy = RetryPolicy::default()
            .with_retry_on_fail(config.retry_on_fail)
            .with_seconds_between_retries(config.seconds_between_retries)
            .with_budget(config.retry_budget());

        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        info!(
            run = run_id,
            agents = total,
            paths = paths.len(),
            mode = %config.starting_mode,
            rate = %config.time_rate,
            sink = %config.sink,
            "Simulation starting"
        );

        for assignment in assignments {
            let stagger = config.starting_mode.stagger_ms(assignment.index, total, rng.gen());
            let delay_ms = LAUNCH_BASE_DELAY_MS + assignment.index as u64 + stagger;
            let epoch_ms = shared.ctx.epoch_millis() + delay_ms as i64;
            let id = SourceId::derive(epoch_ms, &assignment.label);

            let sink = match factory.create(&id) {
                Ok(sink) => sink,
                Err(err) => {
                    error!(driver = %assignment.label, error = %err, "Cannot create driver sink");
                    shared.finish(FleetState::Interrupted, Some(StopReason::LaunchFailure));
                    return Err(FleetError::Launch(err));
                }
            };

            let motion = MotionModel::new(assignment.path, assignment.profile, config.infinite, epoch_ms);
            let clock: Arc<dyn fleet_env::Clock> = shared.ctx.clone();
            let publisher = Publisher::new(id.clone(), sink, Arc::clone(&shared.counters), policy, clock)
                .with_monitoring(config.monitor);
            let driver = SimulatedDriver::new(
                id.clone(),
                DriverConfig {
                    label: assignment.label.clone(),
                    infinite: config.infinite,
                },
                motion,
                publisher,
            );
            let launch = Launch {
                delay: Duration::from_millis(delay_ms),
                period: config.time_rate.period(),
                run_started,
                pool: Arc::clone(&pool),
                cancel: cancel.clone(),
            };

            let mut guard = lock(&shared.run);
            let Some(run) = guard.as_mut().filter(|run| run.id == run_id) else {
                // Torn down while launching
                return Ok(());
            };
            lock(&shared.registry).insert(id, assignment.label.clone());
            let span = tracing::info_span!("agent", label = %assignment.label);
            run.agents.spawn(drive(Arc::clone(shared), driver, launch).instrument(span));
            run.total_agents += 1;
        }

        let sampler = Arc::clone(shared);
        let token = cancel.clone();
        shared.ctx.spawn("status_sampler", async move { run_sampler(sampler, token).await });

        let watchdog = Arc::clone(shared);
        shared
            .ctx
            .spawn("watchdog", async move { run_watchdog(watchdog, cancel, run_started).await });

        Ok(())
    }

    /// Arms a one-shot start at `at`: READY to SCHEDULED.
    pub fn schedule(&self, at: DateTime<Utc>, paths: Vec<Arc<AgentPath>>) -> Result<(), FleetError> {
        if paths.is_empty() {
            return Err(FleetError::NoPaths);
        }
        let delay = (at - self.shared.wall_clock())
            .to_std()
            .map_err(|_| FleetError::ScheduleInPast(at))?;

        let token = CancellationToken::new();
        let mut slot = Some(token.clone());
        let scheduled = self.shared.state.send_if_modified(|state| {
            if *state != FleetState::Ready {
                return false;
            }
            *lock(&self.shared.schedule) = slot.take();
            *state = FleetState::Scheduled;
            true
        });
        if !scheduled {
            return Err(FleetError::InvalidTransition {
                from: self.state(),
                action: "schedule",
            });
        }
        info!(at = %at, in_secs = delay.as_secs(), "Simulation scheduled");

        let fleet = self.clone();
        self.shared.ctx.spawn("schedule", async move {
            tokio::select! {
                _ = token.cancelled() => debug!("Scheduled start cancelled"),
                _ = time::sleep(delay) => {
                    if let Err(err) = fleet.start(paths) {
                        error!(error = %err, "Scheduled start failed");
                    }
                }
            }
        });
        Ok(())
    }

    /// SCHEDULED back to READY.
    pub fn cancel_schedule(&self) -> Result<(), FleetError> {
        let cancelled = self.shared.state.send_if_modified(|state| {
            if *state != FleetState::Scheduled {
                return false;
            }
            *state = FleetState::Ready;
            true
        });
        if !cancelled {
            return Err(FleetError::InvalidTransition {
                from: self.state(),
                action: "cancel the schedule",
            });
        }
        if let Some(token) = lock(&self.shared.schedule).take() {
            token.cancel();
        }
        info!("Scheduled simulation cancelled");
        Ok(())
    }

    /// User interrupt. Returns false when no run was active.
    pub fn stop(&self) -> bool {
        let stopped = self
            .shared
            .finish(FleetState::Interrupted, Some(StopReason::UserRequested));
        if !stopped {
            debug!(state = %self.state(), "Stop ignored");
        }
        stopped
    }

    /// Resolves to the summary of the current (or last) run.
    ///
    /// Returns `None` right away when no run exists.
    pub async fn wait(&self) -> Option<RunSummary> {
        let mut summary = self.shared.summary.subscribe();
        if self.state() == FleetState::Ready && summary.borrow().is_none() {
            return None;
        }
        let result = summary.wait_for(Option::is_some).await;
        result.ok().and_then(|summary| summary.clone())
    }

    /// Terminal state back to READY.
    pub fn reset(&self) -> Result<(), FleetError> {
        let reset = self.shared.state.send_if_modified(|state| {
            if !state.is_terminal() {
                return false;
            }
            *state = FleetState::Ready;
            true
        });
        if !reset {
            return Err(FleetError::InvalidTransition {
                from: self.state(),
                action: "reset",
            });
        }
        self.shared.summary.send_replace(None);
        debug!("Fleet reset");
        Ok(())
    }
}

// ============================================================================
// Background tasks
// ============================================================================

/// Periodic task of one agent.
async fn drive<Ctx: FleetContext>(shared: Arc<Shared<Ctx>>, mut driver: SimulatedDriver, launch: Launch) {
    let mut interval = time::interval_at(Instant::now() + launch.delay, launch.period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let cancel = launch.cancel;
    let max_duration = shared.config.max_duration();
    debug!(driver = driver.label(), delay_ms = launch.delay.as_millis() as u64, "Agent scheduled");

    let completed = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break false,
            _ = interval.tick() => {}
        }

        if shared.ctx.now().saturating_sub(launch.run_started) >= max_duration {
            info!(driver = driver.label(), "Max simulation duration reached");
            driver.abort().await;
            break true;
        }

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break false,
            permit = Arc::clone(&launch.pool).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break false,
            },
        };

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => break false,
            status = driver.tick() => status,
        };
        match status {
            Ok(TickStatus::Running) => {}
            Ok(TickStatus::Finished) => break true,
            Err(err) => {
                warn!(driver = driver.label(), error = %err, "Tick failed, stopping driver");
                driver.abort().await;
                break true;
            }
        }
    };

    if !completed {
        driver.abort().await;
    }
    shared.release_agent(&mut driver, completed);
}

/// Samples the fleet status and ends the run once every agent is done.
async fn run_sampler<Ctx: FleetContext>(shared: Arc<Shared<Ctx>>, cancel: CancellationToken) {
    let period = shared.config.status_interval();
    let mut interval = time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if shared.sample() == 0 {
            shared.finish(FleetState::Ended, None);
            break;
        }
    }
}

/// Interrupts a run that outlives its budget.
async fn run_watchdog<Ctx: FleetContext>(shared: Arc<Shared<Ctx>>, cancel: CancellationToken, run_started: Duration) {
    let limit = shared.config.max_duration() + WATCHDOG_MARGIN;
    let mut interval = time::interval_at(Instant::now() + WATCHDOG_INTERVAL, WATCHDOG_INTERVAL);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let elapsed = shared.ctx.now().saturating_sub(run_started);
        if elapsed >= limit {
            warn!(
                elapsed_secs = elapsed.as_secs(),
                limit_secs = limit.as_secs(),
                remaining = shared.remaining_agents(),
                "Watchdog fired"
            );
            shared.finish(FleetState::Interrupted, Some(StopReason::Watchdog));
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SinkKind;
    use crate::context::SimContext;
    use crate::sinks::SinkFaultController;
    use fleet_core::{GeoPoint, PathPoint};
    use fleet_env::TokioContext;

    const METERS_PER_DEGREE: f64 = 111_194.93;

    /// A → B → C, 100 m apart, 10 s per hop.
    fn three_point_path() -> Arc<AgentPath> {
        let a = GeoPoint::new(37.0, -6.0);
        let b = GeoPoint::new(37.0 + 100.0 / METERS_PER_DEGREE, -6.0);
        let c = GeoPoint::new(37.0 + 200.0 / METERS_PER_DEGREE, -6.0);
        Arc::new(
            AgentPath::new(vec![
                PathPoint::resting(a, 36.0, 0),
                PathPoint::resting(b, 36.0, 10),
                PathPoint::resting(c, 36.0, 20),
            ])
            .unwrap(),
        )
    }

    fn config() -> FleetConfig {
        let mut config = FleetConfig::default();
        config.randomize_behaviour = false;
        config
    }

    async fn wait_summary<Ctx: FleetContext>(fleet: &Fleet<Ctx>) -> RunSummary {
        time::timeout(Duration::from_secs(600), fleet.wait())
            .await
            .expect("summary in time")
            .expect("a run exists")
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ends_when_every_agent_finishes() {
        let fleet = Fleet::new(TokioContext::shared(), config().with_drivers_per_path(2).with_monitor(true));
        fleet.start(vec![three_point_path()]).unwrap();
        assert_eq!(fleet.state(), FleetState::Simulating);
        assert_eq!(fleet.remaining_agents(), 2);

        let summary = wait_summary(&fleet).await;
        assert_eq!(summary.outcome, FleetState::Ended);
        assert_eq!(summary.reason, None);
        assert_eq!(summary.agents, 2);
        assert_eq!(summary.remaining_agents, 0);
        assert!(summary.counters.generated > 0);
        assert_eq!(summary.counters.ok, summary.counters.generated);
        assert_eq!(fleet.state(), FleetState::Ended);

        let history = fleet.status_history();
        assert!(!history.is_empty());
        assert_eq!(history.last().unwrap().remaining_agents, 0);
        assert_eq!(fleet.event_records().len() as u64, summary.counters.generated);
        assert!(!fleet.agent_records().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_stop_tears_down_once() {
        let fleet = Fleet::new(TokioContext::shared(), config().with_infinite(true));
        let mut states = fleet.subscribe();
        fleet.start(vec![three_point_path()]).unwrap();
        time::sleep(Duration::from_secs(5)).await;

        assert!(fleet.stop());
        assert!(!fleet.stop());
        assert_eq!(fleet.state(), FleetState::Interrupted);
        assert_eq!(*states.borrow_and_update(), FleetState::Interrupted);

        let summary = wait_summary(&fleet).await;
        assert_eq!(summary.reason, Some(StopReason::UserRequested));
        assert_eq!(summary.remaining_agents, 1);

        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fleet.summaries().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_racing_stops_and_watchdog_tear_down_once() {
        let ctx = SimContext::shared(5);
        let stuck = SinkFaultController::new(7).with_latency(3_600_000.0, 0.0);
        let fleet = Fleet::new(Arc::clone(&ctx), config().with_infinite(true).with_max_duration_secs(30))
            .with_factory(Arc::new(SinkBuilder::Sim(stuck)));
        fleet.start(vec![three_point_path()]).unwrap();

        let mut states = fleet.subscribe();
        let _ = states.borrow_and_update();
        let observer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Ok(Ok(())) = time::timeout(Duration::from_secs(60), states.changed()).await {
                seen.push(*states.borrow_and_update());
            }
            seen
        });

        time::sleep(Duration::from_secs(12)).await;
        // Past the watchdog limit; its next check lands at 15 s with the stoppers
        ctx.advance_time(Duration::from_secs(91));
        let stoppers: Vec<_> = (0..8)
            .map(|_| {
                let fleet = fleet.clone();
                tokio::spawn(async move {
                    time::sleep(Duration::from_secs(3)).await;
                    fleet.stop()
                })
            })
            .collect();

        let mut stops_won = 0;
        for stopper in stoppers {
            if stopper.await.unwrap() {
                stops_won += 1;
            }
        }
        let summary = wait_summary(&fleet).await;
        let watchdog_won = summary.reason == Some(StopReason::Watchdog);
        assert_eq!(stops_won + usize::from(watchdog_won), 1);
        assert_eq!(summary.outcome, FleetState::Interrupted);

        assert_eq!(observer.await.unwrap(), vec![FleetState::Interrupted]);
        assert_eq!(fleet.summaries().len(), 1);
        assert_eq!(fleet.state(), FleetState::Interrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_interrupts_stuck_run() {
        // Every publish hangs for an hour
        let stuck = SinkFaultController::new(7).with_latency(3_600_000.0, 0.0);
        let fleet = Fleet::new(
            TokioContext::shared(),
            config().with_infinite(true).with_max_duration_secs(30),
        )
        .with_factory(Arc::new(SinkBuilder::Sim(stuck)));

        fleet.start(vec![three_point_path()]).unwrap();
        let summary = wait_summary(&fleet).await;

        assert_eq!(summary.outcome, FleetState::Interrupted);
        assert_eq!(summary.reason, Some(StopReason::Watchdog));
        assert!(summary.elapsed_secs >= 90.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_follows_context_clock() {
        let ctx = SimContext::shared(3);
        let stuck = SinkFaultController::new(7).with_latency(3_600_000.0, 0.0);
        let fleet = Fleet::new(Arc::clone(&ctx), config().with_infinite(true).with_max_duration_secs(30))
            .with_factory(Arc::new(SinkBuilder::Sim(stuck)));

        fleet.start(vec![three_point_path()]).unwrap();
        time::sleep(Duration::from_secs(12)).await;
        assert_eq!(fleet.state(), FleetState::Simulating);

        ctx.advance_time(Duration::from_secs(91));
        let summary = wait_summary(&fleet).await;
        assert_eq!(summary.reason, Some(StopReason::Watchdog));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_duration_finishes_infinite_agents() {
        let fleet = Fleet::new(
            TokioContext::shared(),
            config().with_infinite(true).with_max_duration_secs(15),
        );
        fleet.start(vec![three_point_path()]).unwrap();

        let summary = wait_summary(&fleet).await;
        assert_eq!(summary.outcome, FleetState::Ended);
        assert!(summary.elapsed_secs < 75.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_failure_interrupts() {
        let fleet = Fleet::new(TokioContext::shared(), config().with_sink(SinkKind::Http));

        let err = fleet.start(vec![three_point_path()]).unwrap_err();
        assert!(matches!(err, FleetError::Launch(SinkError::InvalidEndpoint(_))));
        assert_eq!(fleet.state(), FleetState::Interrupted);

        let summary = wait_summary(&fleet).await;
        assert_eq!(summary.reason, Some(StopReason::LaunchFailure));
        assert_eq!(summary.agents, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_and_cancel() {
        let ctx = SimContext::shared(1);
        let fleet = Fleet::new(Arc::clone(&ctx), config());
        let now = DateTime::<Utc>::from(ctx.system_time());

        assert!(matches!(
            fleet.schedule(now - chrono::Duration::seconds(1), vec![three_point_path()]),
            Err(FleetError::ScheduleInPast(_))
        ));

        fleet.schedule(now + chrono::Duration::seconds(30), vec![three_point_path()]).unwrap();
        assert_eq!(fleet.state(), FleetState::Scheduled);
        assert!(matches!(
            fleet.schedule(now + chrono::Duration::seconds(30), vec![three_point_path()]),
            Err(FleetError::InvalidTransition { from: FleetState::Scheduled, .. })
        ));

        fleet.cancel_schedule().unwrap();
        assert_eq!(fleet.state(), FleetState::Ready);
        time::sleep(Duration::from_secs(40)).await;
        assert_eq!(fleet.state(), FleetState::Ready);

        fleet.schedule(now + chrono::Duration::seconds(30), vec![three_point_path()]).unwrap();
        time::sleep(Duration::from_secs(31)).await;
        assert_eq!(fleet.state(), FleetState::Simulating);
        assert_eq!(wait_summary(&fleet).await.outcome, FleetState::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_and_rerun() {
        let fleet = Fleet::new(TokioContext::shared(), config());
        assert!(fleet.wait().await.is_none());
        assert!(matches!(fleet.reset(), Err(FleetError::InvalidTransition { .. })));
        assert!(matches!(fleet.start(Vec::new()), Err(FleetError::NoPaths)));

        fleet.start(vec![three_point_path()]).unwrap();
        assert!(matches!(
            fleet.start(vec![three_point_path()]),
            Err(FleetError::InvalidTransition { from: FleetState::Simulating, .. })
        ));
        let first = wait_summary(&fleet).await;

        fleet.reset().unwrap();
        assert_eq!(fleet.state(), FleetState::Ready);
        assert!(fleet.wait().await.is_none());

        fleet.start(vec![three_point_path()]).unwrap();
        let second = wait_summary(&fleet).await;
        assert_eq!(first.counters.generated, second.counters.generated);
        assert_eq!(fleet.summaries().len(), 2);
    }

    #[tokio::test]
    async fn test_prepare_paths_uses_route_source() {
        let fleet = Fleet::new(SimContext::shared(9), config().with_paths(2));
        let paths = fleet
            .prepare_paths(&crate::routes::SyntheticRouteSource::new(9))
            .await
            .unwrap();
        assert_eq!(paths.len(), 2);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(FleetState::all().len(), 5);
        assert!(FleetState::Ended.is_terminal());
        assert!(!FleetState::Scheduled.is_terminal());
        assert_eq!(FleetState::Simulating.to_string(), "simulating");
        assert_eq!(StopReason::Watchdog.to_string(), "watchdog");
    }
}
