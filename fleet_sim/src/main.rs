//! Fleet simulator CLI
//!
//! Generates paths, launches the fleet and reports the run summary.

use chrono::Utc;
use clap::Parser;
use fleet_core::GeoPoint;
use fleet_env::{FleetContext, TokioContext};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fleet_sim::config::{parse_schedule, ConfigError, FleetConfig, PathSourceKind, SinkKind, StartingMode, TimeRate};
use fleet_sim::{FileRouteSource, Fleet, FleetState, MonitoringExport, RouteError, RouteSource, RunSummary, SyntheticRouteSource};

const EXIT_ENDED: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_INTERRUPTED: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "fleet-sim")]
#[command(about = "Simulate a fleet of drivers publishing location and stress telemetry", long_about = None)]
struct Args {
    /// JSON configuration file (flags override its values)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of distinct paths (1-10)
    #[arg(short, long)]
    paths: Option<usize>,

    /// Drivers per path (1-3000)
    #[arg(short, long)]
    drivers: Option<usize>,

    /// Start stagger (aleatory, lineal, same_time)
    #[arg(long)]
    starting_mode: Option<StartingMode>,

    /// Simulated seconds per wall-clock second (x1, x10, x100, x1000)
    #[arg(long)]
    time_rate: Option<TimeRate>,

    /// Retry budget per event (-1 = unlimited)
    #[arg(long, allow_hyphen_values = true)]
    retries: Option<i32>,

    /// Seconds between two retry sweeps
    #[arg(long)]
    seconds_between_retries: Option<u64>,

    /// Drop failed events instead of retrying them
    #[arg(long)]
    no_retry: bool,

    /// Loop drivers over their reversed path
    #[arg(long)]
    infinite: bool,

    /// Same speed and heart-rate factors for every driver
    #[arg(long)]
    no_random: bool,

    /// Maximum simulation duration in seconds
    #[arg(long)]
    max_duration: Option<u64>,

    /// Sink backend (sim, log, http)
    #[arg(long)]
    sink: Option<SinkKind>,

    /// Endpoint of the HTTP sink
    #[arg(long)]
    url: Option<String>,

    /// Simulated broker reject probability
    #[arg(long)]
    reject_rate: Option<f64>,

    /// Simulated broker transport-error probability
    #[arg(long)]
    error_rate: Option<f64>,

    /// Directory of route files (switches to file routes)
    #[arg(long)]
    routes: Option<PathBuf>,

    #[arg(long, allow_hyphen_values = true)]
    center_lat: Option<f64>,

    #[arg(long, allow_hyphen_values = true)]
    center_lon: Option<f64>,

    /// Origins are drawn within this many km of the centre
    #[arg(long)]
    distance_from_center: Option<u32>,

    /// Destinations are drawn within this many km of the origin
    #[arg(long)]
    max_path_distance: Option<u32>,

    /// Scheduled start, local time (yyyy-MM-dd_HH.mm.ss)
    #[arg(long)]
    schedule: Option<String>,

    /// Collect per-attempt and per-event records
    #[arg(long)]
    monitor: bool,

    /// Write the monitoring export into this directory
    #[arg(long)]
    export: Option<PathBuf>,

    /// Master seed (0 = OS entropy)
    #[arg(short, long)]
    seed: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON summary on stdout
    #[arg(long)]
    json: bool,
}

fn build_config(args: &Args) -> Result<FleetConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => FleetConfig::from_file(path)?,
        None => FleetConfig::default(),
    };

    if let Some(paths) = args.paths {
        config.paths = paths;
    }
    if let Some(drivers) = args.drivers {
        config.drivers_per_path = drivers;
    }
    if let Some(mode) = args.starting_mode {
        config.starting_mode = mode;
    }
    if let Some(rate) = args.time_rate {
        config.time_rate = rate;
    }
    if let Some(retries) = args.retries {
        config.retries = retries;
    }
    if let Some(seconds) = args.seconds_between_retries {
        config.seconds_between_retries = seconds;
    }
    if args.no_retry {
        config.retry_on_fail = false;
    }
    if args.infinite {
        config.infinite = true;
    }
    if args.no_random {
        config.randomize_behaviour = false;
    }
    if let Some(seconds) = args.max_duration {
        config.max_duration_secs = seconds;
    }
    if let Some(sink) = args.sink {
        config.sink = sink;
    }
    if let Some(url) = &args.url {
        config.url = Some(url.clone());
    }
    if let Some(rate) = args.reject_rate {
        config.reject_rate = rate;
    }
    if let Some(rate) = args.error_rate {
        config.error_rate = rate;
    }
    if let Some(dir) = &args.routes {
        config.path_source = PathSourceKind::Files;
        config.routes_dir = Some(dir.clone());
    }
    if args.center_lat.is_some() || args.center_lon.is_some() {
        config.center = GeoPoint::new(
            args.center_lat.unwrap_or(config.center.lat),
            args.center_lon.unwrap_or(config.center.lon),
        );
    }
    if let Some(km) = args.distance_from_center {
        config.distance_from_center_km = km;
    }
    if let Some(km) = args.max_path_distance {
        config.max_path_distance_km = km;
    }
    if args.monitor {
        config.monitor = true;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }

    config.validate()?;
    Ok(config)
}

fn route_source(config: &FleetConfig) -> Result<Box<dyn RouteSource>, RouteError> {
    match config.path_source {
        PathSourceKind::Synthetic => Ok(Box::new(SyntheticRouteSource::new(config.seed))),
        PathSourceKind::Files => {
            let dir = config.routes_dir.clone().unwrap_or_else(|| PathBuf::from("routes"));
            Ok(Box::new(FileRouteSource::load(dir)?))
        }
    }
}

fn print_json(summary: Option<&RunSummary>, export: Option<&PathBuf>) {
    let report = serde_json::json!({
        "outcome": summary.map(|s| s.outcome.name()).unwrap_or("cancelled"),
        "reason": summary.and_then(|s| s.reason).map(|r| r.name()),
        "elapsed_secs": summary.map(|s| s.elapsed_secs),
        "agents": summary.map(|s| s.agents),
        "remaining_agents": summary.map(|s| s.remaining_agents),
        "counters": summary.map(|s| s.counters),
        "export": export.map(|p| p.display().to_string()),
    });
    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Cannot render the JSON summary: {}", e),
    }
}

async fn run(args: Args) -> i32 {
    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return EXIT_FAILURE;
        }
    };

    let schedule = match args.schedule.as_deref().map(parse_schedule).transpose() {
        Ok(at) => at.map(|at| at.with_timezone(&Utc)),
        Err(e) => {
            error!("{}", e);
            return EXIT_FAILURE;
        }
    };

    info!(
        paths = config.paths,
        drivers_per_path = config.drivers_per_path,
        mode = %config.starting_mode,
        rate = %config.time_rate,
        sink = %config.sink,
        seed = config.seed,
        "Configuration loaded"
    );

    let ctx = Arc::new(TokioContext::with_seed(config.seed));
    let fleet = Fleet::new(Arc::clone(&ctx), config.clone());

    let source = match route_source(&config) {
        Ok(source) => source,
        Err(e) => {
            error!("Cannot open the route source: {}", e);
            return EXIT_FAILURE;
        }
    };
    let paths = match fleet.prepare_paths(source.as_ref()).await {
        Ok(paths) => paths,
        Err(e) => {
            error!("{}", e);
            return EXIT_FAILURE;
        }
    };

    let launched = match schedule {
        Some(at) => fleet.schedule(at, paths),
        None => fleet.start(paths),
    };
    if let Err(e) = launched {
        error!("Cannot launch the fleet: {}", e);
        return EXIT_FAILURE;
    }

    let summary = tokio::select! {
        summary = fleet.wait() => summary,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupt received");
            if fleet.state() == FleetState::Scheduled {
                if let Err(e) = fleet.cancel_schedule() {
                    warn!("{}", e);
                }
            } else {
                fleet.stop();
            }
            fleet.wait().await
        }
    };

    if let Some(dir) = &args.export {
        let dir = dir.join(format!("run-{}", ctx.epoch_millis()));
        if let Err(e) = MonitoringExport::collect(&fleet).write_to(&dir) {
            error!("Export failed: {}", e);
        }
    }

    if args.json {
        print_json(summary.as_ref(), args.export.as_ref());
    }

    match summary.map(|s| s.outcome) {
        Some(FleetState::Ended) => EXIT_ENDED,
        _ => EXIT_INTERRUPTED,
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging (stderr, so --json output stays clean)
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr);
    let installed = match EnvFilter::try_from_default_env() {
        Ok(filter) => tracing::subscriber::set_global_default(builder.with_env_filter(filter).finish()),
        Err(_) => tracing::subscriber::set_global_default(builder.finish()),
    };
    if let Err(e) = installed {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    info!("Fleet Simulator v{}", env!("CARGO_PKG_VERSION"));
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let code = run(args).await;
    std::process::exit(code);
}
