//! Route sources and fleet path generation.
//!
//! # Pluggability
//!
//! The orchestrator only sees [`RouteSource`], so an online directions
//! provider can replace the offline sources without touching the fleet.
//!
//! # Failure policy
//!
//! A route that cannot be turned into a path (too short, malformed) is
//! never fatal: a new origin/destination pair is drawn, up to
//! [`MAX_PATH_ATTEMPTS`] times per path.

use crate::config::FleetConfig;
use async_trait::async_trait;
use fleet_core::geo::random_location;
use fleet_core::stress::DriverProfile;
use fleet_core::{AgentPath, GeoPoint, PathError, RouteGeometry, SpeedWaypoint, INTERPOLATION_RESOLUTION_M};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Origin/destination draws per requested path before giving up.
pub const MAX_PATH_ATTEMPTS: usize = 10;

/// Speed limits assigned to synthetic stretches (km/h).
pub const SPEED_LIMITS: [f64; 5] = [30.0, 50.0, 70.0, 90.0, 120.0];

/// Errors raised while producing paths.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid route file {file}: {reason}")]
    Parse { file: PathBuf, reason: String },

    #[error("Unusable route: {0}")]
    Path(#[from] PathError),

    #[error("No route files found in {0}")]
    Empty(PathBuf),

    #[error("Path {index} still unusable after {attempts} attempts: {last}")]
    Exhausted {
        index: usize,
        attempts: usize,
        last: String,
    },
}

/// Produces route geometry between two points.
#[async_trait]
pub trait RouteSource: Send + Sync {
    async fn route(&self, origin: GeoPoint, destination: GeoPoint) -> Result<RouteGeometry, RouteError>;

    fn name(&self) -> &'static str;
}

// ── SyntheticRouteSource ─────────────────────────────────────────────────────

/// Offline routes: a straight line broken into ~200 m stretches with seeded
/// lateral detours and speed limits.
#[derive(Debug)]
pub struct SyntheticRouteSource {
    seed: u64,
    requests: AtomicU64,
}

impl SyntheticRouteSource {
    const STRETCH_M: f64 = 200.0;
    const MAX_STRETCHES: usize = 60;
    /// Lateral detour as a fraction of the stretch length
    const DETOUR: f64 = 0.25;
    /// Stretches sharing one speed limit
    const STRETCHES_PER_LIMIT: usize = 5;

    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            requests: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl RouteSource for SyntheticRouteSource {
    async fn route(&self, origin: GeoPoint, destination: GeoPoint) -> Result<RouteGeometry, RouteError> {
        let request = self.requests.fetch_add(1, Ordering::Relaxed);
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed ^ request.wrapping_mul(0x9e37_79b9_7f4a_7c15));

        let distance = origin.distance_m(destination);
        let stretches = ((distance / Self::STRETCH_M).ceil() as usize).clamp(2, Self::MAX_STRETCHES);
        let detour_deg = (distance / stretches as f64) * Self::DETOUR / 111_194.93;

        let mut speed = *SPEED_LIMITS.choose(&mut rng).unwrap_or(&50.0);
        let mut points = Vec::with_capacity(stretches + 1);
        for i in 0..=stretches {
            let t = i as f64 / stretches as f64;
            let mut position = origin.lerp(destination, t);
            if i > 0 && i < stretches {
                position.lat += rng.gen_range(-1.0..1.0) * detour_deg;
                position.lon += rng.gen_range(-1.0..1.0) * detour_deg / position.lat.to_radians().cos().max(0.1);
            }
            if i > 0 && i % Self::STRETCHES_PER_LIMIT == 0 {
                speed = *SPEED_LIMITS.choose(&mut rng).unwrap_or(&speed);
            }
            points.push(SpeedWaypoint::new(position, speed));
        }

        Ok(RouteGeometry::Annotated { points })
    }

    fn name(&self) -> &'static str {
        "synthetic"
    }
}

// ── FileRouteSource ──────────────────────────────────────────────────────────

/// Serves pre-recorded routes (`*.json`, either shape) round-robin.
#[derive(Debug)]
pub struct FileRouteSource {
    routes: Vec<RouteGeometry>,
    next: AtomicUsize,
}

impl FileRouteSource {
    /// Loads every `*.json` file of `dir`, in file-name order.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, RouteError> {
        let dir = dir.as_ref();
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        let mut routes = Vec::with_capacity(files.len());
        for file in files {
            let contents = std::fs::read_to_string(&file)?;
            let route = serde_json::from_str(&contents).map_err(|e| RouteError::Parse {
                file: file.clone(),
                reason: e.to_string(),
            })?;
            routes.push(route);
        }
        if routes.is_empty() {
            return Err(RouteError::Empty(dir.to_path_buf()));
        }

        info!(dir = %dir.display(), routes = routes.len(), "Route files loaded");
        Ok(Self {
            routes,
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[async_trait]
impl RouteSource for FileRouteSource {
    async fn route(&self, _origin: GeoPoint, _destination: GeoPoint) -> Result<RouteGeometry, RouteError> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.routes.len();
        Ok(self.routes[index].clone())
    }

    fn name(&self) -> &'static str {
        "files"
    }
}

// ── Path generation ──────────────────────────────────────────────────────────

/// Builds `config.paths` interpolated paths inside the configured area.
pub async fn generate_paths(
    config: &FleetConfig,
    source: &dyn RouteSource,
    rng: &mut ChaCha8Rng,
) -> Result<Vec<Arc<AgentPath>>, RouteError> {
    let mut paths = Vec::with_capacity(config.paths);

    for index in 0..config.paths {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let origin = random_location(
                config.center,
                config.distance_from_center_km as f64,
                rng.gen(),
                rng.gen(),
            );
            let destination = random_location(origin, config.max_path_distance_km as f64, rng.gen(), rng.gen());

            let built = match source.route(origin, destination).await {
                Ok(geometry) => AgentPath::from_geometry(&geometry).map_err(RouteError::from),
                Err(err) => Err(err),
            };

            match built {
                Ok(path) => {
                    let dense = path.interpolated(INTERPOLATION_RESOLUTION_M);
                    debug!(
                        index,
                        points = dense.len(),
                        distance_m = dense.distance_m() as u64,
                        seconds = dense.total_seconds(),
                        "Path generated"
                    );
                    paths.push(Arc::new(dense));
                    break;
                }
                Err(err) if attempts < MAX_PATH_ATTEMPTS => {
                    warn!(index, attempts, error = %err, "Discarding route, drawing a new origin/destination");
                }
                Err(err) => {
                    return Err(RouteError::Exhausted {
                        index,
                        attempts,
                        last: err.to_string(),
                    });
                }
            }
        }
    }

    Ok(paths)
}

/// One driver to launch.
#[derive(Debug, Clone)]
pub struct AgentAssignment {
    /// Fleet-wide index, also used for start staggering
    pub index: usize,
    pub path_index: usize,
    pub label: String,
    pub path: Arc<AgentPath>,
    pub profile: DriverProfile,
}

/// Assigns drivers to paths.
///
/// Every path gets the same number of drivers, capped so that the fleet
/// never exceeds the agent limit. With randomized behaviour each driver
/// gets its own speed and heart-rate factors; otherwise drivers of one
/// path share a single clamped copy.
pub fn relate_paths_and_drivers<R: Rng + ?Sized>(
    paths: &[Arc<AgentPath>],
    config: &FleetConfig,
    rng: &mut R,
) -> Vec<AgentAssignment> {
    let per_path = config.effective_drivers_per_path(paths.len());
    let mut assignments = Vec::with_capacity(per_path * paths.len());

    for (path_index, path) in paths.iter().enumerate() {
        let shared = Arc::new(path.personalised(1.0, 1.0));
        for driver in 0..per_path {
            let path = if config.randomize_behaviour {
                let speed_factor = rng.gen_range(0.5..1.5);
                let hr_factor = rng.gen_range(0.9..1.1);
                Arc::new(path.personalised(speed_factor, hr_factor))
            } else {
                Arc::clone(&shared)
            };
            assignments.push(AgentAssignment {
                index: assignments.len(),
                path_index,
                label: format!("driver-{path_index}-{driver}"),
                path,
                profile: DriverProfile::random(rng),
            });
        }
    }

    assignments
}
