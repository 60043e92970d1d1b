//! Core step-and-route session engine implemented in Rust.
//!
//! A session counts footsteps from accelerometer samples, records the GPS
//! path while it is active and, once ended, derives a summary (elapsed time,
//! step rate, distance and an effort estimate) that is handed to a report
//! sink.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod clock;
pub mod report;
pub mod route;
pub mod runtime;
pub mod session;
pub mod step;

pub use clock::{format_elapsed, Clock, ClockOverflow, ManualClock, SessionClock, SystemClock};
pub use report::{
    spawn_reporter, HttpReportSink, LogReportSink, ReportError, ReportPayload, ReportSink,
    SummaryDispatch,
};
pub use route::{FixFilter, RoutePath, RouteRecorder};
pub use runtime::{EventLoop, RuntimeError, SessionHandle, Subscription};
pub use session::{
    estimate_calories, steps_per_minute, Command, DisplaySnapshot, Session, SessionController,
    SessionStatus, SessionSummary, StepRate,
};
pub use step::{StepDetector, StepTrigger};

/// Default magnitude (in g) above which a sample counts as a step.
pub const DEFAULT_STEP_THRESHOLD: f64 = 1.2;
/// Default endpoint receiving finished session reports.
pub const DEFAULT_REPORT_URL: &str = "https://apiapp.fly.dev/addRegistro";

const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("no location available")]
    Precondition,
    #[error("cannot {command} a session that is {from}")]
    InvalidTransition { from: SessionStatus, command: Command },
    #[error("location permission denied")]
    PermissionDenied,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// One 3-axis accelerometer reading, in g.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl MotionSample {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean norm of the three components.
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// A single location fix. Altitude and accuracy are carried through but the
/// session engine only looks at latitude/longitude.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoFix {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

impl GeoFix {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude: None,
            accuracy: None,
        }
    }

    /// True when the coordinates are finite and inside the WGS84 ranges.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Great-circle distance to `other` in meters.
    pub fn distance_to(&self, other: &GeoFix) -> f64 {
        haversine_distance(self.latitude, self.longitude, other.latitude, other.longitude)
    }
}

pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let to_rad = |deg: f64| deg.to_radians();
    let dlat = to_rad(lat2 - lat1);
    let dlon = to_rad(lon2 - lon1);
    let a = (dlat / 2.0).sin().powi(2)
        + to_rad(lat1).cos() * to_rad(lat2).cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Tunables for a session engine instance.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub step_threshold: f64,
    pub step_trigger: StepTrigger,
    pub tick_interval_ms: u64,
    pub min_fix_distance_m: f64,
    pub report_url: String,
    pub weight_kg: f64,
    pub met_value: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            step_threshold: DEFAULT_STEP_THRESHOLD,
            step_trigger: StepTrigger::PerSample,
            tick_interval_ms: 1000,
            min_fix_distance_m: 1.0,
            report_url: DEFAULT_REPORT_URL.to_string(),
            weight_kg: 70.0,
            met_value: 3.5,
        }
    }
}

impl SessionConfig {
    /// Load a config from a JSON file; missing keys fall back to defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: SessionConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.step_threshold.is_finite() || self.step_threshold < 0.0 {
            return Err(ConfigError::InvalidParameter(format!(
                "step_threshold must be a non-negative number, got {}",
                self.step_threshold
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidParameter(
                "tick_interval_ms must be > 0".into(),
            ));
        }
        if !self.min_fix_distance_m.is_finite() || self.min_fix_distance_m < 0.0 {
            return Err(ConfigError::InvalidParameter(format!(
                "min_fix_distance_m must be a non-negative number, got {}",
                self.min_fix_distance_m
            )));
        }
        if !self.weight_kg.is_finite() || self.weight_kg <= 0.0 {
            return Err(ConfigError::InvalidParameter(format!(
                "weight_kg must be positive, got {}",
                self.weight_kg
            )));
        }
        if !self.met_value.is_finite() || self.met_value <= 0.0 {
            return Err(ConfigError::InvalidParameter(format!(
                "met_value must be positive, got {}",
                self.met_value
            )));
        }
        if self.report_url.trim().is_empty() {
            return Err(ConfigError::InvalidParameter(
                "report_url must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Outcome of the foreground location permission request.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LocationPermission {
    Undetermined,
    Granted,
    Denied,
}

impl Default for LocationPermission {
    fn default() -> Self {
        LocationPermission::Undetermined
    }
}
