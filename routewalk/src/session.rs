//! Session aggregate, lifecycle state machine and end-of-session metrics.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::{Clock, SessionClock};
use crate::report::SummaryDispatch;
use crate::route::{RoutePath, RouteRecorder};
use crate::step::StepDetector;
use crate::{GeoFix, LocationPermission, MotionSample, SessionConfig, SessionError};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Active,
    Ended,
}

impl Default for SessionStatus {
    fn default() -> Self {
        SessionStatus::Idle
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
        };
        f.write_str(label)
    }
}

/// User-issued lifecycle commands.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Command {
    Start,
    End,
    NewSession,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Command::Start => "start",
            Command::End => "end",
            Command::NewSession => "replace",
        };
        f.write_str(label)
    }
}

/// The aggregate root. Only `SessionController` and `RouteRecorder` mutate it.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Session {
    pub(crate) status: SessionStatus,
    pub(crate) step_count: u64,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) ended_at: Option<DateTime<Utc>>,
    pub(crate) start_fix: Option<GeoFix>,
    pub(crate) end_fix: Option<GeoFix>,
    pub(crate) path: RoutePath,
}

impl Session {
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn start_fix(&self) -> Option<GeoFix> {
        self.start_fix
    }

    pub fn end_fix(&self) -> Option<GeoFix> {
        self.end_fix
    }

    pub fn path(&self) -> &RoutePath {
        &self.path
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

/// Steps per minute, or `Undefined` when no time elapsed.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRate {
    PerMinute(f64),
    Undefined,
}

impl StepRate {
    pub fn value(&self) -> Option<f64> {
        match self {
            StepRate::PerMinute(rate) => Some(*rate),
            StepRate::Undefined => None,
        }
    }

    /// Two-decimal rendering, `None` when undefined.
    pub fn to_fixed(&self) -> Option<String> {
        self.value().map(|rate| format!("{:.2}", rate))
    }
}

impl fmt::Display for StepRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepRate::PerMinute(rate) => write!(f, "{:.2} steps/min", rate),
            StepRate::Undefined => f.write_str("undefined"),
        }
    }
}

pub fn steps_per_minute(step_count: u64, elapsed_seconds: f64) -> StepRate {
    if elapsed_seconds <= 0.0 || !elapsed_seconds.is_finite() {
        return StepRate::Undefined;
    }
    StepRate::PerMinute(step_count as f64 / (elapsed_seconds / 60.0))
}

/// Walking energy estimate in kcal, rounded to two decimals.
pub fn estimate_calories(distance_m: f64, weight_kg: f64, met_value: f64) -> f64 {
    let kcal = met_value * weight_kg * (distance_m / 1000.0) / 60.0;
    (kcal * 100.0).round() / 100.0
}

/// Detached record of a finished session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub timestamp: DateTime<Utc>,
    pub step_count: u64,
    pub start_fix: GeoFix,
    pub end_fix: GeoFix,
    pub elapsed_seconds: f64,
    pub step_rate: StepRate,
    pub distance_m: f64,
    pub calories_kcal: f64,
}

/// Read-only view for a display surface.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DisplaySnapshot {
    pub status: SessionStatus,
    pub step_count: u64,
    pub elapsed: String,
    pub ticking: bool,
    pub path: Vec<GeoFix>,
    pub current_fix: Option<GeoFix>,
    pub step_rate: Option<String>,
    /// Non-finite motion samples dropped since the controller was created.
    pub rejected_samples: u64,
}

/// Owns the live session and applies every input to it.
pub struct SessionController {
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    dispatch: Box<dyn SummaryDispatch>,
    session: Session,
    detector: StepDetector,
    recorder: RouteRecorder,
    session_clock: SessionClock,
    summary: Option<SessionSummary>,
}

impl fmt::Debug for SessionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionController")
            .field("session", &self.session)
            .field("current_fix", &self.recorder.current())
            .finish()
    }
}

impl SessionController {
    pub fn new(
        config: SessionConfig,
        clock: Arc<dyn Clock>,
        dispatch: Box<dyn SummaryDispatch>,
    ) -> Self {
        let detector = StepDetector::new(config.step_threshold, config.step_trigger);
        Self {
            config,
            clock,
            dispatch,
            session: Session::default(),
            detector,
            recorder: RouteRecorder::default(),
            session_clock: SessionClock::default(),
            summary: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status
    }

    /// Summary of the session that just ended, if any.
    pub fn summary(&self) -> Option<&SessionSummary> {
        self.summary.as_ref()
    }

    pub fn current_fix(&self) -> Option<GeoFix> {
        self.recorder.current()
    }

    pub fn permission(&self) -> LocationPermission {
        self.recorder.permission()
    }

    pub fn set_permission(&mut self, permission: LocationPermission) {
        self.recorder.set_permission(permission);
    }

    pub fn is_ticking(&self) -> bool {
        self.session_clock.is_ticking()
    }

    /// Feed one accelerometer sample. Returns true iff a step was counted.
    pub fn observe(&mut self, sample: &MotionSample) -> bool {
        if !self.session.is_active() {
            return false;
        }
        if self.detector.observe(sample) {
            self.session.step_count += 1;
            true
        } else {
            false
        }
    }

    /// Feed one location fix. Returns `Ok(true)` if it extended the path.
    pub fn on_fix(&mut self, fix: GeoFix) -> Result<bool, SessionError> {
        self.recorder.on_fix(&mut self.session, fix)
    }

    /// Advance the display clock; `None` when no session is running.
    pub fn tick(&mut self) -> Option<Duration> {
        if !self.session.is_active() {
            return None;
        }
        self.session_clock.tick(self.clock.now())
    }

    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.session.status != SessionStatus::Idle {
            return Err(SessionError::InvalidTransition {
                from: self.session.status,
                command: Command::Start,
            });
        }
        let fix = self.recorder.usable_fix().ok_or(SessionError::Precondition)?;
        let now = self.clock.now();

        self.session = Session {
            status: SessionStatus::Active,
            step_count: 0,
            started_at: Some(now),
            ended_at: None,
            start_fix: Some(fix),
            end_fix: None,
            path: RoutePath::default(),
        };
        self.summary = None;
        self.detector.reset();
        self.session_clock.start(now);
        info!(latitude = fix.latitude, longitude = fix.longitude, "session started");
        Ok(())
    }

    /// Close the active session and dispatch its summary.
    pub fn end(&mut self) -> Result<SessionSummary, SessionError> {
        if self.session.status != SessionStatus::Active {
            return Err(SessionError::InvalidTransition {
                from: self.session.status,
                command: Command::End,
            });
        }
        let end_fix = self.recorder.usable_fix().ok_or(SessionError::Precondition)?;
        let ended_at = self.clock.now();
        // `start` always records both; a missing value means a broken invariant
        let (Some(started_at), Some(start_fix)) = (self.session.started_at, self.session.start_fix)
        else {
            return Err(SessionError::Precondition);
        };

        self.session.status = SessionStatus::Ended;
        self.session.ended_at = Some(ended_at);
        self.session.end_fix = Some(end_fix);
        self.session_clock.stop();

        let elapsed_seconds =
            ((ended_at - started_at).num_milliseconds() as f64 / 1000.0).max(0.0);
        let step_rate = steps_per_minute(self.session.step_count, elapsed_seconds);
        let distance_m = self.session.path.distance_m();
        let summary = SessionSummary {
            timestamp: ended_at,
            step_count: self.session.step_count,
            start_fix,
            end_fix,
            elapsed_seconds,
            step_rate,
            distance_m,
            calories_kcal: estimate_calories(
                distance_m,
                self.config.weight_kg,
                self.config.met_value,
            ),
        };
        info!(
            steps = summary.step_count,
            elapsed_s = summary.elapsed_seconds,
            step_rate = %summary.step_rate,
            distance_m = summary.distance_m,
            "session ended"
        );

        self.summary = Some(summary.clone());
        self.dispatch.dispatch(summary.clone());
        Ok(summary)
    }

    /// Replace an idle or ended session with a fresh idle one. The known
    /// location and permission carry over.
    pub fn new_session(&mut self) -> Result<(), SessionError> {
        if self.session.is_active() {
            return Err(SessionError::InvalidTransition {
                from: self.session.status,
                command: Command::NewSession,
            });
        }
        debug!(previous = %self.session.status, "replacing session");
        self.session = Session::default();
        self.session_clock = SessionClock::default();
        self.detector.reset();
        Ok(())
    }

    pub fn snapshot(&self) -> DisplaySnapshot {
        DisplaySnapshot {
            status: self.session.status,
            step_count: self.session.step_count,
            elapsed: self.session_clock.display(),
            ticking: self.session_clock.is_ticking(),
            path: self.session.path.fixes().to_vec(),
            current_fix: self.recorder.current(),
            step_rate: self.summary.as_ref().and_then(|s| s.step_rate.to_fixed()),
            rejected_samples: self.detector.rejected(),
        }
    }
}
