//! Route accumulation from location fixes.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::session::{Session, SessionStatus};
use crate::{GeoFix, LocationPermission, SessionError};

/// Ordered, append-only list of fixes with a running path length.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutePath {
    fixes: Vec<GeoFix>,
    distance_m: f64,
}

impl RoutePath {
    pub fn push(&mut self, fix: GeoFix) {
        if let Some(last) = self.fixes.last() {
            self.distance_m += last.distance_to(&fix);
        }
        self.fixes.push(fix);
    }

    pub fn fixes(&self) -> &[GeoFix] {
        &self.fixes
    }

    pub fn len(&self) -> usize {
        self.fixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixes.is_empty()
    }

    pub fn first(&self) -> Option<&GeoFix> {
        self.fixes.first()
    }

    pub fn last(&self) -> Option<&GeoFix> {
        self.fixes.last()
    }

    /// Sum of great-circle distances between consecutive fixes, in meters.
    pub fn distance_m(&self) -> f64 {
        self.distance_m
    }

    pub fn iter(&self) -> impl Iterator<Item = &GeoFix> {
        self.fixes.iter()
    }
}

/// Tracks the device location and feeds the active session's path.
///
/// The current location is kept across sessions so a new session can start
/// as soon as it is created.
#[derive(Clone, Debug, Default)]
pub struct RouteRecorder {
    current: Option<GeoFix>,
    permission: LocationPermission,
}

impl RouteRecorder {
    /// Handle a delivered fix. Returns `Ok(true)` if it was appended to the
    /// session path.
    pub fn on_fix(&mut self, session: &mut Session, fix: GeoFix) -> Result<bool, SessionError> {
        if self.permission == LocationPermission::Denied {
            return Err(SessionError::PermissionDenied);
        }
        if !fix.is_valid() {
            debug!(?fix, "dropping malformed location fix");
            return Ok(false);
        }
        self.current = Some(fix);
        if session.status != SessionStatus::Active {
            return Ok(false);
        }
        session.path.push(fix);
        // guard for sessions activated without an anchor; `start` sets one
        if session.start_fix.is_none() {
            session.start_fix = Some(fix);
        }
        Ok(true)
    }

    /// Last known location, regardless of session state or permission.
    pub fn current(&self) -> Option<GeoFix> {
        self.current
    }

    /// Location usable by session commands; unavailable while permission is
    /// denied even if an older fix is known.
    pub fn usable_fix(&self) -> Option<GeoFix> {
        match self.permission {
            LocationPermission::Denied => None,
            _ => self.current,
        }
    }

    pub fn permission(&self) -> LocationPermission {
        self.permission
    }

    pub fn set_permission(&mut self, permission: LocationPermission) {
        if permission == LocationPermission::Denied {
            warn!("location permission denied; session commands need a fix to proceed");
        }
        self.permission = permission;
    }
}

/// Drops fixes closer than `min_distance_m` to the last one let through,
/// mirroring a platform distance-interval subscription.
#[derive(Clone, Debug)]
pub struct FixFilter {
    min_distance_m: f64,
    last: Option<GeoFix>,
}

impl FixFilter {
    pub fn new(min_distance_m: f64) -> Self {
        Self {
            min_distance_m: min_distance_m.max(0.0),
            last: None,
        }
    }

    pub fn accept(&mut self, fix: &GeoFix) -> bool {
        // malformed fixes pass through to be dropped downstream, never anchor
        if !fix.is_valid() {
            return true;
        }
        if let Some(last) = self.last {
            if last.distance_to(fix) < self.min_distance_m {
                return false;
            }
        }
        self.last = Some(*fix);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_session() -> Session {
        let mut session = Session::default();
        session.status = SessionStatus::Active;
        session
    }

    #[test]
    fn fixes_only_append_while_active() {
        let mut recorder = RouteRecorder::default();
        let mut session = Session::default();

        assert_eq!(recorder.on_fix(&mut session, GeoFix::new(1.0, 1.0)), Ok(false));
        assert!(session.path.is_empty());
        assert_eq!(recorder.current(), Some(GeoFix::new(1.0, 1.0)));

        session.status = SessionStatus::Active;
        assert_eq!(recorder.on_fix(&mut session, GeoFix::new(1.0, 1.001)), Ok(true));
        session.status = SessionStatus::Ended;
        assert_eq!(recorder.on_fix(&mut session, GeoFix::new(1.0, 1.002)), Ok(false));

        assert_eq!(session.path.fixes(), &[GeoFix::new(1.0, 1.001)]);
        assert_eq!(recorder.current(), Some(GeoFix::new(1.0, 1.002)));
    }

    #[test]
    fn first_active_fix_becomes_start_fix_when_unset() {
        let mut recorder = RouteRecorder::default();
        let mut session = active_session();
        recorder.on_fix(&mut session, GeoFix::new(10.0, 20.0)).unwrap();
        recorder.on_fix(&mut session, GeoFix::new(10.0, 20.1)).unwrap();
        assert_eq!(session.start_fix, Some(GeoFix::new(10.0, 20.0)));
        assert_eq!(session.path.last(), Some(&GeoFix::new(10.0, 20.1)));
    }

    #[test]
    fn duplicates_are_kept() {
        let mut recorder = RouteRecorder::default();
        let mut session = active_session();
        for _ in 0..3 {
            recorder.on_fix(&mut session, GeoFix::new(5.0, 5.0)).unwrap();
        }
        assert_eq!(session.path.len(), 3);
        assert_eq!(session.path.distance_m(), 0.0);
    }

    #[test]
    fn malformed_fixes_are_dropped() {
        let mut recorder = RouteRecorder::default();
        let mut session = active_session();
        assert_eq!(recorder.on_fix(&mut session, GeoFix::new(f64::NAN, 0.0)), Ok(false));
        assert!(session.path.is_empty());
        assert_eq!(recorder.current(), None);
    }

    #[test]
    fn denied_permission_blocks_fixes_and_commands() {
        let mut recorder = RouteRecorder::default();
        let mut session = active_session();
        recorder.on_fix(&mut session, GeoFix::new(1.0, 1.0)).unwrap();
        recorder.set_permission(LocationPermission::Denied);
        assert_eq!(
            recorder.on_fix(&mut session, GeoFix::new(1.0, 2.0)),
            Err(SessionError::PermissionDenied)
        );
        assert_eq!(recorder.usable_fix(), None);
        assert_eq!(recorder.current(), Some(GeoFix::new(1.0, 1.0)));
    }

    #[test]
    fn path_distance_accumulates() {
        let mut path = RoutePath::default();
        path.push(GeoFix::new(0.0, 0.0));
        path.push(GeoFix::new(0.0, 0.5));
        path.push(GeoFix::new(0.0, 1.0));
        assert!((path.distance_m() - 111_195.0).abs() < 200.0);
    }

    #[test]
    fn fix_filter_enforces_minimum_spacing() {
        let mut filter = FixFilter::new(1.0);
        let a = GeoFix::new(0.0, 0.0);
        // ~0.1 m and ~11 m east of `a`
        let near = GeoFix::new(0.0, 0.000001);
        let far = GeoFix::new(0.0, 0.0001);
        assert!(filter.accept(&a));
        assert!(!filter.accept(&near));
        assert!(filter.accept(&far));
    }
}
