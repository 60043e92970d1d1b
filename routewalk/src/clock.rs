//! Wall clock abstraction and the per-session elapsed-time tracker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Source of "now" for session timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("advancing the clock by {0} overflows the supported date range")]
pub struct ClockOverflow(pub chrono::Duration);

/// A clock that only moves when told to. Clones share the same instant.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward. Leaves the clock untouched and returns
    /// [`ClockOverflow`] if the result is not representable.
    pub fn advance(&self, by: chrono::Duration) -> Result<DateTime<Utc>, ClockOverflow> {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        let next = now.checked_add_signed(by).ok_or(ClockOverflow(by))?;
        *now = next;
        Ok(next)
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Elapsed time between two instants, saturating at zero.
pub fn elapsed_since(start: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - start).to_std().unwrap_or(Duration::ZERO)
}

/// Render a duration as `M:SS`. Minutes are not wrapped into hours.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total_seconds = elapsed.as_secs();
    format!("{}:{:02}", total_seconds / 60, total_seconds % 60)
}

/// Display-side elapsed time for the active session.
///
/// Only advances between `start` and `stop`; after `stop` the last value is
/// kept so the display does not jump back to zero.
#[derive(Clone, Debug, Default)]
pub struct SessionClock {
    started_at: Option<DateTime<Utc>>,
    last_elapsed: Duration,
    ticking: bool,
}

impl SessionClock {
    pub fn start(&mut self, at: DateTime<Utc>) {
        self.started_at = Some(at);
        self.last_elapsed = Duration::ZERO;
        self.ticking = true;
    }

    /// Recompute elapsed time. Returns `None` once the clock is stopped.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<Duration> {
        if !self.ticking {
            return None;
        }
        let start = self.started_at?;
        let elapsed = elapsed_since(start, now);
        // keep the display monotonic even if `now` steps backwards
        if elapsed > self.last_elapsed {
            self.last_elapsed = elapsed;
        }
        Some(self.last_elapsed)
    }

    pub fn stop(&mut self) {
        self.ticking = false;
    }

    pub fn is_ticking(&self) -> bool {
        self.ticking
    }

    pub fn last_elapsed(&self) -> Duration {
        self.last_elapsed
    }

    pub fn display(&self) -> String {
        format_elapsed(self.last_elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn format_pads_seconds() {
        assert_eq!(format_elapsed(Duration::from_millis(0)), "0:00");
        assert_eq!(format_elapsed(Duration::from_millis(65_900)), "1:05");
        assert_eq!(format_elapsed(Duration::from_secs(3_725)), "62:05");
    }

    #[test]
    fn elapsed_saturates_when_clock_goes_backwards() {
        let start = t0();
        let earlier = start - chrono::Duration::seconds(5);
        assert_eq!(elapsed_since(start, earlier), Duration::ZERO);
        assert_eq!(
            elapsed_since(start, start + chrono::Duration::milliseconds(1500)),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn ticks_stop_after_stop_and_value_is_kept() {
        let clock = ManualClock::new(t0());
        let mut session_clock = SessionClock::default();
        assert_eq!(session_clock.tick(clock.now()), None);

        session_clock.start(clock.now());
        clock.advance(chrono::Duration::seconds(3)).unwrap();
        assert_eq!(session_clock.tick(clock.now()), Some(Duration::from_secs(3)));

        session_clock.stop();
        clock.advance(chrono::Duration::seconds(10)).unwrap();
        assert_eq!(session_clock.tick(clock.now()), None);
        assert_eq!(session_clock.last_elapsed(), Duration::from_secs(3));
        assert_eq!(session_clock.display(), "0:03");
    }

    #[test]
    fn tick_is_monotonic() {
        let clock = ManualClock::new(t0());
        let mut session_clock = SessionClock::default();
        session_clock.start(clock.now());
        clock.advance(chrono::Duration::seconds(4)).unwrap();
        session_clock.tick(clock.now());
        clock.set(t0() + chrono::Duration::seconds(2));
        assert_eq!(session_clock.tick(clock.now()), Some(Duration::from_secs(4)));
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(t0());
        let other = clock.clone();
        clock.advance(chrono::Duration::seconds(30)).unwrap();
        assert_eq!(other.now(), t0() + chrono::Duration::seconds(30));
    }

    #[test]
    fn advance_past_the_date_range_is_an_error() {
        let clock = ManualClock::new(t0());
        let huge = chrono::Duration::milliseconds(i64::MAX);
        assert_eq!(clock.advance(huge), Err(ClockOverflow(huge)));
        assert_eq!(clock.now(), t0());
    }
}
