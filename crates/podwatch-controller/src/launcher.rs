//! Pod launch throttle
//!
//! Spaces out pod creation so a burst of queued runs does not turn into a
//! burst of create calls against the cluster API.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use podwatch_common::Clock;
use tracing::debug;

/// Enforces a minimum interval between pod launches
pub struct ThrottledLauncher {
    clock: Arc<dyn Clock>,
    min_interval: Duration,
    last_launch: Mutex<Option<DateTime<Utc>>>,
}

impl ThrottledLauncher {
    /// Create a throttle with the given minimum interval
    pub fn new(clock: Arc<dyn Clock>, min_interval: Duration) -> Self {
        Self {
            clock,
            min_interval,
            last_launch: Mutex::new(None),
        }
    }

    /// Minimum time between launches
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    fn last_launch(&self) -> Option<DateTime<Utc>> {
        *self.last_launch.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// How long until the next launch is allowed; zero if allowed now
    pub fn time_until_next_launch(&self) -> Duration {
        let Some(last) = self.last_launch() else {
            return Duration::ZERO;
        };
        let elapsed = self.clock.now() - last;
        // A clock that moved backwards counts as no time elapsed.
        let elapsed = elapsed.to_std().unwrap_or(Duration::ZERO);
        self.min_interval.saturating_sub(elapsed)
    }

    /// Whether a pod may be launched now
    pub fn can_launch_now(&self) -> bool {
        self.time_until_next_launch().is_zero()
    }

    /// Record that a pod was just launched
    pub fn record_launch(&self) {
        let now = self.clock.now();
        *self.last_launch.lock().unwrap_or_else(|e| e.into_inner()) = Some(now);
        debug!(
            next_in_ms = self.min_interval.as_millis(),
            "Pod launched, throttling the next launch"
        );
    }

    /// Atomically check the throttle and record a launch if allowed
    pub fn try_acquire(&self) -> bool {
        let now = self.clock.now();
        let mut last = self.last_launch.lock().unwrap_or_else(|e| e.into_inner());
        let allowed = match *last {
            None => true,
            Some(prev) => {
                let min = TimeDelta::from_std(self.min_interval).unwrap_or(TimeDelta::MAX);
                now - prev >= min
            }
        };
        if allowed {
            *last = Some(now);
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podwatch_common::ManualClock;

    fn launcher(interval_ms: u64) -> (ThrottledLauncher, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let launcher = ThrottledLauncher::new(clock.clone(), Duration::from_millis(interval_ms));
        (launcher, clock)
    }

    #[test]
    fn first_launch_is_always_allowed() {
        let (launcher, _) = launcher(1000);
        assert!(launcher.can_launch_now());
        assert_eq!(launcher.time_until_next_launch(), Duration::ZERO);
    }

    #[test]
    fn launches_are_spaced_by_the_interval() {
        let (launcher, clock) = launcher(1000);
        launcher.record_launch();
        assert!(!launcher.can_launch_now());

        clock.advance(TimeDelta::milliseconds(400));
        assert_eq!(launcher.time_until_next_launch(), Duration::from_millis(600));

        clock.advance(TimeDelta::milliseconds(600));
        assert!(launcher.can_launch_now());
    }

    #[test]
    fn try_acquire_claims_the_slot() {
        let (launcher, clock) = launcher(500);
        assert!(launcher.try_acquire());
        assert!(!launcher.try_acquire());

        clock.advance(TimeDelta::milliseconds(500));
        assert!(launcher.try_acquire());
    }

    #[test]
    fn clock_going_backwards_keeps_the_throttle_closed() {
        let (launcher, clock) = launcher(1000);
        launcher.record_launch();
        clock.advance(TimeDelta::seconds(-5));
        assert_eq!(launcher.time_until_next_launch(), Duration::from_millis(1000));
    }

    #[test]
    fn zero_interval_never_throttles() {
        let (launcher, _) = launcher(0);
        launcher.record_launch();
        assert!(launcher.can_launch_now());
        assert!(launcher.try_acquire());
    }
}
