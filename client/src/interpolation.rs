//! Tick tracking for render interpolation
//!
//! The relay's tick is the only clock clients share. Between two ticks a
//! renderer wants to know how far along it is toward the next one, so it can
//! blend the last two known states. [`TickTracker`] remembers when the last
//! tick arrived and how long the gap before it was, and turns the current time
//! into that fraction.

use shared::DEFAULT_TICK_RATE;
use std::time::{Duration, Instant};

/// Interval assumed before the first tick has been observed
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1000 / DEFAULT_TICK_RATE as u64);

/// Smallest interval ever recorded. Catch-up ticks can arrive back to back.
pub const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct TickTracker {
    last_tick: Instant,
    last_interval: Duration,
    ticks_observed: u64,
}

impl TickTracker {
    /// Starts tracking as if a tick had just arrived at `now`
    pub fn new(now: Instant) -> Self {
        Self {
            last_tick: now,
            last_interval: DEFAULT_TICK_INTERVAL,
            ticks_observed: 0,
        }
    }

    /// Records a tick received at `now`
    pub fn on_tick(&mut self, now: Instant) {
        self.last_interval = now
            .saturating_duration_since(self.last_tick)
            .max(MIN_TICK_INTERVAL);
        self.last_tick = now;
        self.ticks_observed += 1;
    }

    /// Progress from the last tick toward the next expected one
    ///
    /// 0.0 right at a tick, 1.0 when the next is due. Exceeds 1.0 while a tick
    /// is overdue; callers clamp as needed.
    pub fn tween(&self, now: Instant) -> f32 {
        let elapsed = now.saturating_duration_since(self.last_tick);
        elapsed.as_secs_f32() / self.last_interval.as_secs_f32()
    }

    /// Gap between the last two ticks, or the default before the first one
    pub fn last_interval(&self) -> Duration {
        self.last_interval
    }

    /// Ticks recorded since tracking started
    pub fn ticks_observed(&self) -> u64 {
        self.ticks_observed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_fresh_tracker_uses_default_interval() {
        let start = Instant::now();
        let tracker = TickTracker::new(start);

        assert_eq!(tracker.last_interval(), ms(50));
        assert_eq!(tracker.ticks_observed(), 0);
        assert_approx_eq!(tracker.tween(start), 0.0, 1e-6);
        assert_approx_eq!(tracker.tween(start + ms(25)), 0.5, 1e-4);
    }

    #[test]
    fn test_interval_tracks_observed_gap() {
        let start = Instant::now();
        let mut tracker = TickTracker::new(start);

        tracker.on_tick(start + ms(100));
        assert_eq!(tracker.last_interval(), ms(100));

        tracker.on_tick(start + ms(130));
        assert_eq!(tracker.last_interval(), ms(30));
        assert_eq!(tracker.ticks_observed(), 2);
    }

    #[test]
    fn test_tween_progresses_between_ticks() {
        let start = Instant::now();
        let mut tracker = TickTracker::new(start);
        tracker.on_tick(start + ms(40));

        let tick = start + ms(40);
        assert_approx_eq!(tracker.tween(tick), 0.0, 1e-6);
        assert_approx_eq!(tracker.tween(tick + ms(10)), 0.25, 1e-4);
        assert_approx_eq!(tracker.tween(tick + ms(30)), 0.75, 1e-4);
    }

    #[test]
    fn test_tween_exceeds_one_when_overdue() {
        let start = Instant::now();
        let tracker = TickTracker::new(start);
        assert_approx_eq!(tracker.tween(start + ms(125)), 2.5, 1e-4);
    }

    #[test]
    fn test_back_to_back_ticks_floor_the_interval() {
        let start = Instant::now();
        let mut tracker = TickTracker::new(start);
        tracker.on_tick(start + ms(50));
        tracker.on_tick(start + ms(50));

        assert_eq!(tracker.last_interval(), MIN_TICK_INTERVAL);
        assert!(tracker.tween(start + ms(52)).is_finite());
        assert_approx_eq!(tracker.tween(start + ms(52)), 2.0, 1e-3);
    }

    #[test]
    fn test_time_before_last_tick_saturates() {
        let start = Instant::now();
        let mut tracker = TickTracker::new(start);
        tracker.on_tick(start + ms(50));

        assert_approx_eq!(tracker.tween(start), 0.0, 1e-6);
    }
}
