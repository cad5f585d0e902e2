//! Rate governor — paces frame emission to a target frame rate.
//!
//! Stateless with respect to emissions: the caller passes the time of the
//! last emission, so changing the rate never re-judges frames already sent.
//! A target of 0 (or anything non-finite) disables pacing.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RateGovernor {
    target_fps: f64,
    interval: Option<Duration>,
}

impl RateGovernor {
    pub fn new(target_fps: f64) -> Self {
        Self {
            target_fps,
            interval: interval_for(target_fps),
        }
    }

    /// Takes effect for the very next `permits` call.
    pub fn set_target_fps(&mut self, target_fps: f64) {
        self.target_fps = target_fps;
        self.interval = interval_for(target_fps);
    }

    pub fn target_fps(&self) -> f64 {
        self.target_fps
    }

    /// Minimum spacing between emissions, or None when unthrottled.
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// True if a frame may be emitted at `now`. Always true for the first
    /// frame, and when the clock reads earlier than `last`.
    pub fn permits(&self, last: Option<Instant>, now: Instant) -> bool {
        self.wait_time(last, now).is_zero()
    }

    /// How long until the next emission is permitted.
    pub fn wait_time(&self, last: Option<Instant>, now: Instant) -> Duration {
        let (Some(interval), Some(last)) = (self.interval, last) else {
            return Duration::ZERO;
        };
        match now.checked_duration_since(last) {
            Some(elapsed) => interval.saturating_sub(elapsed),
            None => Duration::ZERO,
        }
    }
}

fn interval_for(fps: f64) -> Option<Duration> {
    if !fps.is_finite() || fps <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(1.0 / fps).ok()
}
