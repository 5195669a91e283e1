//! Sliding-window log limiter.

use super::window::KeyedWindowTracker;
use super::{validate_duration, Decision, RateLimitConfigError, RateLimiter};
use crate::clock::{Clock, MonotonicClock};
use std::sync::Arc;
use std::time::Duration;

/// Admits at most `limit` calls per key within any rolling `window`.
#[derive(Debug, Clone)]
pub struct SlidingWindowLimiter {
    limit: usize,
    tracker: Arc<KeyedWindowTracker>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    pub fn new(limit: usize, window: Duration) -> Result<Self, RateLimitConfigError> {
        if limit == 0 {
            return Err(RateLimitConfigError::ZeroLimit("default".into()));
        }
        validate_duration("window", window)?;
        Ok(Self {
            limit,
            tracker: Arc::new(KeyedWindowTracker::new(window)),
            clock: Arc::new(MonotonicClock::default()),
        })
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.tracker.window()
    }

    /// Requests counted against `key` in the current window.
    pub fn count(&self, key: &str) -> usize {
        self.tracker.count(key, self.clock.now_millis())
    }

    /// Drop keys with no activity inside the window.
    pub fn cleanup(&self) -> usize {
        self.tracker.evict_stale(self.clock.now_millis())
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn check(&self, key: &str) -> Decision {
        let check = self.tracker.try_record(key, self.limit, self.clock.now_millis());
        let limit = self.limit as u64;
        if check.allowed {
            Decision::Allowed { limit, remaining: limit.saturating_sub(check.count as u64) }
        } else {
            Decision::Denied { limit, retry_after: check.retry_after }
        }
    }
}
