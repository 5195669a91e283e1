//! Tiered per-user limiter.

use super::window::KeyedWindowTracker;
use super::{validate_duration, Decision, RateLimitConfigError, RateLimiter};
use crate::clock::{Clock, MonotonicClock};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// User limiter settings: a default quota plus per-tier overrides.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UserRateLimiterConfig {
    pub requests_per_window: usize,
    pub window: Duration,
    /// Tier name to request limit, e.g. `{"free": 10, "pro": 1000}`.
    pub tiers: HashMap<String, usize>,
}

impl Default for UserRateLimiterConfig {
    fn default() -> Self {
        Self { requests_per_window: 60, window: Duration::from_secs(60), tiers: HashMap::new() }
    }
}

impl UserRateLimiterConfig {
    pub fn validate(&self) -> Result<(), RateLimitConfigError> {
        if self.requests_per_window == 0 {
            return Err(RateLimitConfigError::ZeroLimit("default".into()));
        }
        if let Some((tier, _)) = self.tiers.iter().find(|(_, &limit)| limit == 0) {
            return Err(RateLimitConfigError::ZeroLimit(tier.clone()));
        }
        validate_duration("window", self.window)
    }

    /// Add or replace a tier.
    pub fn with_tier(mut self, tier: impl Into<String>, limit: usize) -> Self {
        self.tiers.insert(tier.into(), limit);
        self
    }
}

/// Sliding-window limiter keyed by user ID, with the quota chosen by tier.
///
/// A user's window is shared across tiers: switching tier changes the limit applied to the
/// existing log, not the log itself.
#[derive(Debug, Clone)]
pub struct UserRateLimiter {
    default_limit: usize,
    tiers: Arc<RwLock<HashMap<String, usize>>>,
    tracker: Arc<KeyedWindowTracker>,
    clock: Arc<dyn Clock>,
}

impl UserRateLimiter {
    pub fn new(config: UserRateLimiterConfig) -> Result<Self, RateLimitConfigError> {
        config.validate()?;
        Ok(Self {
            default_limit: config.requests_per_window,
            tiers: Arc::new(RwLock::new(config.tiers)),
            tracker: Arc::new(KeyedWindowTracker::new(config.window)),
            clock: Arc::new(MonotonicClock::default()),
        })
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Effective limit for `tier`; unknown tiers fall back to the default.
    pub fn limit_for(&self, tier: &str) -> usize {
        self.tiers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tier)
            .copied()
            .unwrap_or(self.default_limit)
    }

    /// Add or change a tier at runtime.
    pub fn set_tier_limit(
        &self,
        tier: impl Into<String>,
        limit: usize,
    ) -> Result<(), RateLimitConfigError> {
        let tier = tier.into();
        if limit == 0 {
            return Err(RateLimitConfigError::ZeroLimit(tier));
        }
        self.tiers.write().unwrap_or_else(PoisonError::into_inner).insert(tier, limit);
        Ok(())
    }

    /// Detailed admission check for `user_id` under `tier`.
    pub fn check_user(&self, user_id: &str, tier: &str) -> Decision {
        let limit = self.limit_for(tier);
        self.check_with_limit(user_id, limit)
    }

    /// Admission check for `user_id` under `tier`.
    pub fn allow_user(&self, user_id: &str, tier: &str) -> bool {
        self.check_user(user_id, tier).is_allowed()
    }

    /// Drop users with no activity inside the window.
    pub fn cleanup(&self) -> usize {
        self.tracker.evict_stale(self.clock.now_millis())
    }

    fn check_with_limit(&self, user_id: &str, limit: usize) -> Decision {
        let check = self.tracker.try_record(user_id, limit, self.clock.now_millis());
        let limit = limit as u64;
        if check.allowed {
            Decision::Allowed { limit, remaining: limit.saturating_sub(check.count as u64) }
        } else {
            tracing::debug!(user_id, limit, "user quota exhausted");
            Decision::Denied { limit, retry_after: check.retry_after }
        }
    }
}

impl RateLimiter for UserRateLimiter {
    /// Checks `key` as a user ID against the default quota.
    fn check(&self, key: &str) -> Decision {
        self.check_with_limit(key, self.default_limit)
    }
}
