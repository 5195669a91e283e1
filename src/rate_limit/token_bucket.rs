//! Per-key token bucket limiter with lazy refill.

use super::{validate_duration, Decision, RateLimitConfigError, RateLimiter};
use crate::clock::{duration_millis, Clock, MonotonicClock};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Token bucket settings.
///
/// Every key gets its own bucket holding at most `capacity + burst` tokens. Each elapsed
/// `refill_interval` adds `refill_tokens`, clamped to that ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TokenBucketConfig {
    pub capacity: u64,
    pub refill_interval: Duration,
    pub refill_tokens: u64,
    /// Extra headroom above `capacity` available to idle keys.
    pub burst: u64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            refill_interval: Duration::from_secs(1),
            refill_tokens: 10,
            burst: 0,
        }
    }
}

impl TokenBucketConfig {
    pub fn validate(&self) -> Result<(), RateLimitConfigError> {
        if self.capacity == 0 {
            return Err(RateLimitConfigError::ZeroCapacity);
        }
        if self.refill_tokens == 0 {
            return Err(RateLimitConfigError::ZeroRefillTokens);
        }
        validate_duration("refill_interval", self.refill_interval)
    }

    /// Bucket ceiling: `capacity + burst`.
    pub fn ceiling(&self) -> u64 {
        self.capacity.saturating_add(self.burst)
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: u64,
    last_refill: u64,
    last_seen: u64,
}

impl Bucket {
    /// Tokens and refill timestamp after applying whole elapsed intervals at `now`.
    fn refilled(&self, now: u64, interval_ms: u64, refill_tokens: u64, ceiling: u64) -> (u64, u64) {
        let intervals = now.saturating_sub(self.last_refill) / interval_ms;
        if intervals == 0 {
            return (self.tokens, self.last_refill);
        }
        let added = intervals.saturating_mul(refill_tokens);
        let tokens = self.tokens.saturating_add(added).min(ceiling);
        (tokens, self.last_refill + intervals * interval_ms)
    }
}

/// Token bucket limiter keyed by caller identity.
///
/// Buckets are created full on first sight of a key and live until [`cleanup`] removes them.
/// A single mutex guards the bucket map, so concurrent calls on one key can never both take
/// the last token.
///
/// [`cleanup`]: TokenBucketLimiter::cleanup
#[derive(Debug, Clone)]
pub struct TokenBucketLimiter {
    config: TokenBucketConfig,
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    /// Create a limiter with `capacity` tokens per key, adding `refill_tokens` every
    /// `refill_interval`.
    pub fn new(
        capacity: u64,
        refill_interval: Duration,
        refill_tokens: u64,
    ) -> Result<Self, RateLimitConfigError> {
        Self::with_config(TokenBucketConfig { capacity, refill_interval, refill_tokens, burst: 0 })
    }

    pub fn with_config(config: TokenBucketConfig) -> Result<Self, RateLimitConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            buckets: Arc::new(Mutex::new(HashMap::new())),
            clock: Arc::new(MonotonicClock::default()),
        })
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &TokenBucketConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Bucket>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn interval_ms(&self) -> u64 {
        duration_millis(self.config.refill_interval).max(1)
    }

    /// Tokens currently available for `key`, including pending refill. `None` for unseen keys.
    pub fn tokens(&self, key: &str) -> Option<u64> {
        let now = self.clock.now_millis();
        let ceiling = self.config.ceiling();
        self.lock()
            .get(key)
            .map(|b| b.refilled(now, self.interval_ms(), self.config.refill_tokens, ceiling).0)
    }

    /// Number of buckets currently held.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove buckets that were untouched for at least `idle` and would be full again.
    /// Dropping them is lossless: a recreated bucket starts full. Returns the number removed.
    pub fn cleanup(&self, idle: Duration) -> usize {
        let now = self.clock.now_millis();
        let idle_ms = duration_millis(idle);
        let interval_ms = self.interval_ms();
        let refill = self.config.refill_tokens;
        let ceiling = self.config.ceiling();
        let mut buckets = self.lock();
        let before = buckets.len();
        buckets.retain(|_, b| {
            let idle_long_enough = now.saturating_sub(b.last_seen) >= idle_ms;
            let full = b.refilled(now, interval_ms, refill, ceiling).0 >= ceiling;
            !(idle_long_enough && full)
        });
        before - buckets.len()
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn check(&self, key: &str) -> Decision {
        let now = self.clock.now_millis();
        let interval_ms = self.interval_ms();
        let ceiling = self.config.ceiling();
        let mut buckets = self.lock();
        let bucket = buckets
            .entry(key.to_owned())
            .or_insert(Bucket { tokens: ceiling, last_refill: now, last_seen: now });

        let (tokens, last_refill) =
            bucket.refilled(now, interval_ms, self.config.refill_tokens, ceiling);
        bucket.tokens = tokens;
        bucket.last_refill = last_refill;
        bucket.last_seen = now;

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            Decision::Allowed { limit: ceiling, remaining: bucket.tokens }
        } else {
            let since_refill = now.saturating_sub(bucket.last_refill);
            let retry_after = Duration::from_millis(interval_ms.saturating_sub(since_refill));
            tracing::debug!(key, ?retry_after, "token bucket empty");
            Decision::Denied { limit: ceiling, retry_after }
        }
    }
}
