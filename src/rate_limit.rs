//! Rate limiting primitives.
//!
//! This module provides the building blocks for admission control:
//! - [`RateLimiter`]: the core trait; every limiter answers `allow(key) -> bool`.
//! - [`Decision`]: the detailed result of a check (remaining quota or retry hint).
//! - [`RateLimitLayer`]: Tower middleware that enforces a limiter per extracted key.
//!
//! # Architecture
//!
//! - **Middleware**: `RateLimitLayer` wraps your service. It doesn't know *how* limiting works,
//!   only that it should ask a `RateLimiter`.
//! - **Logic**: [`TokenBucketLimiter`], [`SlidingWindowLimiter`], [`IpRateLimiter`] and
//!   [`UserRateLimiter`] handle the math.
//! - **State**: [`KeyedWindowTracker`] is the shared per-key timestamp log used by every
//!   window-based limiter. All state is in-process and guarded by one lock per limiter.

use std::time::Duration;
use thiserror::Error;

pub mod ip;
pub mod middleware;
pub mod sliding_window;
pub mod token_bucket;
pub mod user;
pub mod window;

pub use ip::{IpRateLimiter, IpRateLimiterConfig};
pub use middleware::{RateLimitLayer, RateLimitService};
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::{TokenBucketConfig, TokenBucketLimiter};
pub use user::{UserRateLimiter, UserRateLimiterConfig};
pub use window::KeyedWindowTracker;

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request is allowed to proceed.
    Allowed {
        /// Quota applied to this key. Useful for `X-RateLimit-Limit` headers.
        limit: u64,
        /// Permits remaining after this acquisition.
        /// Useful for `X-RateLimit-Remaining` headers.
        remaining: u64,
    },
    /// The request is denied.
    Denied {
        /// Quota applied to this key.
        limit: u64,
        /// How long the caller should wait before retrying.
        /// Useful for `Retry-After` headers.
        retry_after: Duration,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Quota applied to the checked key.
    pub fn limit(&self) -> u64 {
        match self {
            Decision::Allowed { limit, .. } | Decision::Denied { limit, .. } => *limit,
        }
    }

    /// Allowed decision for keys that bypass tracking entirely.
    pub(crate) fn unlimited() -> Self {
        Decision::Allowed { limit: u64::MAX, remaining: u64::MAX }
    }
}

/// Core interface for rate limiting logic.
///
/// Implementations never block and never fail: denial is reported through the returned
/// [`Decision`] (or `false` from [`allow`](RateLimiter::allow)). Any key, including the empty
/// string, is an ordinary bucket.
pub trait RateLimiter: Send + Sync {
    /// Check and, if admitted, consume quota for `key`.
    fn check(&self, key: &str) -> Decision;

    /// Admission check: `true` if the call for `key` may proceed.
    fn allow(&self, key: &str) -> bool {
        self.check(key).is_allowed()
    }
}

impl<L: RateLimiter + ?Sized> RateLimiter for std::sync::Arc<L> {
    fn check(&self, key: &str) -> Decision {
        (**self).check(key)
    }
}

/// Errors produced when validating limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitConfigError {
    #[error("capacity must be > 0")]
    ZeroCapacity,
    #[error("refill_tokens must be > 0")]
    ZeroRefillTokens,
    #[error("{0} must be > 0")]
    ZeroDuration(&'static str),
    #[error("request limit must be > 0 (tier '{0}')")]
    ZeroLimit(String),
    #[error("max_ips must be > 0")]
    ZeroMaxKeys,
}

pub(crate) fn validate_duration(
    name: &'static str,
    value: Duration,
) -> Result<(), RateLimitConfigError> {
    if value.is_zero() {
        return Err(RateLimitConfigError::ZeroDuration(name));
    }
    Ok(())
}
