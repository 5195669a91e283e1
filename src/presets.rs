//! Ready-made configurations for common deployments.
//!
//! ## Available Presets
//!
//! - [`web_api`]: HTTP handlers (recovery, circuit breaker, retry on 5xx)
//! - [`database_client`]: database calls (recovery, circuit breaker, NO retry)
//! - [`external_api`]: third-party calls (recovery, tolerant breaker, patient retry)
//! - [`per_ip_limiter`]: 100 requests per minute per client IP
//! - [`api_token_bucket`]: 100-token buckets refilled at 10 tokens/s
//!
//! ```rust
//! use bulwark::presets;
//!
//! # fn main() -> Result<(), bulwark::presets::PresetError> {
//! let stack = presets::database_client::<std::io::Error>("orders-db")?;
//! assert!(stack.retry().is_none());
//! # Ok(())
//! # }
//! ```

use crate::circuit_breaker::CircuitBreakerConfigError;
use crate::http::{HttpRetry, ResilienceLayer};
use crate::rate_limit::{
    IpRateLimiter, IpRateLimiterConfig, RateLimitConfigError, TokenBucketConfig,
    TokenBucketLimiter,
};
use crate::retry::BuildError;
use crate::{
    CircuitBreaker, CircuitBreakerConfig, PanicRecovery, ResilienceStack, RetryPolicy,
};
use std::time::Duration;
use thiserror::Error;

const WEB_BREAKER_THRESHOLD: u32 = 10;
const WEB_BREAKER_RECOVERY_SECS: u64 = 30;
const WEB_RETRIES: usize = 3;
const WEB_INITIAL_DELAY_MILLIS: u64 = 100;
const WEB_MAX_DELAY_SECS: u64 = 5;

const DB_BREAKER_THRESHOLD: u32 = 5;
const DB_BREAKER_RECOVERY_SECS: u64 = 60;

const EXTERNAL_BREAKER_THRESHOLD: u32 = 15;
const EXTERNAL_BREAKER_RECOVERY_SECS: u64 = 120;
const EXTERNAL_HALF_OPEN_PROBES: u32 = 3;
const EXTERNAL_RETRIES: usize = 5;
const EXTERNAL_INITIAL_DELAY_MILLIS: u64 = 500;
const EXTERNAL_MAX_DELAY_SECS: u64 = 30;

/// Errors from building a preset.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PresetError {
    #[error(transparent)]
    Breaker(#[from] CircuitBreakerConfigError),
    #[error(transparent)]
    Retry(#[from] BuildError),
    #[error(transparent)]
    RateLimit(#[from] RateLimitConfigError),
}

fn breaker(
    name: &str,
    threshold: u32,
    recovery_secs: u64,
    probes: u32,
) -> Result<CircuitBreaker, PresetError> {
    let config =
        CircuitBreakerConfig::new(threshold, Duration::from_secs(recovery_secs), probes)?;
    Ok(CircuitBreaker::new(name, config)?)
}

/// HTTP middleware for web handlers.
///
/// - **Recovery:** panics become `500 {"error": ...}`
/// - **Circuit Breaker:** opens after 10 consecutive failures, 30s recovery, 1 probe
/// - **Retry:** 3 retries on 5xx or service errors, 100ms doubling up to 5s
pub fn web_api(name: &str) -> Result<ResilienceLayer, PresetError> {
    let policy = RetryPolicy::builder()
        .max_retries(WEB_RETRIES)
        .initial_delay(Duration::from_millis(WEB_INITIAL_DELAY_MILLIS))
        .max_delay(Duration::from_secs(WEB_MAX_DELAY_SECS))
        .build()?;
    Ok(ResilienceLayer::builder()
        .recovery(PanicRecovery::default())
        .circuit_breaker(breaker(name, WEB_BREAKER_THRESHOLD, WEB_BREAKER_RECOVERY_SECS, 1)?)
        .retry(HttpRetry::new(policy))
        .build())
}

/// Stack for database calls.
///
/// **NO RETRY:** database operations are often non-idempotent; retry at the transaction
/// boundary instead.
pub fn database_client<E>(name: &str) -> Result<ResilienceStack<E>, PresetError> {
    Ok(ResilienceStack::builder()
        .recovery(PanicRecovery::default())
        .circuit_breaker(breaker(name, DB_BREAKER_THRESHOLD, DB_BREAKER_RECOVERY_SECS, 1)?)
        .build())
}

/// Stack for third-party APIs: tolerant breaker with 3 half-open probes, 5 retries starting
/// at 500ms and capped at 30s.
pub fn external_api<E>(name: &str) -> Result<ResilienceStack<E>, PresetError> {
    let policy = RetryPolicy::builder()
        .max_retries(EXTERNAL_RETRIES)
        .initial_delay(Duration::from_millis(EXTERNAL_INITIAL_DELAY_MILLIS))
        .max_delay(Duration::from_secs(EXTERNAL_MAX_DELAY_SECS))
        .build()?;
    let breaker = breaker(
        name,
        EXTERNAL_BREAKER_THRESHOLD,
        EXTERNAL_BREAKER_RECOVERY_SECS,
        EXTERNAL_HALF_OPEN_PROBES,
    )?;
    Ok(ResilienceStack::builder()
        .recovery(PanicRecovery::default())
        .circuit_breaker(breaker)
        .retry(policy)
        .build())
}

/// 100 requests per minute per IP, at most 10k tracked IPs. Starts the background cleanup
/// task when called inside a tokio runtime.
pub fn per_ip_limiter() -> Result<IpRateLimiter, PresetError> {
    Ok(IpRateLimiter::new(IpRateLimiterConfig::default())?)
}

/// Token buckets of 100 tokens refilled with 10 tokens every second.
pub fn api_token_bucket() -> Result<TokenBucketLimiter, PresetError> {
    Ok(TokenBucketLimiter::with_config(TokenBucketConfig::default())?)
}
