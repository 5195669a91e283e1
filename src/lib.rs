#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Bulwark
//!
//! Request resilience middleware for async Rust: rate limiting, circuit breaking, retry with
//! exponential backoff, and panic recovery.
//!
//! ## Features
//!
//! - **Rate limiters**: token bucket, sliding window, per-IP and tiered per-user quotas
//! - **Circuit breakers** with half-open probing and a named registry
//! - **Retry policies** with capped exponential backoff and cancellation
//! - **Panic recovery** that turns panics into errors or `500` responses
//! - **Combined pipeline** in a fixed order: recovery, breaker, retry, call
//! - **Tower layers** for generic services and JSON-erroring HTTP services
//!
//! ## Quick Start
//!
//! ```rust
//! use bulwark::{ResilienceError, RetryPolicy};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let policy = RetryPolicy::builder()
//!         .max_retries(3)
//!         .initial_delay(Duration::from_millis(10))
//!         .build()
//!         .unwrap();
//!
//!     let result = policy
//!         .execute(|| async { Ok::<_, ResilienceError<std::io::Error>>("done") })
//!         .await;
//!     assert_eq!(result.unwrap(), "done");
//! }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
pub mod error;
pub mod http;
pub mod prelude;
pub mod presets;
pub mod rate_limit;
pub mod recovery;
pub mod retry;
pub mod sleeper;
pub mod stack;

// Re-exports
pub use backoff::Backoff;
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerLayer, CircuitState, Counts,
};
pub use circuit_breaker_registry::CircuitBreakerRegistry;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{PanicInfo, ResilienceError};
pub use rate_limit::{
    Decision, IpRateLimiter, RateLimiter, SlidingWindowLimiter, TokenBucketLimiter,
    UserRateLimiter,
};
pub use recovery::{PanicRecovery, RecoveryConfig};
pub use retry::{RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use stack::{ResilienceStack, ResilienceStackBuilder};
