//! Convenient re-exports for common Bulwark types.
pub use crate::{
    backoff::{Backoff, BackoffError},
    circuit_breaker::{CircuitBreakerConfigError, CircuitBreakerLayer},
    circuit_breaker_registry::{BreakerSnapshot, CircuitBreakerRegistryError},
    http::{HttpRetry, RateLimitHttpLayer, ResilienceLayer},
    rate_limit::{
        IpRateLimiterConfig, RateLimitConfigError, RateLimitLayer, TokenBucketConfig,
        UserRateLimiterConfig,
    },
    recovery::{RecoveryConfigError, RecoveryLayer},
    retry::{BuildError, RetryLayer, RetryPolicy, RetryPolicyBuilder},
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, Decision,
    IpRateLimiter, PanicRecovery, RateLimiter, RecoveryConfig, ResilienceError, ResilienceStack,
    SlidingWindowLimiter, TokenBucketLimiter, UserRateLimiter,
};
