//! Backoff strategies for retry policies.
//!
//! Provides constant, linear, and exponential strategies with optional caps. Attempt semantics:
//! attempt index `0` represents the initial call (no delay), and retries start at `attempt = 1`.
//! The exponential strategy computes `initial * multiplier^(attempt - 1)`, then applies the cap.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use bulwark::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_secs(2))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::from_millis(0)); // initial call
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(6), Duration::from_secs(2)); // capped
//! ```
//!
//! Overflow behavior: computations that would overflow saturate to `MAX_BACKOFF` (1 day).

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackoffError {
    #[error("with_max is only valid for Linear or Exponential backoff")]
    ConstantDoesNotSupportMax,
    #[error("max must be greater than zero")]
    MaxMustBePositive,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
    #[error("multiplier must be finite and >= 1.0 (got {0})")]
    InvalidMultiplier(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum BackoffKind {
    Constant { delay: Duration },
    Linear { base: Duration, max: Option<Duration> },
    Exponential { base: Duration, multiplier: f64, max: Option<Duration> },
}

/// Delay schedule applied between retry attempts.
///
/// Deserialized configs go through the same checks as [`with_multiplier`](Self::with_multiplier)
/// and [`with_max`](Self::with_max).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(try_from = "BackoffKind")]
pub struct Backoff {
    kind: BackoffKind,
}

impl TryFrom<BackoffKind> for Backoff {
    type Error = BackoffError;

    fn try_from(kind: BackoffKind) -> Result<Self, Self::Error> {
        let (backoff, max) = match kind {
            BackoffKind::Constant { delay } => return Ok(Self::constant(delay)),
            BackoffKind::Linear { base, max } => (Self::linear(base), max),
            BackoffKind::Exponential { base, multiplier, max } => {
                (Self::exponential(base).with_multiplier(multiplier)?, max)
            }
        };
        match max {
            Some(max) => backoff.with_max(max),
            None => Ok(backoff),
        }
    }
}

impl Backoff {
    /// Create a constant backoff strategy
    pub fn constant(delay: Duration) -> Self {
        Self { kind: BackoffKind::Constant { delay } }
    }

    /// Create a linear backoff strategy
    pub fn linear(base: Duration) -> Self {
        Self { kind: BackoffKind::Linear { base, max: None } }
    }

    /// Create an exponential backoff strategy that doubles each retry.
    pub fn exponential(base: Duration) -> Self {
        Self { kind: BackoffKind::Exponential { base, multiplier: 2.0, max: None } }
    }

    /// Override the growth factor of an exponential backoff.
    ///
    /// Has no effect on constant or linear strategies.
    pub fn with_multiplier(mut self, factor: f64) -> Result<Self, BackoffError> {
        if !factor.is_finite() || factor < 1.0 {
            return Err(BackoffError::InvalidMultiplier(factor));
        }
        if let BackoffKind::Exponential { multiplier, .. } = &mut self.kind {
            *multiplier = factor;
        }
        Ok(self)
    }

    /// Set a maximum delay for the backoff (linear or exponential).
    /// Returns an error if called on `Constant`, if `max` is zero, or if `max < base`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        match &mut self.kind {
            BackoffKind::Exponential { max: existing, base, .. }
            | BackoffKind::Linear { max: existing, base } => {
                if max < *base {
                    return Err(BackoffError::MaxLessThanBase { base: *base, max });
                }
                *existing = Some(max);
                Ok(self)
            }
            BackoffKind::Constant { .. } => Err(BackoffError::ConstantDoesNotSupportMax),
        }
    }

    /// The configured cap, if any.
    pub fn max(&self) -> Option<Duration> {
        match self.kind {
            BackoffKind::Constant { .. } => None,
            BackoffKind::Linear { max, .. } | BackoffKind::Exponential { max, .. } => max,
        }
    }

    /// Calculate the delay for a given attempt number (0-based; 0 = initial call, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let raw = match self.kind {
            BackoffKind::Constant { delay } => delay,
            BackoffKind::Linear { base, .. } => {
                let attempt_u32 = attempt.min(u32::MAX as usize) as u32;
                base.checked_mul(attempt_u32).unwrap_or(MAX_BACKOFF)
            }
            BackoffKind::Exponential { base, multiplier, .. } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
                let nanos = base.as_nanos() as f64 * multiplier.powi(exponent);
                if !nanos.is_finite() || nanos >= MAX_BACKOFF.as_nanos() as f64 {
                    MAX_BACKOFF
                } else {
                    Duration::from_nanos(nanos as u64)
                }
            }
        };
        let capped = self.max().map(|m| raw.min(m)).unwrap_or(raw);
        capped.min(MAX_BACKOFF)
    }
}
