//! Error types for resilience policies
use crate::circuit_breaker::CircuitState;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Details captured when a panic is intercepted at a recovery boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicInfo {
    /// Panic payload rendered as text (`&str`/`String` payloads, otherwise a placeholder).
    pub payload: String,
    /// Message derived by the configured panic handler.
    pub message: String,
    /// Captured backtrace, when stack traces are enabled.
    pub backtrace: Option<String>,
}

impl fmt::Display for PanicInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Unified error type for all resilience policies
#[derive(Debug, Clone, Error)]
pub enum ResilienceError<E> {
    /// The rate limiter denied admission for `key`.
    #[error("rate limit exceeded for key '{key}' (retry after {retry_after:?})")]
    RateLimited { key: String, retry_after: Duration },
    /// The circuit breaker rejected the call without invoking it.
    #[error("circuit breaker '{name}' is open (state: {state})")]
    CircuitOpen { name: String, state: CircuitState },
    /// Every allowed attempt failed; `last` is the final underlying error.
    #[error("max retries exceeded after {attempts} attempts: {last}")]
    MaxRetriesExceeded { attempts: usize, last: E },
    /// A panic was intercepted and converted into an error.
    #[error("{0}")]
    PanicRecovered(PanicInfo),
    /// The caller cancelled the operation while it was waiting between attempts.
    #[error("operation cancelled")]
    Cancelled,
    /// The underlying operation failed
    #[error("{0}")]
    Inner(E),
}

impl<E> ResilienceError<E> {
    /// Check if this error is a rate-limit denial
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Check if this error is due to circuit breaker
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error is due to retry exhaustion
    pub fn is_max_retries_exceeded(&self) -> bool {
        matches!(self, Self::MaxRetriesExceeded { .. })
    }

    /// Check if this error came from a recovered panic
    pub fn is_panic_recovered(&self) -> bool {
        matches!(self, Self::PanicRecovered(_))
    }

    /// Check if the operation was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Extract the underlying error. Retry exhaustion yields the last attempt's error.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) | Self::MaxRetriesExceeded { last: e, .. } => Some(e),
            _ => None,
        }
    }

    /// Borrow the underlying error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) | Self::MaxRetriesExceeded { last: e, .. } => Some(e),
            _ => None,
        }
    }

    /// Access the recovered panic details, if any.
    pub fn panic_info(&self) -> Option<&PanicInfo> {
        match self {
            Self::PanicRecovered(info) => Some(info),
            _ => None,
        }
    }

    /// Retry hint carried by a rate-limit denial.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Map the inner error type, preserving the resilience variant.
    pub fn map_inner<F, T>(self, f: F) -> ResilienceError<T>
    where
        F: FnOnce(E) -> T,
    {
        match self {
            Self::RateLimited { key, retry_after } => ResilienceError::RateLimited { key, retry_after },
            Self::CircuitOpen { name, state } => ResilienceError::CircuitOpen { name, state },
            Self::MaxRetriesExceeded { attempts, last } => {
                ResilienceError::MaxRetriesExceeded { attempts, last: f(last) }
            }
            Self::PanicRecovered(info) => ResilienceError::PanicRecovered(info),
            Self::Cancelled => ResilienceError::Cancelled,
            Self::Inner(e) => ResilienceError::Inner(f(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct DummyError(&'static str);
    impl fmt::Display for DummyError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }
    impl std::error::Error for DummyError {}

    #[test]
    fn rate_limited_display() {
        let err: ResilienceError<io::Error> = ResilienceError::RateLimited {
            key: "10.0.0.1".into(),
            retry_after: Duration::from_millis(250),
        };
        let msg = err.to_string();
        assert!(msg.contains("rate limit exceeded"));
        assert!(msg.contains("10.0.0.1"));
        assert_eq!(err.retry_after(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn circuit_open_display() {
        let err: ResilienceError<io::Error> =
            ResilienceError::CircuitOpen { name: "payments".into(), state: CircuitState::Open };
        let msg = err.to_string();
        assert!(msg.contains("circuit breaker"));
        assert!(msg.contains("payments"));
        assert!(err.is_circuit_open());
    }

    #[test]
    fn max_retries_exceeded_surfaces_last_error() {
        let err = ResilienceError::MaxRetriesExceeded { attempts: 3, last: DummyError("boom") };
        assert!(err.to_string().contains("3 attempts"));
        assert!(err.to_string().ends_with("boom"));
        assert_eq!(err.as_inner(), Some(&DummyError("boom")));
        assert_eq!(err.into_inner(), Some(DummyError("boom")));
    }

    #[test]
    fn panic_recovered_displays_derived_message() {
        let err: ResilienceError<DummyError> = ResilienceError::PanicRecovered(PanicInfo {
            payload: "boom".into(),
            message: "panic recovered: boom".into(),
            backtrace: None,
        });
        assert_eq!(err.to_string(), "panic recovered: boom");
        assert!(err.is_panic_recovered());
        assert_eq!(err.panic_info().map(|p| p.payload.as_str()), Some("boom"));
        assert!(err.as_inner().is_none());
    }

    #[test]
    fn inner_delegates_display_and_source() {
        use std::error::Error;
        let err = ResilienceError::Inner(DummyError("x"));
        assert_eq!(err.to_string(), "x");
        assert!(err.is_inner());
        assert!(err.source().is_none());
    }

    #[test]
    fn map_inner_preserves_variant() {
        let err: ResilienceError<DummyError> = ResilienceError::Cancelled;
        let mapped: ResilienceError<String> = err.map_inner(|e| e.0.to_string());
        assert!(mapped.is_cancelled());

        let err = ResilienceError::Inner(DummyError("y"));
        let mapped = err.map_inner(|e| e.0.len());
        assert_eq!(mapped.into_inner(), Some(1));
    }
}
