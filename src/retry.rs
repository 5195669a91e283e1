//! Retry policy for fallible async operations.
//!
//! Semantics:
//! - `max_retries` counts retries after the initial call, so an operation runs at most
//!   `max_retries + 1` times.
//! - Only `ResilienceError::Inner(E)` values are eligible for retry; other variants (for example
//!   `CircuitOpen`) return immediately.
//! - Retryability: a custom `should_retry` predicate wins; otherwise the error must match one of
//!   the `retry_on` matchers; with neither configured every `Inner` error is retried.
//! - The wait before retry `n` is `min(max_delay, initial_delay * multiplier^(n-1))`. Waits race
//!   a [`CancellationToken`]; cancellation yields `ResilienceError::Cancelled` immediately.
//! - Exhaustion yields `ResilienceError::MaxRetriesExceeded` carrying the last error.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use bulwark::{InstantSleeper, RetryPolicy, ResilienceError};
//!
//! #[derive(Debug)]
//! struct MyErr;
//! impl std::fmt::Display for MyErr {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "oops") }
//! }
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = RetryPolicy::<MyErr>::builder()
//!     .max_retries(2)
//!     .initial_delay(Duration::from_millis(100))
//!     .with_sleeper(InstantSleeper)
//!     .build()
//!     .unwrap();
//! let result: Result<(), ResilienceError<MyErr>> =
//!     policy.execute(|| async { Err(ResilienceError::Inner(MyErr)) }).await;
//! assert!(result.unwrap_err().is_max_retries_exceeded());
//! # });
//! ```

use crate::backoff::BackoffError;
use crate::clock::duration_millis;
use crate::{Backoff, ResilienceError, Sleeper, TokioSleeper};
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_layer::Layer;
use tower_service::Service;

type Matcher<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Retry policy combining backoff, retryability rules and a sleeper.
pub struct RetryPolicy<E> {
    max_retries: usize,
    backoff: Backoff,
    should_retry: Option<Matcher<E>>,
    retryable: Vec<Matcher<E>>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_retries: self.max_retries,
            backoff: self.backoff,
            should_retry: self.should_retry.clone(),
            retryable: self.retryable.clone(),
            sleeper: self.sleeper.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("should_retry", &self.should_retry.as_ref().map(|_| "<predicate>"))
            .field("retryable", &self.retryable.len())
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

impl<E> RetryPolicy<E> {
    /// Construct a new builder with defaults.
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    /// Retries after the initial call.
    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Whether `error` may be retried under this policy.
    pub fn is_retryable(&self, error: &E) -> bool {
        if let Some(predicate) = &self.should_retry {
            return predicate(error);
        }
        if self.retryable.is_empty() {
            return true;
        }
        self.retryable.iter().any(|matcher| matcher(error))
    }

    /// Replace the sleeper used between attempts.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }
}

impl<E> RetryPolicy<E>
where
    E: fmt::Display,
{
    /// Execute an async operation with retry semantics and no cancellation.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
    {
        self.execute_with_retry(&CancellationToken::new(), operation).await
    }

    /// Execute `operation`, retrying retryable `Inner` failures until success, exhaustion or
    /// cancellation of `cancel`.
    pub async fn execute_with_retry<T, Fut, Op>(
        &self,
        cancel: &CancellationToken,
        mut operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
    {
        if cancel.is_cancelled() {
            return Err(ResilienceError::Cancelled);
        }

        let mut attempt = 0usize;
        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(ResilienceError::Inner(e)) => e,
                Err(other) => return Err(other),
            };

            if !self.is_retryable(&error) {
                return Err(ResilienceError::Inner(error));
            }
            if attempt >= self.max_retries {
                tracing::warn!(
                    attempts = attempt + 1,
                    error = %error,
                    "retry: attempts exhausted"
                );
                return Err(ResilienceError::MaxRetriesExceeded {
                    attempts: attempt + 1,
                    last: error,
                });
            }

            attempt += 1;
            let delay = self.backoff.delay(attempt);
            tracing::warn!(
                attempt,
                max_retries = self.max_retries,
                delay_ms = duration_millis(delay),
                error = %error,
                "retry: attempt failed, backing off"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(attempt, "retry: cancelled while waiting");
                    return Err(ResilienceError::Cancelled);
                }
                _ = self.sleeper.sleep(delay) => {}
            }
        }
    }
}

/// Errors produced while building a retry policy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuildError {
    #[error("max_delay ({max:?}) must be >= initial_delay ({initial:?})")]
    MaxDelayBelowInitial { initial: Duration, max: Duration },
    #[error(transparent)]
    Backoff(#[from] BackoffError),
}

/// Builder for [`RetryPolicy`].
pub struct RetryPolicyBuilder<E> {
    max_retries: usize,
    initial_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    backoff: Option<Backoff>,
    should_retry: Option<Matcher<E>>,
    retryable: Vec<Matcher<E>>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> RetryPolicyBuilder<E> {
    /// Defaults: 3 retries, 100ms initial delay doubling up to 30s, every error retryable.
    pub fn new() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            backoff: None,
            should_retry: None,
            retryable: Vec::new(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Retries after the initial call. `0` disables retrying.
    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    /// Wait before the first retry.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Growth factor between consecutive waits. Must be finite and >= 1.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Upper bound on any single wait.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Use an explicit backoff schedule instead of `initial_delay`/`multiplier`/`max_delay`.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Predicate deciding retryability; overrides any `retry_on` matchers.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// Add a matcher for a retryable error class. Once any matcher is registered, only
    /// matching errors are retried.
    pub fn retry_on<F>(mut self, matcher: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.retryable.push(Arc::new(matcher));
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Build the retry policy, validating inputs.
    pub fn build(self) -> Result<RetryPolicy<E>, BuildError> {
        let backoff = match self.backoff {
            Some(backoff) => backoff,
            None => {
                if self.max_delay < self.initial_delay {
                    return Err(BuildError::MaxDelayBelowInitial {
                        initial: self.initial_delay,
                        max: self.max_delay,
                    });
                }
                Backoff::exponential(self.initial_delay)
                    .with_multiplier(self.multiplier)?
                    .with_max(self.max_delay)?
            }
        };
        Ok(RetryPolicy {
            max_retries: self.max_retries,
            backoff,
            should_retry: self.should_retry,
            retryable: self.retryable,
            sleeper: self.sleeper,
        })
    }
}

impl<E> Default for RetryPolicyBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Tower-native retry layer. Requests must be `Clone`; each attempt calls the inner service
/// with a fresh clone once it reports readiness.
pub struct RetryLayer<E> {
    policy: RetryPolicy<E>,
    cancel: CancellationToken,
}

impl<E> RetryLayer<E> {
    pub fn new(policy: RetryPolicy<E>) -> Self {
        Self { policy, cancel: CancellationToken::new() }
    }

    /// Abort pending waits of every service built from this layer when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

impl<E> Clone for RetryLayer<E> {
    fn clone(&self) -> Self {
        Self { policy: self.policy.clone(), cancel: self.cancel.clone() }
    }
}

impl<E> fmt::Debug for RetryLayer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryLayer").field("policy", &self.policy).finish()
    }
}

impl<S, E> Layer<S> for RetryLayer<E> {
    type Service = RetryService<S, E>;

    fn layer(&self, service: S) -> Self::Service {
        RetryService { inner: service, layer: self.clone() }
    }
}

/// Retry service produced by [`RetryLayer`].
pub struct RetryService<S, E> {
    inner: S,
    layer: RetryLayer<E>,
}

impl<S: Clone, E> Clone for RetryService<S, E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), layer: self.layer.clone() }
    }
}

impl<S, E, Request> Service<Request> for RetryService<S, E>
where
    Request: Clone + Send + 'static,
    S: Service<Request> + Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Error: Into<E>,
    S::Future: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<E>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(|e| ResilienceError::Inner(e.into()))
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let RetryLayer { policy, cancel } = self.layer.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            policy
                .execute_with_retry(&cancel, move || {
                    let mut svc = inner.clone();
                    let req = req.clone();
                    async move {
                        futures::future::poll_fn(|cx| svc.poll_ready(cx))
                            .await
                            .map_err(|e| ResilienceError::Inner(e.into()))?;
                        svc.call(req).await.map_err(|e| ResilienceError::Inner(e.into()))
                    }
                })
                .await
        })
    }
}
