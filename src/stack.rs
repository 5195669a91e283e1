//! Resilience stack builder for composing policies around a single operation.
//!
//! Order, outermost first: `PanicRecovery → CircuitBreaker → Retry → operation`.
//! - Recovery is outermost so a panic raised by any attempt (or while the breaker records the
//!   outcome) is contained.
//! - The breaker wraps the whole retry loop: one `allow()` per call, one recorded outcome.
//!   A rejected call never reaches the retry loop.
//! - Retry is innermost so every attempt calls the real operation.
//!
//! Stages are optional; an omitted stage is not inserted.

use crate::{CircuitBreaker, PanicRecovery, ResilienceError, RetryPolicy};
use std::fmt;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Composed resilience pipeline for direct function calls.
pub struct ResilienceStack<E> {
    recovery: Option<PanicRecovery>,
    circuit_breaker: Option<CircuitBreaker>,
    retry: Option<RetryPolicy<E>>,
}

impl<E> Clone for ResilienceStack<E> {
    fn clone(&self) -> Self {
        Self {
            recovery: self.recovery.clone(),
            circuit_breaker: self.circuit_breaker.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<E> fmt::Debug for ResilienceStack<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceStack")
            .field("recovery", &self.recovery)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("retry", &self.retry)
            .finish()
    }
}

impl<E> ResilienceStack<E> {
    pub fn builder() -> ResilienceStackBuilder<E> {
        ResilienceStackBuilder::new()
    }

    pub fn recovery(&self) -> Option<&PanicRecovery> {
        self.recovery.as_ref()
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.circuit_breaker.as_ref()
    }

    pub fn retry(&self) -> Option<&RetryPolicy<E>> {
        self.retry.as_ref()
    }
}

impl<E> ResilienceStack<E>
where
    E: fmt::Display,
{
    /// Run `operation` through every configured stage.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
    {
        self.execute_with_cancellation(&CancellationToken::new(), operation).await
    }

    /// Like [`execute`](Self::execute), with retry waits racing `cancel`.
    pub async fn execute_with_cancellation<T, Fut, Op>(
        &self,
        cancel: &CancellationToken,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
    {
        let guarded = move || async move {
            let mut operation = operation;
            match &self.circuit_breaker {
                Some(breaker) => {
                    breaker.execute(|| self.run_attempts(cancel, &mut operation)).await
                }
                None => self.run_attempts(cancel, &mut operation).await,
            }
        };
        match &self.recovery {
            Some(recovery) => recovery.execute(guarded).await,
            None => guarded().await,
        }
    }

    async fn run_attempts<T, Fut, Op>(
        &self,
        cancel: &CancellationToken,
        operation: &mut Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
    {
        match &self.retry {
            Some(policy) => policy.execute_with_retry(cancel, || operation()).await,
            None => operation().await,
        }
    }
}

/// Builder for [`ResilienceStack`]. Nothing is inserted unless configured.
pub struct ResilienceStackBuilder<E> {
    recovery: Option<PanicRecovery>,
    circuit_breaker: Option<CircuitBreaker>,
    retry: Option<RetryPolicy<E>>,
}

impl<E> ResilienceStackBuilder<E> {
    pub fn new() -> Self {
        Self { recovery: None, circuit_breaker: None, retry: None }
    }

    pub fn recovery(mut self, recovery: PanicRecovery) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy<E>) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn build(self) -> ResilienceStack<E> {
        ResilienceStack {
            recovery: self.recovery,
            circuit_breaker: self.circuit_breaker,
            retry: self.retry,
        }
    }
}

impl<E> Default for ResilienceStackBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}
