//! Circuit breaker: a mutex-guarded Closed / Open / HalfOpen state machine.
//!
//! | State    | `allow()`                                      | success                                   | failure                               |
//! |----------|------------------------------------------------|-------------------------------------------|---------------------------------------|
//! | Closed   | always `true`                                  | reset consecutive failures                | trip to Open when `ready_to_trip`     |
//! | Open     | `false` until the recovery timeout has passed, then → HalfOpen and `true` | ignored        | ignored                               |
//! | HalfOpen | `true` while fewer than `max_requests` probes were admitted | → Closed after `max_requests` consecutive successes | trip to Open when `ready_to_trip` |
//!
//! Counts are reset on every transition into Closed or HalfOpen. The default trip predicate is
//! `consecutive_failures >= failure_threshold`; supply your own with
//! [`CircuitBreakerConfig::with_ready_to_trip`].
//!
//! Clones of a [`CircuitBreaker`] share the same state, so every handle observes and affects
//! the same circuit lifecycle.

use crate::clock::{duration_millis, Clock, MonotonicClock};
use crate::ResilienceError;
use futures::future::BoxFuture;
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tower_layer::Layer;
use tower_service::Service;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until recovery timeout elapses.
    Open,
    /// Probe mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

/// Request and outcome counters for the current state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    fn clear(&mut self) {
        *self = Counts::default();
    }
}

/// Predicate deciding whether the current counts should open the circuit.
pub type TripPredicate = Arc<dyn Fn(&Counts) -> bool + Send + Sync>;

/// Callback invoked after each transition with `(name, from, to)`.
pub type StateChangeHook = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CircuitBreakerConfigError {
    #[error("failure_threshold must be > 0 (got {provided})")]
    InvalidFailureThreshold { provided: u32 },
    #[error("recovery_timeout must be > 0 (got {0:?})")]
    InvalidRecoveryTimeout(Duration),
    #[error("max_requests must be > 0 (got {provided})")]
    InvalidMaxRequests { provided: u32 },
}

/// Breaker configuration.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    failure_threshold: u32,
    recovery_timeout: Duration,
    max_requests: u32,
    #[serde(skip)]
    ready_to_trip: Option<TripPredicate>,
    #[serde(skip)]
    on_state_change: Option<StateChangeHook>,
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("recovery_timeout", &self.recovery_timeout)
            .field("max_requests", &self.max_requests)
            .field("ready_to_trip", &self.ready_to_trip.as_ref().map(|_| "<predicate>"))
            .field("on_state_change", &self.on_state_change.as_ref().map(|_| "<hook>"))
            .finish()
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            max_requests: 1,
            ready_to_trip: None,
            on_state_change: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a config with validation.
    pub fn new(
        failure_threshold: u32,
        recovery_timeout: Duration,
        max_requests: u32,
    ) -> Result<Self, CircuitBreakerConfigError> {
        let cfg = Self { failure_threshold, recovery_timeout, max_requests, ..Self::default() };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), CircuitBreakerConfigError> {
        if self.failure_threshold == 0 {
            return Err(CircuitBreakerConfigError::InvalidFailureThreshold { provided: 0 });
        }
        if self.recovery_timeout.is_zero() {
            return Err(CircuitBreakerConfigError::InvalidRecoveryTimeout(self.recovery_timeout));
        }
        if self.max_requests == 0 {
            return Err(CircuitBreakerConfigError::InvalidMaxRequests { provided: 0 });
        }
        Ok(())
    }

    /// Replace the default trip predicate.
    pub fn with_ready_to_trip<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Counts) -> bool + Send + Sync + 'static,
    {
        self.ready_to_trip = Some(Arc::new(predicate));
        self
    }

    /// Observe state transitions. The hook runs after the breaker lock is released.
    pub fn with_on_state_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(hook));
        self
    }

    /// Consecutive failures that trip the default predicate.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Duration to stay Open before Half-Open probes.
    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    /// Probes admitted while Half-Open, and successes needed to close.
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    fn should_trip(&self, counts: &Counts) -> bool {
        match &self.ready_to_trip {
            Some(predicate) => predicate(counts),
            None => counts.consecutive_failures >= self.failure_threshold,
        }
    }
}

#[derive(Debug)]
struct Machine {
    state: CircuitState,
    counts: Counts,
    expiry_millis: u64,
    generation: u64,
}

type Transition = Option<(CircuitState, CircuitState)>;

/// Circuit breaker guarding one protected resource.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    machine: Arc<Mutex<Machine>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("counts", &self.counts())
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a breaker named `name`, validating the configuration.
    ///
    /// # Examples
    /// ```
    /// use bulwark::{CircuitBreaker, CircuitBreakerConfig};
    /// use std::time::Duration;
    /// let config = CircuitBreakerConfig::new(5, Duration::from_secs(30), 1).unwrap();
    /// let breaker = CircuitBreaker::new("inventory", config).unwrap();
    /// assert!(breaker.allow());
    /// ```
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Result<Self, CircuitBreakerConfigError> {
        config.validate()?;
        Ok(Self {
            name: Arc::from(name.into()),
            config,
            machine: Arc::new(Mutex::new(Machine {
                state: CircuitState::Closed,
                counts: Counts::default(),
                expiry_millis: 0,
                generation: 0,
            })),
            clock: Arc::new(MonotonicClock::default()),
        })
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Machine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state. Reading never transitions: an expired Open breaker reports Open until
    /// the next [`allow`](Self::allow).
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Snapshot of the counters for the current state.
    pub fn counts(&self) -> Counts {
        self.lock().counts
    }

    /// Force the breaker back to Closed with cleared counts.
    pub fn reset(&self) {
        let now = self.clock.now_millis();
        let transition = {
            let mut machine = self.lock();
            let transition = self.transition(&mut machine, CircuitState::Closed, now);
            machine.counts.clear();
            transition
        };
        self.notify(transition);
    }

    /// Admission gate. Every `true` must be followed by exactly one
    /// [`record_success`](Self::record_success) or [`record_failure`](Self::record_failure).
    pub fn allow(&self) -> bool {
        self.admit().is_ok()
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let generation = self.lock().generation;
        self.on_outcome(generation, true);
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let generation = self.lock().generation;
        self.on_outcome(generation, false);
    }

    /// Gate, run and record `operation`.
    ///
    /// Returns `ResilienceError::CircuitOpen` without running the operation when the breaker
    /// rejects the call. Any `Err` counts as a failure; a panic inside the operation is recorded
    /// as a failure before it continues unwinding.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
    {
        let permit = self.acquire().map_err(|state| self.open_error(state))?;
        let result = operation().await;
        permit.settle(result.is_ok());
        result
    }

    fn open_error<E>(&self, state: CircuitState) -> ResilienceError<E> {
        ResilienceError::CircuitOpen { name: self.name.to_string(), state }
    }

    /// Admit a call, returning a permit bound to the current generation, or the rejecting state.
    pub(crate) fn acquire(&self) -> Result<Permit, CircuitState> {
        self.admit().map(|generation| Permit { breaker: self.clone(), generation, settled: false })
    }

    /// Admission bookkeeping; yields the generation the call was admitted under.
    fn admit(&self) -> Result<u64, CircuitState> {
        let now = self.clock.now_millis();
        let (admitted, transition) = {
            let mut machine = self.lock();
            match machine.state {
                CircuitState::Closed => {
                    machine.counts.on_request();
                    (Ok(machine.generation), None)
                }
                CircuitState::Open if now > machine.expiry_millis => {
                    let transition = self.transition(&mut machine, CircuitState::HalfOpen, now);
                    machine.counts.on_request();
                    (Ok(machine.generation), transition)
                }
                CircuitState::Open => (Err(CircuitState::Open), None),
                CircuitState::HalfOpen if machine.counts.requests < self.config.max_requests => {
                    machine.counts.on_request();
                    tracing::debug!(
                        breaker = %self.name,
                        in_flight = machine.counts.requests,
                        max = self.config.max_requests,
                        "circuit breaker: half-open probe admitted"
                    );
                    (Ok(machine.generation), None)
                }
                CircuitState::HalfOpen => (Err(CircuitState::HalfOpen), None),
            }
        };
        self.notify(transition);
        admitted
    }

    fn on_outcome(&self, generation: u64, success: bool) {
        let now = self.clock.now_millis();
        let transition = {
            let mut machine = self.lock();
            if machine.generation != generation {
                // outcome belongs to a state that has already been left
                return;
            }
            match (machine.state, success) {
                (CircuitState::Open, _) => None,
                (CircuitState::Closed, true) => {
                    machine.counts.on_success();
                    None
                }
                (CircuitState::HalfOpen, true) => {
                    machine.counts.on_success();
                    if machine.counts.consecutive_successes >= self.config.max_requests {
                        self.transition(&mut machine, CircuitState::Closed, now)
                    } else {
                        None
                    }
                }
                (_, false) => {
                    machine.counts.on_failure();
                    if self.config.should_trip(&machine.counts) {
                        self.transition(&mut machine, CircuitState::Open, now)
                    } else {
                        None
                    }
                }
            }
        };
        self.notify(transition);
    }

    fn transition(&self, machine: &mut Machine, to: CircuitState, now: u64) -> Transition {
        let from = machine.state;
        if from == to {
            return None;
        }
        machine.state = to;
        machine.generation = machine.generation.wrapping_add(1);
        match to {
            CircuitState::Open => {
                machine.expiry_millis =
                    now.saturating_add(duration_millis(self.config.recovery_timeout));
                tracing::error!(
                    breaker = %self.name,
                    from = %from,
                    consecutive_failures = machine.counts.consecutive_failures,
                    total_failures = machine.counts.total_failures,
                    "circuit breaker → open"
                );
            }
            CircuitState::HalfOpen => {
                machine.counts.clear();
                tracing::info!(breaker = %self.name, "circuit breaker → half-open");
            }
            CircuitState::Closed => {
                machine.counts.clear();
                machine.expiry_millis = 0;
                tracing::info!(breaker = %self.name, from = %from, "circuit breaker → closed");
            }
        }
        Some((from, to))
    }

    fn notify(&self, transition: Transition) {
        if let (Some((from, to)), Some(hook)) = (transition, &self.config.on_state_change) {
            hook(&self.name, from, to);
        }
    }
}

/// Admission ticket; records a failure if dropped unsettled (e.g. while unwinding).
pub(crate) struct Permit {
    breaker: CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Permit {
    pub(crate) fn settle(mut self, success: bool) {
        self.settled = true;
        self.breaker.on_outcome(self.generation, success);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_outcome(self.generation, false);
        }
    }
}

/// Tower layer gating a service with a shared [`CircuitBreaker`].
#[derive(Clone, Debug)]
pub struct CircuitBreakerLayer {
    breaker: CircuitBreaker,
}

impl CircuitBreakerLayer {
    pub fn new(breaker: CircuitBreaker) -> Self {
        Self { breaker }
    }

    /// The breaker shared by every service this layer produces.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreakerService { inner, breaker: self.breaker.clone() }
    }
}

/// Service produced by [`CircuitBreakerLayer`]. Inner errors count as failures.
#[derive(Clone, Debug)]
pub struct CircuitBreakerService<S> {
    inner: S,
    breaker: CircuitBreaker,
}

impl<S, Request> Service<Request> for CircuitBreakerService<S>
where
    S: Service<Request>,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ResilienceError::Inner)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let permit = match self.breaker.acquire() {
            Ok(permit) => permit,
            Err(state) => {
                let err = self.breaker.open_error(state);
                return Box::pin(async move { Err(err) });
            }
        };
        let fut = self.inner.call(req);
        Box::pin(async move {
            let result = fut.await;
            permit.settle(result.is_ok());
            result.map_err(ResilienceError::Inner)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn breaker(threshold: u32, timeout_ms: u64, max_requests: u32) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::new();
        let config =
            CircuitBreakerConfig::new(threshold, Duration::from_millis(timeout_ms), max_requests)
                .expect("valid config");
        let breaker =
            CircuitBreaker::new("test", config).expect("valid breaker").with_clock(clock.clone());
        (breaker, clock)
    }

    #[test]
    fn rejects_invalid_config() {
        assert_eq!(
            CircuitBreakerConfig::new(0, Duration::from_secs(1), 1).unwrap_err(),
            CircuitBreakerConfigError::InvalidFailureThreshold { provided: 0 }
        );
        assert_eq!(
            CircuitBreakerConfig::new(1, Duration::ZERO, 1).unwrap_err(),
            CircuitBreakerConfigError::InvalidRecoveryTimeout(Duration::ZERO)
        );
        assert_eq!(
            CircuitBreakerConfig::new(1, Duration::from_secs(1), 0).unwrap_err(),
            CircuitBreakerConfigError::InvalidMaxRequests { provided: 0 }
        );
    }

    #[test]
    fn trips_after_consecutive_failures() {
        let (breaker, _) = breaker(3, 1000, 1);
        for _ in 0..3 {
            assert!(breaker.allow());
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
        assert_eq!(breaker.counts().consecutive_failures, 3);
    }

    #[test]
    fn success_resets_failure_streak() {
        let (breaker, _) = breaker(3, 1000, 1);
        for outcome in [false, false, true, false, false] {
            assert!(breaker.allow());
            if outcome {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        let counts = breaker.counts();
        assert_eq!(counts.requests, 5);
        assert_eq!(counts.total_failures, 4);
        assert_eq!(counts.total_successes, 1);
        assert_eq!(counts.consecutive_failures, 2);
        assert_eq!(counts.consecutive_successes, 0);
    }

    #[test]
    fn admitted_successes_never_count_as_failures() {
        let (breaker, _) = breaker(2, 1000, 1);
        for _ in 0..10 {
            assert!(breaker.allow());
            breaker.record_success();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        let counts = breaker.counts();
        assert_eq!(counts.requests, 10);
        assert_eq!(counts.total_successes, 10);
        assert_eq!(counts.total_failures, 0);
        assert_eq!(counts.consecutive_failures, 0);
    }

    #[test]
    fn allow_alone_records_no_outcome() {
        let (breaker, _) = breaker(1, 1000, 1);
        assert!(breaker.allow());
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.counts().total_failures, 0);
    }

    #[test]
    fn half_open_after_recovery_timeout_and_closes_on_successes() {
        let (breaker, clock) = breaker(2, 50, 2);
        for _ in 0..2 {
            assert!(breaker.allow());
            breaker.record_failure();
        }
        assert!(!breaker.allow());

        clock.advance(Duration::from_millis(50));
        assert!(!breaker.allow(), "expiry is exclusive");
        clock.advance(Duration::from_millis(10));
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.allow());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.counts(), Counts::default());
    }

    #[test]
    fn half_open_caps_probes() {
        let (breaker, clock) = breaker(1, 10, 2);
        assert!(breaker.allow());
        breaker.record_failure();
        clock.advance(Duration::from_millis(11));

        assert!(breaker.allow());
        assert!(breaker.allow());
        assert!(!breaker.allow(), "third probe exceeds max_requests");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_failure_reopens_when_predicate_trips() {
        let (breaker, clock) = breaker(1, 10, 3);
        assert!(breaker.allow());
        breaker.record_failure();
        clock.advance(Duration::from_millis(11));
        assert!(breaker.allow());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn custom_trip_predicate() {
        let clock = ManualClock::new();
        let config = CircuitBreakerConfig::default()
            .with_ready_to_trip(|c| c.requests >= 4 && c.total_failures * 2 >= c.requests);
        let breaker = CircuitBreaker::new("ratio", config).unwrap().with_clock(clock);
        for outcome in [true, false, true] {
            breaker.allow();
            if outcome {
                breaker.record_success()
            } else {
                breaker.record_failure()
            }
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.allow();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn state_change_hook_sees_every_transition() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let clock = ManualClock::new();
        let config = CircuitBreakerConfig::new(1, Duration::from_millis(5), 1)
            .unwrap()
            .with_on_state_change(move |name, from, to| {
                sink.lock().unwrap().push((name.to_string(), from, to));
            });
        let breaker = CircuitBreaker::new("hooked", config).unwrap().with_clock(clock.clone());

        breaker.allow();
        breaker.record_failure();
        clock.advance(Duration::from_millis(6));
        breaker.allow();
        breaker.record_success();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ("hooked".to_string(), CircuitState::Closed, CircuitState::Open),
                ("hooked".to_string(), CircuitState::Open, CircuitState::HalfOpen),
                ("hooked".to_string(), CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn reset_closes_and_clears() {
        let (breaker, _) = breaker(1, 1000, 1);
        breaker.allow();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.counts(), Counts::default());
        assert!(breaker.allow());
    }

    #[test]
    fn clones_share_state() {
        let (breaker, _) = breaker(1, 1000, 1);
        let other = breaker.clone();
        other.allow();
        other.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn execute_short_circuits_when_open() {
        let (breaker, _) = breaker(2, 1000, 1);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let result = breaker
                .execute(|| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ResilienceError::Inner(TestError("fail".into())))
                })
                .await;
            assert!(result.unwrap_err().is_inner());
        }

        let calls_clone = calls.clone();
        let result = breaker
            .execute(|| async move {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ResilienceError<TestError>>(42)
            })
            .await;
        match result {
            Err(ResilienceError::CircuitOpen { name, state }) => {
                assert_eq!(name, "test");
                assert_eq!(state, CircuitState::Open);
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2, "open circuit must not run the operation");
    }

    #[tokio::test]
    async fn execute_records_failure_when_operation_panics() {
        let (breaker, clock) = breaker(1, 10, 1);
        breaker.allow();
        breaker.record_failure();
        clock.advance(Duration::from_millis(11));

        let result = std::panic::AssertUnwindSafe(async {
            let outcome: Result<(), ResilienceError<TestError>> = breaker
                .execute(|| async {
                    if clock.now_millis() > 0 {
                        panic!("boom");
                    }
                    Ok(())
                })
                .await;
            outcome
        })
        .catch_unwind()
        .await;
        assert!(result.is_err());
        assert_eq!(breaker.state(), CircuitState::Open, "panicking probe reopens the circuit");
    }

    #[test]
    fn stale_generation_outcomes_are_ignored() {
        let (breaker, clock) = breaker(1, 10, 1);
        let permit = breaker.acquire().expect("closed admits");
        // a different caller trips the breaker meanwhile
        breaker.allow();
        breaker.record_failure();
        clock.advance(Duration::from_millis(11));
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        permit.settle(false);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn layer_rejects_with_circuit_open() {
        use tower::{service_fn, ServiceExt};

        let (breaker, _) = breaker(1, 1000, 1);
        let layer = CircuitBreakerLayer::new(breaker.clone());
        let failing = layer.layer(service_fn(|_: ()| async {
            Err::<(), _>(TestError("down".into()))
        }));

        assert!(failing.clone().oneshot(()).await.unwrap_err().is_inner());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(failing.oneshot(()).await.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn concurrent_probes_respect_cap() {
        let (breaker, clock) = breaker(1, 5, 3);
        breaker.allow();
        breaker.record_failure();
        clock.advance(Duration::from_millis(6));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let b = breaker.clone();
            handles.push(tokio::spawn(async move { b.allow() }));
        }
        let admitted = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().expect("join"))
            .count();
        assert_eq!(admitted, 3);
    }
}
