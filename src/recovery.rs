//! Panic recovery boundary.
//!
//! [`PanicRecovery`] polls the wrapped future under `catch_unwind` and turns a panic into
//! `ResilienceError::PanicRecovered`. Only panics raised while the wrapped future (or closure)
//! is running are caught. A panic inside a task detached with `tokio::spawn` unwinds that task
//! and never reaches this boundary.
//!
//! ```rust
//! use bulwark::{PanicRecovery, ResilienceError};
//!
//! async fn flaky() -> Result<(), ResilienceError<std::io::Error>> {
//!     panic!("kaboom")
//! }
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let recovery = PanicRecovery::default();
//! let result = recovery.execute(flaky).await;
//! let info = result.unwrap_err().panic_info().cloned().unwrap();
//! assert_eq!(info.message, "panic recovered: kaboom");
//! # });
//! ```

use crate::error::PanicInfo;
use crate::ResilienceError;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tower_layer::Layer;
use tower_service::Service;

/// Derives the reported message from a recovered panic.
pub type PanicHandler = Arc<dyn Fn(&PanicInfo) -> String + Send + Sync>;

/// Errors produced when validating recovery configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryConfigError {
    #[error("status_code must be a valid HTTP status (100..=599), got {0}")]
    InvalidStatusCode(u16),
}

/// Recovery options.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// When false, panics propagate untouched.
    pub recover_enabled: bool,
    /// Emit a `tracing::error!` event for each recovered panic.
    pub log_enabled: bool,
    /// Capture a backtrace at the recovery boundary.
    pub include_stack_trace: bool,
    /// Status reported by the HTTP form.
    pub status_code: u16,
    #[serde(skip)]
    handler: Option<PanicHandler>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            recover_enabled: true,
            log_enabled: true,
            include_stack_trace: false,
            status_code: 500,
            handler: None,
        }
    }
}

impl fmt::Debug for RecoveryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryConfig")
            .field("recover_enabled", &self.recover_enabled)
            .field("log_enabled", &self.log_enabled)
            .field("include_stack_trace", &self.include_stack_trace)
            .field("status_code", &self.status_code)
            .field("handler", &self.handler.as_ref().map(|_| "<handler>"))
            .finish()
    }
}

impl RecoveryConfig {
    pub fn validate(&self) -> Result<(), RecoveryConfigError> {
        if !(100..=599).contains(&self.status_code) {
            return Err(RecoveryConfigError::InvalidStatusCode(self.status_code));
        }
        Ok(())
    }

    /// Replace the default `"panic recovered: <payload>"` message.
    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&PanicInfo) -> String + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn with_stack_trace(mut self, enabled: bool) -> Self {
        self.include_stack_trace = enabled;
        self
    }
}

/// Converts panics inside wrapped operations into errors.
#[derive(Debug, Clone, Default)]
pub struct PanicRecovery {
    config: RecoveryConfig,
}

impl PanicRecovery {
    pub fn new(config: RecoveryConfig) -> Result<Self, RecoveryConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Run `operation`, converting a panic into `ResilienceError::PanicRecovered`.
    ///
    /// Panics raised while building the future are caught too.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
    {
        if !self.config.recover_enabled {
            return operation().await;
        }
        match AssertUnwindSafe(async move { operation().await }).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(ResilienceError::PanicRecovered(self.recover(payload))),
        }
    }

    /// Synchronous form of [`execute`](Self::execute).
    pub fn call<T, E, F>(&self, f: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Result<T, ResilienceError<E>>,
    {
        if !self.config.recover_enabled {
            return f();
        }
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => result,
            Err(payload) => Err(ResilienceError::PanicRecovered(self.recover(payload))),
        }
    }

    /// Build the [`PanicInfo`] for a caught payload and log it if enabled.
    pub fn recover(&self, payload: Box<dyn Any + Send>) -> PanicInfo {
        let payload = payload_text(payload.as_ref());
        let backtrace =
            self.config.include_stack_trace.then(|| Backtrace::force_capture().to_string());
        let mut info = PanicInfo { message: String::new(), payload, backtrace };
        info.message = match &self.config.handler {
            Some(handler) => handler(&info),
            None => format!("panic recovered: {}", info.payload),
        };

        if self.config.log_enabled {
            match &info.backtrace {
                Some(trace) => tracing::error!(
                    panic = %info.payload,
                    message = %info.message,
                    backtrace = %trace,
                    "recovered from panic"
                ),
                None => tracing::error!(
                    panic = %info.payload,
                    message = %info.message,
                    "recovered from panic"
                ),
            }
        }
        info
    }
}

fn payload_text(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

/// Tower layer placing a [`PanicRecovery`] boundary around a service.
#[derive(Debug, Clone, Default)]
pub struct RecoveryLayer {
    recovery: PanicRecovery,
}

impl RecoveryLayer {
    pub fn new(recovery: PanicRecovery) -> Self {
        Self { recovery }
    }
}

impl<S> Layer<S> for RecoveryLayer {
    type Service = RecoveryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecoveryService { inner, recovery: self.recovery.clone() }
    }
}

/// Service produced by [`RecoveryLayer`].
#[derive(Debug, Clone)]
pub struct RecoveryService<S> {
    inner: S,
    recovery: PanicRecovery,
}

impl<S, Request> Service<Request> for RecoveryService<S>
where
    S: Service<Request>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ResilienceError::Inner)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let recovery = self.recovery.clone();
        // `call` itself may panic before a future exists
        let called: Result<S::Future, ResilienceError<S::Error>> =
            recovery.call(|| Ok(self.inner.call(req)));
        let fut = match called {
            Ok(fut) => fut,
            Err(err) => return Box::pin(async move { Err(err) }),
        };
        Box::pin(async move {
            recovery.execute(|| async move { fut.await.map_err(ResilienceError::Inner) }).await
        })
    }
}
