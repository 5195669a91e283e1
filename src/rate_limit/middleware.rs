use crate::rate_limit::{Decision, RateLimiter};
use crate::ResilienceError;
use pin_project::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

/// A layer that enforces rate limits using a [`RateLimiter`].
///
/// `key_fn` derives the rate-limit key (client IP, user ID, API key...) from each request.
#[derive(Debug)]
pub struct RateLimitLayer<L, K> {
    limiter: Arc<L>,
    key_fn: K,
}

impl<L, K: Clone> Clone for RateLimitLayer<L, K> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), key_fn: self.key_fn.clone() }
    }
}

impl<L, K> RateLimitLayer<L, K> {
    /// Create a new rate limit layer.
    pub fn new(limiter: L, key_fn: K) -> Self {
        Self { limiter: Arc::new(limiter), key_fn }
    }

    /// Create a layer around a limiter that is shared with other code (e.g. for inspection).
    pub fn shared(limiter: Arc<L>, key_fn: K) -> Self {
        Self { limiter, key_fn }
    }
}

impl<S, L, K> Layer<S> for RateLimitLayer<L, K>
where
    K: Clone,
{
    type Service = RateLimitService<S, L, K>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
            key_fn: self.key_fn.clone(),
        }
    }
}

/// Middleware service that enforces rate limits.
#[derive(Debug)]
pub struct RateLimitService<S, L, K> {
    inner: S,
    limiter: Arc<L>,
    key_fn: K,
}

impl<S: Clone, L, K: Clone> Clone for RateLimitService<S, L, K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            key_fn: self.key_fn.clone(),
        }
    }
}

impl<S, L, K, Req> Service<Req> for RateLimitService<S, L, K>
where
    S: Service<Req>,
    L: RateLimiter,
    K: Fn(&Req) -> String,
{
    type Response = S::Response;
    type Error = ResilienceError<S::Error>;
    type Future = RateLimitFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ResilienceError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let key = (self.key_fn)(&req);
        match self.limiter.check(&key) {
            Decision::Allowed { .. } => RateLimitFuture::Admitted { fut: self.inner.call(req) },
            Decision::Denied { retry_after, .. } => {
                tracing::warn!(key = %key, ?retry_after, "rate limit exceeded");
                RateLimitFuture::Denied { key, retry_after }
            }
        }
    }
}

/// Response future for [`RateLimitService`].
#[pin_project(project = RateLimitFutureProj)]
pub enum RateLimitFuture<F> {
    /// The request was admitted and is running.
    Admitted {
        #[pin]
        fut: F,
    },
    /// The request was rejected before reaching the inner service.
    Denied { key: String, retry_after: Duration },
}

impl<F, T, E> Future for RateLimitFuture<F>
where
    F: Future<Output = Result<T, E>>,
{
    type Output = Result<T, ResilienceError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            RateLimitFutureProj::Admitted { fut } => fut.poll(cx).map_err(ResilienceError::Inner),
            RateLimitFutureProj::Denied { key, retry_after } => Poll::Ready(Err(
                ResilienceError::RateLimited { key: std::mem::take(key), retry_after: *retry_after },
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::SlidingWindowLimiter;
    use std::time::Duration;
    use tower::{service_fn, ServiceBuilder, ServiceExt};

    #[tokio::test]
    async fn denies_per_key_after_limit() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_secs(60)).unwrap();
        let svc = ServiceBuilder::new()
            .layer(RateLimitLayer::new(limiter, |req: &(&'static str, u32)| req.0.to_string()))
            .service(service_fn(|req: (&'static str, u32)| async move {
                Ok::<_, std::io::Error>(req.1 * 2)
            }));

        assert_eq!(svc.clone().oneshot(("alice", 1)).await.unwrap(), 2);
        assert_eq!(svc.clone().oneshot(("alice", 2)).await.unwrap(), 4);
        let err = svc.clone().oneshot(("alice", 3)).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert!(err.retry_after().is_some());

        // other keys are unaffected
        assert_eq!(svc.oneshot(("bob", 5)).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn inner_errors_are_wrapped() {
        let limiter = SlidingWindowLimiter::new(10, Duration::from_secs(60)).unwrap();
        let svc = RateLimitLayer::new(limiter, |_: &()| "k".to_string()).layer(service_fn(
            |_: ()| async { Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "down")) },
        ));
        let err = svc.oneshot(()).await.unwrap_err();
        assert!(err.is_inner());
    }
}
