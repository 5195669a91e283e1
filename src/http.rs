//! HTTP forms of the resilience stages, for `tower` services over
//! `http::Request<Full<Bytes>>` / `http::Response<Full<Bytes>>`.
//!
//! Rejections are rendered as responses rather than errors. The body is JSON
//! `{"error": "<message>"}`:
//! - rate limited: `429 Too Many Requests` with `Retry-After`
//! - circuit open: `503 Service Unavailable`, `"circuit breaker is open"`
//! - panic: the configured status (default `500`) with the handler-derived message
//!
//! Retry buffers every attempt in a [`BufferedResponse`] and forwards only the final one, so
//! an exhausted retry returns the last upstream response unchanged.
//!
//! [`RateLimitHttpLayer`] is meant to sit upstream of [`ResilienceLayer`], which composes
//! `PanicRecovery → CircuitBreaker → Retry → service`.

use crate::circuit_breaker::CircuitBreaker;
use crate::rate_limit::ip::normalize_ip;
use crate::rate_limit::{Decision, RateLimiter};
use crate::{PanicRecovery, ResilienceError, RetryPolicy};
use bytes::Bytes;
use futures::future::BoxFuture;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderMap, Request, Response, StatusCode, Version};
use http_body_util::{BodyExt, Full};
use serde::Serialize;
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_layer::Layer;
use tower_service::Service;

/// Body type used on both sides of the HTTP layers.
pub type Body = Full<Bytes>;

/// Boxed error returned by services whose inner errors are type-erased.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Derives the rate-limit key from a request.
pub type KeyExtractor = Arc<dyn Fn(&Request<Body>) -> String + Send + Sync>;

/// Decides whether a response counts as a success.
pub type StatusClassifier = Arc<dyn Fn(StatusCode) -> bool + Send + Sync>;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

/// Build a JSON error response `{"error": message}`.
pub fn json_error(status: StatusCode, message: &str) -> Response<Body> {
    let body = serde_json::to_vec(&ErrorBody { error: message })
        .unwrap_or_else(|_| br#"{"error":"internal error"}"#.to_vec());
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Default key extraction: first `X-Forwarded-For` entry, then `X-Real-IP`, then a
/// [`SocketAddr`] request extension, else `"unknown"`.
pub fn client_ip<B>(req: &Request<B>) -> String {
    fn header<'a, B>(req: &'a Request<B>, name: &str) -> Option<&'a str> {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
    if let Some(forwarded) = header(req, "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty()) {
            return normalize_ip(first);
        }
    }
    if let Some(real) = header(req, "x-real-ip") {
        return normalize_ip(real);
    }
    match req.extensions().get::<SocketAddr>() {
        Some(addr) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}

/// Default success classification: status in `[200, 400)`.
pub fn is_success_status(status: StatusCode) -> bool {
    (200..400).contains(&status.as_u16())
}

fn retry_after_secs(retry_after: Duration) -> u64 {
    let millis = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
    (millis.saturating_add(999) / 1000).max(1)
}

fn clone_request(req: &Request<Body>) -> Request<Body> {
    let mut clone = Request::new(req.body().clone());
    *clone.method_mut() = req.method().clone();
    *clone.uri_mut() = req.uri().clone();
    *clone.version_mut() = req.version();
    *clone.headers_mut() = req.headers().clone();
    *clone.extensions_mut() = req.extensions().clone();
    clone
}

async fn call_ready<S>(inner: &S, req: Request<Body>) -> Result<Response<Body>, BoxError>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone,
    S::Error: Into<BoxError>,
{
    let mut svc = inner.clone();
    futures::future::poll_fn(|cx| svc.poll_ready(cx)).await.map_err(Into::into)?;
    svc.call(req).await.map_err(Into::into)
}

/// Fully-read response: status, headers and body, replayable as a fresh response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedResponse {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
}

impl BufferedResponse {
    /// Read `response` to the end.
    pub async fn record(response: Response<Body>) -> Self {
        let (parts, body) = response.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(never) => match never {},
        };
        Self { status: parts.status, version: parts.version, headers: parts.headers, body }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Full::new(self.body));
        *response.status_mut() = self.status;
        *response.version_mut() = self.version;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Why an HTTP attempt failed, as seen by the retry predicate.
#[derive(Debug, Error)]
pub enum HttpFailure {
    /// The service answered with a response classified as a failure.
    #[error("upstream responded with {}", .0.status())]
    Status(BufferedResponse),
    /// The service itself returned an error.
    #[error("{0}")]
    Service(BoxError),
}

impl HttpFailure {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HttpFailure::Status(response) => Some(response.status()),
            HttpFailure::Service(_) => None,
        }
    }
}

/// HTTP retry settings: a [`RetryPolicy`] over [`HttpFailure`] plus the response classifier.
#[derive(Clone)]
pub struct HttpRetry {
    policy: RetryPolicy<HttpFailure>,
    is_failure: Arc<dyn Fn(&BufferedResponse) -> bool + Send + Sync>,
    cancel: CancellationToken,
}

impl fmt::Debug for HttpRetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRetry").field("policy", &self.policy).finish()
    }
}

impl HttpRetry {
    /// Responses with status >= 500 count as failures; service errors always do.
    pub fn new(policy: RetryPolicy<HttpFailure>) -> Self {
        Self {
            policy,
            is_failure: Arc::new(|response: &BufferedResponse| response.status().is_server_error()),
            cancel: CancellationToken::new(),
        }
    }

    /// Override which responses are treated as failed attempts.
    pub fn with_failure_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&BufferedResponse) -> bool + Send + Sync + 'static,
    {
        self.is_failure = Arc::new(classifier);
        self
    }

    /// Abort pending backoff waits when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    async fn run<S>(&self, inner: &S, req: Request<Body>) -> Result<Response<Body>, BoxError>
    where
        S: Service<Request<Body>, Response = Response<Body>> + Clone,
        S::Error: Into<BoxError>,
    {
        let outcome = self
            .policy
            .execute_with_retry(&self.cancel, || {
                let attempt = clone_request(&req);
                async move {
                    let response = call_ready(inner, attempt)
                        .await
                        .map_err(|e| ResilienceError::Inner(HttpFailure::Service(e)))?;
                    let buffered = BufferedResponse::record(response).await;
                    if (self.is_failure)(&buffered) {
                        Err(ResilienceError::Inner(HttpFailure::Status(buffered)))
                    } else {
                        Ok(buffered)
                    }
                }
            })
            .await;

        match outcome {
            Ok(buffered) => Ok(buffered.into_response()),
            Err(err) => match err.into_inner() {
                Some(HttpFailure::Status(buffered)) => Ok(buffered.into_response()),
                Some(HttpFailure::Service(e)) => Err(e),
                None => Err(Box::new(ResilienceError::<Infallible>::Cancelled)),
            },
        }
    }
}

/// Tower layer enforcing a [`RateLimiter`] on HTTP requests.
#[derive(Clone)]
pub struct RateLimitHttpLayer {
    limiter: Arc<dyn RateLimiter>,
    key_fn: KeyExtractor,
    emit_headers: bool,
}

impl fmt::Debug for RateLimitHttpLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitHttpLayer").field("emit_headers", &self.emit_headers).finish()
    }
}

impl RateLimitHttpLayer {
    /// Limit by client IP (see [`client_ip`]).
    pub fn new<L: RateLimiter + 'static>(limiter: L) -> Self {
        Self::shared(Arc::new(limiter))
    }

    pub fn shared(limiter: Arc<dyn RateLimiter>) -> Self {
        Self { limiter, key_fn: Arc::new(client_ip::<Body>), emit_headers: true }
    }

    /// Derive the key with a custom extractor (API key, user ID...).
    pub fn with_key_extractor<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&Request<Body>) -> String + Send + Sync + 'static,
    {
        self.key_fn = Arc::new(key_fn);
        self
    }

    /// Toggle `X-RateLimit-Limit` / `X-RateLimit-Remaining` on admitted responses.
    pub fn with_rate_limit_headers(mut self, enabled: bool) -> Self {
        self.emit_headers = enabled;
        self
    }
}

impl<S> Layer<S> for RateLimitHttpLayer {
    type Service = RateLimitHttpService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitHttpService { inner, layer: self.clone() }
    }
}

/// Service produced by [`RateLimitHttpLayer`].
#[derive(Clone, Debug)]
pub struct RateLimitHttpService<S> {
    inner: S,
    layer: RateLimitHttpLayer,
}

impl<S> Service<Request<Body>> for RateLimitHttpService<S>
where
    S: Service<Request<Body>, Response = Response<Body>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let key = (self.layer.key_fn)(&req);
        match self.layer.limiter.check(&key) {
            Decision::Denied { limit, retry_after } => {
                tracing::warn!(key = %key, limit, ?retry_after, "rate limit exceeded");
                let mut response =
                    json_error(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
                response.headers_mut().insert(RETRY_AFTER, retry_after_secs(retry_after).into());
                if self.layer.emit_headers {
                    response.headers_mut().insert(X_RATELIMIT_LIMIT, limit.into());
                    response.headers_mut().insert(X_RATELIMIT_REMAINING, 0u64.into());
                }
                Box::pin(async move { Ok(response) })
            }
            Decision::Allowed { limit, remaining } => {
                let fut = self.inner.call(req);
                let emit = self.layer.emit_headers && limit != u64::MAX;
                Box::pin(async move {
                    let mut response = fut.await?;
                    if emit {
                        response.headers_mut().insert(X_RATELIMIT_LIMIT, limit.into());
                        response.headers_mut().insert(X_RATELIMIT_REMAINING, remaining.into());
                    }
                    Ok(response)
                })
            }
        }
    }
}

/// Combined HTTP middleware: `PanicRecovery → CircuitBreaker → Retry → service`.
///
/// Every stage is optional. Build with [`ResilienceLayer::builder`], or use the single-stage
/// constructors.
#[derive(Clone)]
pub struct ResilienceLayer {
    recovery: Option<PanicRecovery>,
    breaker: Option<CircuitBreaker>,
    is_success: StatusClassifier,
    retry: Option<HttpRetry>,
}

impl fmt::Debug for ResilienceLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceLayer")
            .field("recovery", &self.recovery)
            .field("breaker", &self.breaker)
            .field("retry", &self.retry)
            .finish()
    }
}

impl ResilienceLayer {
    pub fn builder() -> ResilienceLayerBuilder {
        ResilienceLayerBuilder::default()
    }

    /// Only a panic recovery boundary.
    pub fn recovery(recovery: PanicRecovery) -> Self {
        Self::builder().recovery(recovery).build()
    }

    /// Only a circuit breaker, with the default `[200, 400)` success class.
    pub fn circuit_breaker(breaker: CircuitBreaker) -> Self {
        Self::builder().circuit_breaker(breaker).build()
    }

    /// Only retry.
    pub fn retry(retry: HttpRetry) -> Self {
        Self::builder().retry(retry).build()
    }
}

/// Builder for [`ResilienceLayer`].
pub struct ResilienceLayerBuilder {
    recovery: Option<PanicRecovery>,
    breaker: Option<CircuitBreaker>,
    is_success: StatusClassifier,
    retry: Option<HttpRetry>,
}

impl Default for ResilienceLayerBuilder {
    fn default() -> Self {
        Self { recovery: None, breaker: None, is_success: Arc::new(is_success_status), retry: None }
    }
}

impl ResilienceLayerBuilder {
    pub fn recovery(mut self, recovery: PanicRecovery) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Override which statuses the breaker records as successes.
    pub fn success_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(StatusCode) -> bool + Send + Sync + 'static,
    {
        self.is_success = Arc::new(classifier);
        self
    }

    pub fn retry(mut self, retry: HttpRetry) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> ResilienceLayer {
        ResilienceLayer {
            recovery: self.recovery,
            breaker: self.breaker,
            is_success: self.is_success,
            retry: self.retry,
        }
    }
}

impl<S> Layer<S> for ResilienceLayer {
    type Service = ResilienceService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ResilienceService { inner, layer: self.clone() }
    }
}

/// Service produced by [`ResilienceLayer`].
#[derive(Clone, Debug)]
pub struct ResilienceService<S> {
    inner: S,
    layer: ResilienceLayer,
}

impl<S> Service<Request<Body>> for ResilienceService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
{
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let inner = self.inner.clone();
        let layer = self.layer.clone();
        Box::pin(async move {
            let guarded = async {
                let permit = match &layer.breaker {
                    Some(breaker) => match breaker.acquire() {
                        Ok(permit) => Some(permit),
                        Err(state) => {
                            tracing::debug!(breaker = %breaker.name(), %state, "request rejected");
                            return Ok(json_error(
                                StatusCode::SERVICE_UNAVAILABLE,
                                "circuit breaker is open",
                            ));
                        }
                    },
                    None => None,
                };
                let result = match &layer.retry {
                    Some(retry) => retry.run(&inner, req).await,
                    None => call_ready(&inner, req).await,
                };
                if let Some(permit) = permit {
                    let success = matches!(&result, Ok(r) if (layer.is_success)(r.status()));
                    permit.settle(success);
                }
                result
            };

            let Some(recovery) = &layer.recovery else {
                return guarded.await;
            };
            let status = StatusCode::from_u16(recovery.config().status_code)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            recovery
                .execute(|| async { Ok::<_, ResilienceError<Infallible>>(guarded.await) })
                .await
                .unwrap_or_else(|err| Ok(json_error(status, &err.to_string())))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::SlidingWindowLimiter;
    use crate::{CircuitBreakerConfig, CircuitState, InstantSleeper};
    use http::Method;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{service_fn, ServiceExt};

    fn request(ip: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/orders")
            .header("x-forwarded-for", ip)
            .body(Full::new(Bytes::from_static(b"payload")))
            .unwrap()
    }

    fn respond(status: StatusCode, body: &'static str) -> Response<Body> {
        let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
        *response.status_mut() = status;
        response
    }

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn key_extraction_order() {
        let mut req = Request::new(Full::new(Bytes::new()));
        assert_eq!(client_ip(&req), "unknown");
        req.extensions_mut().insert("10.0.0.9:5000".parse::<SocketAddr>().unwrap());
        assert_eq!(client_ip(&req), "10.0.0.9");
        req.headers_mut().insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));
        assert_eq!(client_ip(&req), "10.0.0.2");
        req.headers_mut()
            .insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7:443, 10.0.0.1"));
        assert_eq!(client_ip(&req), "203.0.113.7");
    }

    #[test]
    fn retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_millis(1)), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1500)), 2);
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
    }

    #[tokio::test]
    async fn rate_limit_returns_429_with_headers() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(30)).unwrap();
        let svc = RateLimitHttpLayer::new(limiter).layer(service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(respond(StatusCode::OK, "ok"))
        }));

        let ok = svc.clone().oneshot(request("198.51.100.1")).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(ok.headers()[&X_RATELIMIT_LIMIT], "1");
        assert_eq!(ok.headers()[&X_RATELIMIT_REMAINING], "0");

        let denied = svc.clone().oneshot(request("198.51.100.1")).await.unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(denied.headers()[CONTENT_TYPE], "application/json");
        assert!(denied.headers().contains_key(RETRY_AFTER));
        assert_eq!(body_json(denied).await["error"], "rate limit exceeded");

        let other = svc.oneshot(request("198.51.100.2")).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn breaker_opens_on_server_errors_and_returns_503() {
        let config = CircuitBreakerConfig::new(2, Duration::from_secs(60), 1).unwrap();
        let breaker = CircuitBreaker::new("orders", config).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let svc = ResilienceLayer::circuit_breaker(breaker.clone()).layer(service_fn(
            move |_req: Request<Body>| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, Infallible>(respond(StatusCode::BAD_GATEWAY, "upstream down")) }
            },
        ));

        for _ in 0..2 {
            let response = svc.clone().oneshot(request("1.1.1.1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let rejected = svc.oneshot(request("1.1.1.1")).await.unwrap();
        assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(rejected).await;
        assert!(body["error"].as_str().unwrap().contains("circuit breaker"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_errors_count_as_breaker_failures() {
        let config = CircuitBreakerConfig::new(1, Duration::from_secs(60), 1).unwrap();
        let breaker = CircuitBreaker::new("strict", config).unwrap();
        let svc = ResilienceLayer::circuit_breaker(breaker.clone()).layer(service_fn(
            |_req: Request<Body>| async {
                Ok::<_, Infallible>(respond(StatusCode::NOT_FOUND, "missing"))
            },
        ));
        svc.oneshot(request("1.1.1.1")).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn retry_forwards_last_response_when_exhausted() {
        let policy = RetryPolicy::builder().max_retries(2).with_sleeper(InstantSleeper).build();
        let retry = HttpRetry::new(policy.unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let svc = ResilienceLayer::retry(retry).layer(service_fn(move |req: Request<Body>| {
            let attempt = calls_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                let body = req.into_body().collect().await.unwrap().to_bytes();
                assert_eq!(body, Bytes::from_static(b"payload"), "body replayed each attempt");
                let mut response = respond(StatusCode::SERVICE_UNAVAILABLE, "busy");
                response.headers_mut().insert("x-attempt", attempt.into());
                Ok::<_, Infallible>(response)
            }
        }));

        let response = svc.oneshot(request("1.1.1.1")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["x-attempt"], "2");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"busy"));
    }

    #[tokio::test]
    async fn retry_stops_on_success() {
        let policy = RetryPolicy::builder().max_retries(5).with_sleeper(InstantSleeper).build();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let svc = ResilienceLayer::retry(HttpRetry::new(policy.unwrap())).layer(service_fn(
            move |_req: Request<Body>| {
                let attempt = calls_clone.fetch_add(1, Ordering::SeqCst);
                async move {
                    let status =
                        if attempt < 2 { StatusCode::INTERNAL_SERVER_ERROR } else { StatusCode::OK };
                    Ok::<_, Infallible>(respond(status, "done"))
                }
            },
        ));
        let response = svc.oneshot(request("1.1.1.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn recovery_renders_panics() {
        let recovery = PanicRecovery::new(
            crate::RecoveryConfig::default()
                .with_status_code(502)
                .with_handler(|info| format!("crashed: {}", info.payload)),
        )
        .unwrap();
        let svc = ResilienceLayer::recovery(recovery).layer(service_fn(
            |req: Request<Body>| async move {
                if req.uri().path() == "/orders" {
                    panic!("handler bug");
                }
                Ok::<_, Infallible>(respond(StatusCode::OK, "ok"))
            },
        ));

        let response = svc.oneshot(request("1.1.1.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(response).await["error"], "crashed: handler bug");
    }
}
