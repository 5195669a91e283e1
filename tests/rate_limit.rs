use bulwark::rate_limit::{
    IpRateLimiterConfig, RateLimitLayer, TokenBucketConfig, UserRateLimiterConfig,
};
use bulwark::{
    Decision, IpRateLimiter, ManualClock, RateLimiter, ResilienceError, SlidingWindowLimiter,
    TokenBucketLimiter, UserRateLimiter,
};
use std::sync::Arc;
use std::time::Duration;
use tower::{service_fn, ServiceExt};

#[test]
fn token_bucket_drains_then_refills_one_token_per_interval() {
    let clock = ManualClock::new();
    let bucket = TokenBucketLimiter::new(3, Duration::from_millis(100), 1)
        .unwrap()
        .with_clock(clock.clone());

    assert!(bucket.allow("client"));
    assert!(bucket.allow("client"));
    assert!(bucket.allow("client"));
    assert!(!bucket.allow("client"));

    clock.advance(Duration::from_millis(150));
    assert!(bucket.allow("client"));
    assert!(!bucket.allow("client"), "only one interval elapsed");

    clock.advance(Duration::from_millis(50));
    assert!(bucket.allow("client"), "partial interval carried over");
}

#[test]
fn token_bucket_keys_are_independent() {
    let bucket = TokenBucketLimiter::new(1, Duration::from_secs(60), 1)
        .unwrap()
        .with_clock(ManualClock::new());

    assert!(bucket.allow("a"));
    assert!(!bucket.allow("a"));
    assert!(bucket.allow("b"));
    assert!(bucket.allow(""), "empty key is an ordinary bucket");
}

#[test]
fn token_bucket_burst_raises_ceiling() {
    let config = TokenBucketConfig {
        capacity: 2,
        refill_interval: Duration::from_secs(1),
        refill_tokens: 1,
        burst: 2,
    };
    let bucket = TokenBucketLimiter::with_config(config).unwrap().with_clock(ManualClock::new());
    let admitted = (0..10).filter(|_| bucket.allow("k")).count();
    assert_eq!(admitted, 4);
}

#[test]
fn sliding_window_denies_until_oldest_request_expires() {
    let clock = ManualClock::new();
    let limiter =
        SlidingWindowLimiter::new(2, Duration::from_secs(1)).unwrap().with_clock(clock.clone());

    assert!(limiter.allow("k"));
    clock.advance(Duration::from_millis(400));
    assert!(limiter.allow("k"));

    match limiter.check("k") {
        Decision::Denied { limit, retry_after } => {
            assert_eq!(limit, 2);
            assert_eq!(retry_after, Duration::from_millis(601));
        }
        other => panic!("expected denial, got {other:?}"),
    }

    clock.advance(Duration::from_millis(601));
    assert!(limiter.allow("k"));
    assert_eq!(limiter.count("k"), 2);
}

#[test]
fn ip_limiter_normalizes_ports_and_honours_lists() {
    let config = IpRateLimiterConfig {
        requests_per_window: 1,
        window: Duration::from_secs(60),
        blacklist: vec!["10.0.0.66".into()],
        whitelist: vec!["127.0.0.1".into()],
        ..IpRateLimiterConfig::default()
    };
    let limiter = IpRateLimiter::with_clock(config, ManualClock::new()).unwrap();

    assert!(limiter.allow("192.168.1.1:5000"));
    assert!(!limiter.allow("192.168.1.1:6000"), "port is not part of the key");
    assert!(!limiter.allow("10.0.0.66"));
    for _ in 0..5 {
        assert!(limiter.allow("127.0.0.1:8080"));
    }
    assert_eq!(limiter.tracked_ips(), vec!["192.168.1.1".to_string()]);
}

#[test]
fn user_limiter_applies_tier_quotas() {
    let config = UserRateLimiterConfig {
        requests_per_window: 1,
        window: Duration::from_secs(60),
        ..UserRateLimiterConfig::default()
    }
    .with_tier("pro", 3);
    let limiter = UserRateLimiter::new(config).unwrap().with_clock(ManualClock::new());

    let pro = (0..5).filter(|_| limiter.allow_user("alice", "pro")).count();
    let unknown = (0..5).filter(|_| limiter.allow_user("bob", "enterprise")).count();
    assert_eq!(pro, 3);
    assert_eq!(unknown, 1, "unknown tiers use the default quota");
}

#[test]
fn limiters_are_safe_to_share_across_threads() {
    let bucket = Arc::new(
        TokenBucketLimiter::new(100, Duration::from_secs(3600), 1)
            .unwrap()
            .with_clock(ManualClock::new()),
    );
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let bucket = bucket.clone();
            std::thread::spawn(move || (0..50).filter(|_| bucket.allow("shared")).count())
        })
        .collect();
    let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(admitted, 100);
}

#[tokio::test]
async fn rate_limit_layer_rejects_over_quota_calls() {
    let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(60))
        .unwrap()
        .with_clock(ManualClock::new());
    let layer = RateLimitLayer::new(limiter, |req: &&'static str| req.to_string());
    let svc = tower::ServiceBuilder::new()
        .layer(layer)
        .service(service_fn(|req: &'static str| async move { Ok::<_, std::io::Error>(req.len()) }));

    assert_eq!(svc.clone().oneshot("tenant").await.unwrap(), 6);
    let err = svc.oneshot("tenant").await.unwrap_err();
    assert!(err.is_rate_limited());
    match err {
        ResilienceError::RateLimited { key, .. } => assert_eq!(key, "tenant"),
        other => panic!("unexpected error: {other}"),
    }
}
