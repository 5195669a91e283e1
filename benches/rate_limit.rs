use criterion::{black_box, criterion_group, criterion_main, Criterion};
use bulwark::rate_limit::IpRateLimiterConfig;
use bulwark::{IpRateLimiter, RateLimiter, SlidingWindowLimiter, TokenBucketLimiter};
use std::time::Duration;

const KEYS: [&str; 4] = ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"];

fn token_bucket(c: &mut Criterion) {
    let limiter = TokenBucketLimiter::new(u64::MAX / 2, Duration::from_secs(1), 1).unwrap();
    let mut i = 0usize;
    c.bench_function("token_bucket_allow", |b| {
        b.iter(|| {
            i = i.wrapping_add(1);
            black_box(limiter.allow(KEYS[i % KEYS.len()]))
        });
    });
}

fn sliding_window(c: &mut Criterion) {
    // Small window keeps per-key logs short.
    let limiter = SlidingWindowLimiter::new(1_000, Duration::from_millis(10)).unwrap();
    c.bench_function("sliding_window_allow", |b| {
        b.iter(|| black_box(limiter.allow(black_box("tenant"))));
    });
}

fn ip_limiter(c: &mut Criterion) {
    let config = IpRateLimiterConfig {
        requests_per_window: 1_000,
        window: Duration::from_millis(10),
        ..IpRateLimiterConfig::default()
    };
    let limiter = IpRateLimiter::new(config).unwrap();
    c.bench_function("ip_limiter_allow_with_port", |b| {
        b.iter(|| black_box(limiter.allow(black_box("192.168.1.20:51234"))));
    });
}

criterion_group!(benches, token_bucket, sliding_window, ip_limiter);
criterion_main!(benches);
