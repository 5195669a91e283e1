//! IP-based limiter with allow/deny lists and background eviction.

use super::window::KeyedWindowTracker;
use super::{validate_duration, Decision, RateLimitConfigError, RateLimiter};
use crate::clock::{Clock, MonotonicClock};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// IP limiter settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IpRateLimiterConfig {
    pub requests_per_window: usize,
    pub window: Duration,
    /// Upper bound on tracked addresses.
    pub max_ips: usize,
    /// Addresses that are always admitted and never tracked.
    pub whitelist: Vec<String>,
    /// Addresses that are always denied.
    pub blacklist: Vec<String>,
    /// Period of the background eviction task.
    pub cleanup_interval: Duration,
}

impl Default for IpRateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 100,
            window: Duration::from_secs(60),
            max_ips: 10_000,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl IpRateLimiterConfig {
    pub fn validate(&self) -> Result<(), RateLimitConfigError> {
        if self.requests_per_window == 0 {
            return Err(RateLimitConfigError::ZeroLimit("default".into()));
        }
        if self.max_ips == 0 {
            return Err(RateLimitConfigError::ZeroMaxKeys);
        }
        validate_duration("window", self.window)?;
        validate_duration("cleanup_interval", self.cleanup_interval)
    }
}

/// Strip a port from `host:port` / `[v6]:port` and canonicalize IP literals.
///
/// Keys that are not addresses are returned trimmed but otherwise untouched.
pub fn normalize_ip(addr: &str) -> String {
    let trimmed = addr.trim();
    if let Ok(sock) = trimmed.parse::<SocketAddr>() {
        return sock.ip().to_string();
    }
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return ip.to_string();
    }
    match trimmed.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host.to_owned(),
        _ => trimmed.to_owned(),
    }
}

#[derive(Debug, Default)]
struct AccessLists {
    whitelist: HashSet<String>,
    blacklist: HashSet<String>,
}

#[derive(Debug)]
struct Shared {
    limit: usize,
    tracker: KeyedWindowTracker,
    lists: RwLock<AccessLists>,
    clock: Arc<dyn Clock>,
}

impl Shared {
    fn evict_stale(&self) -> usize {
        self.tracker.evict_stale(self.clock.now_millis())
    }
}

#[derive(Debug)]
struct CleanupTask {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// Sliding-window limiter keyed by client IP.
///
/// Blacklisted addresses are always denied, whitelisted ones always admitted without
/// tracking. When constructed inside a tokio runtime, a background task evicts idle
/// addresses every `cleanup_interval`; it stops on [`shutdown`](IpRateLimiter::shutdown) or
/// when the limiter is dropped. Share the limiter behind an `Arc`.
#[derive(Debug)]
pub struct IpRateLimiter {
    config: IpRateLimiterConfig,
    shared: Arc<Shared>,
    cleanup: Option<CleanupTask>,
}

impl IpRateLimiter {
    pub fn new(config: IpRateLimiterConfig) -> Result<Self, RateLimitConfigError> {
        Self::with_clock(config, MonotonicClock::default())
    }

    /// Build with a custom clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(
        config: IpRateLimiterConfig,
        clock: C,
    ) -> Result<Self, RateLimitConfigError> {
        config.validate()?;
        let lists = AccessLists {
            whitelist: config.whitelist.iter().map(|ip| normalize_ip(ip)).collect(),
            blacklist: config.blacklist.iter().map(|ip| normalize_ip(ip)).collect(),
        };
        let shared = Arc::new(Shared {
            limit: config.requests_per_window,
            tracker: KeyedWindowTracker::new(config.window).with_max_keys(config.max_ips),
            lists: RwLock::new(lists),
            clock: Arc::new(clock),
        });
        let cleanup = spawn_cleanup(Arc::downgrade(&shared), config.cleanup_interval);
        if cleanup.is_none() {
            tracing::debug!("no tokio runtime; ip limiter eviction runs only via cleanup()");
        }
        Ok(Self { config, shared, cleanup })
    }

    pub fn config(&self) -> &IpRateLimiterConfig {
        &self.config
    }

    /// Evict idle addresses now. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        self.shared.evict_stale()
    }

    /// Stop the background eviction task. Idempotent.
    pub fn shutdown(&self) {
        if let Some(task) = &self.cleanup {
            task.stop.cancel();
        }
    }

    /// Whether the background eviction task is still alive.
    pub fn is_cleanup_running(&self) -> bool {
        self.cleanup.as_ref().is_some_and(|task| !task.handle.is_finished())
    }

    /// Addresses currently tracked, sorted.
    pub fn tracked_ips(&self) -> Vec<String> {
        self.shared.tracker.keys()
    }

    pub fn add_to_blacklist(&self, ip: &str) {
        let ip = normalize_ip(ip);
        self.shared.tracker.remove(&ip);
        self.shared.lists.write().unwrap_or_else(PoisonError::into_inner).blacklist.insert(ip);
    }

    pub fn remove_from_blacklist(&self, ip: &str) -> bool {
        let ip = normalize_ip(ip);
        self.shared.lists.write().unwrap_or_else(PoisonError::into_inner).blacklist.remove(&ip)
    }

    pub fn add_to_whitelist(&self, ip: &str) {
        let ip = normalize_ip(ip);
        self.shared.tracker.remove(&ip);
        self.shared.lists.write().unwrap_or_else(PoisonError::into_inner).whitelist.insert(ip);
    }

    pub fn remove_from_whitelist(&self, ip: &str) -> bool {
        let ip = normalize_ip(ip);
        self.shared.lists.write().unwrap_or_else(PoisonError::into_inner).whitelist.remove(&ip)
    }
}

impl Drop for IpRateLimiter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl RateLimiter for IpRateLimiter {
    fn check(&self, key: &str) -> Decision {
        let ip = normalize_ip(key);
        let limit = self.shared.limit as u64;
        {
            let lists = self.shared.lists.read().unwrap_or_else(PoisonError::into_inner);
            if lists.blacklist.contains(&ip) {
                tracing::warn!(ip = %ip, "blacklisted address denied");
                return Decision::Denied { limit, retry_after: self.config.window };
            }
            if lists.whitelist.contains(&ip) {
                return Decision::unlimited();
            }
        }

        let check = self.shared.tracker.try_record(&ip, self.shared.limit, self.shared.clock.now_millis());
        if check.allowed {
            Decision::Allowed { limit, remaining: limit.saturating_sub(check.count as u64) }
        } else {
            Decision::Denied { limit, retry_after: check.retry_after }
        }
    }
}

fn spawn_cleanup(shared: Weak<Shared>, every: Duration) -> Option<CleanupTask> {
    let runtime = tokio::runtime::Handle::try_current().ok()?;
    let stop = CancellationToken::new();
    let token = stop.clone();
    let handle = runtime.spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(shared) = shared.upgrade() else { break };
                    let evicted = shared.evict_stale();
                    if evicted > 0 {
                        tracing::debug!(evicted, remaining = shared.tracker.len(), "evicted idle addresses");
                    }
                }
            }
        }
        tracing::trace!("ip limiter cleanup stopped");
    });
    Some(CleanupTask { stop, handle })
}
