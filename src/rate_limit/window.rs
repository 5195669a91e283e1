//! Per-key timestamp log shared by the window-based limiters.

use crate::clock::duration_millis;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Outcome of a single [`KeyedWindowTracker::try_record`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCheck {
    /// Whether the timestamp was recorded.
    pub allowed: bool,
    /// Timestamps inside the window after this call.
    pub count: usize,
    /// Time until the oldest tracked timestamp leaves the window (zero when allowed).
    pub retry_after: Duration,
}

/// Sliding-window log keyed by caller identity.
///
/// Each key owns an ordered queue of millisecond timestamps. A check first drops every
/// timestamp older than `now - window`, then admits the call only while fewer than `limit`
/// timestamps remain. One mutex guards the whole map so lookup-or-create never races.
#[derive(Debug)]
pub struct KeyedWindowTracker {
    window: Duration,
    max_keys: Option<usize>,
    entries: Mutex<HashMap<String, VecDeque<u64>>>,
}

impl KeyedWindowTracker {
    pub fn new(window: Duration) -> Self {
        Self { window, max_keys: None, entries: Mutex::new(HashMap::new()) }
    }

    /// Bound the number of tracked keys. When a new key arrives at capacity, stale keys are
    /// evicted first, then the least recently active one.
    pub fn with_max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = Some(max_keys);
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn cutoff(&self, now: u64) -> u64 {
        now.saturating_sub(duration_millis(self.window))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<u64>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a request for `key` at `now` if fewer than `limit` requests fall inside the window.
    pub fn try_record(&self, key: &str, limit: usize, now: u64) -> WindowCheck {
        let cutoff = self.cutoff(now);
        let window_ms = duration_millis(self.window);
        let mut entries = self.lock();

        if !entries.contains_key(key) {
            if let Some(max) = self.max_keys {
                if entries.len() >= max {
                    make_room(&mut entries, cutoff);
                }
            }
        }

        let log = entries.entry(key.to_owned()).or_default();
        while log.front().is_some_and(|&ts| ts < cutoff) {
            log.pop_front();
        }

        if log.len() >= limit {
            let retry_after = log
                .front()
                .map(|&oldest| {
                    Duration::from_millis(
                        oldest.saturating_add(window_ms).saturating_add(1).saturating_sub(now),
                    )
                })
                .unwrap_or(self.window);
            return WindowCheck { allowed: false, count: log.len(), retry_after };
        }

        log.push_back(now);
        WindowCheck { allowed: true, count: log.len(), retry_after: Duration::ZERO }
    }

    /// Requests currently inside the window for `key` (read-only; does not prune).
    pub fn count(&self, key: &str, now: u64) -> usize {
        let cutoff = self.cutoff(now);
        self.lock().get(key).map(|log| log.iter().filter(|&&ts| ts >= cutoff).count()).unwrap_or(0)
    }

    /// Drop every key whose log has no timestamp inside the window. Returns how many were removed.
    pub fn evict_stale(&self, now: u64) -> usize {
        let cutoff = self.cutoff(now);
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, log| log.back().is_some_and(|&ts| ts >= cutoff));
        before - entries.len()
    }

    /// Forget `key` entirely.
    pub fn remove(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Tracked keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

fn make_room(entries: &mut HashMap<String, VecDeque<u64>>, cutoff: u64) {
    let before = entries.len();
    entries.retain(|_, log| log.back().is_some_and(|&ts| ts >= cutoff));
    if entries.len() < before {
        return;
    }
    let victim = entries
        .iter()
        .min_by_key(|(_, log)| log.back().copied().unwrap_or(0))
        .map(|(key, _)| key.clone());
    if let Some(victim) = victim {
        tracing::debug!(key = %victim, "window tracker full; evicting least recently active key");
        entries.remove(&victim);
    }
}
