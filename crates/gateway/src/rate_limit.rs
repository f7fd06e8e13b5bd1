//! Distributed sliding-window admission check.
//!
//! The window state lives behind [`WindowStore`]: an ordered set of request
//! timestamps per client key, self-expiring at twice the window. The default
//! implementation is in-process; a shared store can replace it without
//! touching the admission logic. A store failure admits the request
//! (fail-open) and is surfaced as a warning metric.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Limited { retry_after_secs: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowStoreError {
    pub message: String,
}

impl std::fmt::Display for WindowStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "window store error: {}", self.message)
    }
}

impl std::error::Error for WindowStoreError {}

/// Snapshot of a key's window right after recording the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSample {
    pub count: usize,
    pub oldest_ms: u64,
}

/// Sorted-set-of-timestamps contract: drop entries older than
/// `now - window`, append `now`, report the count and the oldest survivor.
pub trait WindowStore: Send + Sync {
    fn record(&self, key: &str, now_ms: u64, window_ms: u64)
    -> Result<WindowSample, WindowStoreError>;
}

pub struct MemoryWindowStore {
    inner: Mutex<HashMap<String, VecDeque<u64>>>,
    max_keys: usize,
}

impl MemoryWindowStore {
    pub fn new(max_keys: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            max_keys,
        }
    }
}

impl WindowStore for MemoryWindowStore {
    fn record(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<WindowSample, WindowStoreError> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let queue = inner.entry(key.to_string()).or_default();
        let floor = now_ms.saturating_sub(window_ms);
        while let Some(front) = queue.front() {
            if *front <= floor {
                queue.pop_front();
            } else {
                break;
            }
        }
        queue.push_back(now_ms);

        let sample = WindowSample {
            count: queue.len(),
            oldest_ms: *queue.front().unwrap_or(&now_ms),
        };

        // Idle keys expire at twice the window.
        let ttl_floor = now_ms.saturating_sub(window_ms.saturating_mul(2));
        inner.retain(|_, events| events.back().is_some_and(|latest| *latest > ttl_floor));

        // Over the key budget: shed the least recently active clients,
        // never the one just recorded.
        if inner.len() > self.max_keys {
            let excess = inner.len() - self.max_keys;
            let mut by_last_seen: Vec<(String, u64)> = inner
                .iter()
                .filter(|(other, _)| other.as_str() != key)
                .map(|(other, events)| (other.clone(), events.back().copied().unwrap_or(0)))
                .collect();
            by_last_seen.sort_by_key(|(_, last_seen)| *last_seen);
            for (stale_key, _) in by_last_seen.into_iter().take(excess) {
                inner.remove(&stale_key);
            }
        }

        Ok(sample)
    }
}

#[derive(Clone)]
pub struct SlidingWindowLimiter {
    store: Arc<dyn WindowStore>,
    window: Duration,
    capacity: u32,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn WindowStore>, window: Duration, capacity: u32) -> Self {
        Self {
            store,
            window,
            capacity,
        }
    }

    pub fn check(&self, key: &str) -> Admission {
        let now_ms = unix_epoch_ms_now();
        let window_ms = self.window.as_millis() as u64;

        match self.store.record(key, now_ms, window_ms) {
            Ok(sample) => {
                if sample.count as u32 > self.capacity {
                    let oldest_age = now_ms.saturating_sub(sample.oldest_ms);
                    let remaining_ms = window_ms.saturating_sub(oldest_age);
                    Admission::Limited {
                        retry_after_secs: remaining_ms.div_ceil(1000).max(1),
                    }
                } else {
                    Admission::Allowed
                }
            }
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "gateway.rate_limiter_fail_open");
                metrics::inc_rate_limiter_fail_open();
                Admission::Allowed
            }
        }
    }
}

pub fn unix_epoch_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis()
        .min(u64::MAX as u128) as u64
}
