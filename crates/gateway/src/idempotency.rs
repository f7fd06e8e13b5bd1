//! Short-TTL replay cache for mutating calls.
//!
//! Keyed by the client-supplied `Idempotency-Key` header; the value is the
//! first successful response body, returned verbatim on replay so repeated
//! submissions have exactly one side effect. Process-local, but nothing in
//! the contract assumes that: a shared store can be substituted without
//! behavioral change.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct IdempotencyCache {
    entries: Arc<RwLock<HashMap<String, CachedResponse>>>,
    max_entries: usize,
    ttl: Duration,
}

#[derive(Clone)]
struct CachedResponse {
    body: Bytes,
    expires_at: Instant,
}

impl IdempotencyCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            max_entries,
            ttl,
        }
    }

    pub fn enabled(&self) -> bool {
        self.max_entries > 0 && !self.ttl.is_zero()
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        if !self.enabled() {
            return None;
        }

        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.body.clone())
    }

    pub async fn put(&self, key: String, body: Bytes) {
        if !self.enabled() {
            return;
        }

        let now = Instant::now();
        let mut entries = self.entries.write().await;

        entries.retain(|_, entry| entry.expires_at > now);
        entries.insert(
            key,
            CachedResponse {
                body,
                expires_at: now + self.ttl,
            },
        );

        // Every entry shares one TTL, so the soonest-expiring entry is also
        // the oldest; shed those first when over capacity.
        while entries.len() > self.max_entries {
            let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            entries.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replay_returns_the_first_body_verbatim() {
        let cache = IdempotencyCache::new(8, Duration::from_secs(60));
        cache
            .put(
                "key1".to_string(),
                Bytes::from_static(b"{\"status\":\"FROZEN\"}"),
            )
            .await;

        let replay = cache.get("key1").await.expect("hit expected");
        assert_eq!(replay.as_ref(), b"{\"status\":\"FROZEN\"}");
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = IdempotencyCache::new(8, Duration::from_millis(10));
        cache.put("key1".to_string(), Bytes::from_static(b"x")).await;
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(cache.get("key1").await.is_none());
    }

    #[tokio::test]
    async fn zero_capacity_disables_the_cache() {
        let cache = IdempotencyCache::new(0, Duration::from_secs(60));
        cache.put("key1".to_string(), Bytes::from_static(b"x")).await;
        assert!(cache.get("key1").await.is_none());
    }

    #[tokio::test]
    async fn overflow_sheds_the_oldest_entries_first() {
        let cache = IdempotencyCache::new(2, Duration::from_secs(60));
        cache.put("old1".to_string(), Bytes::from_static(b"a")).await;
        cache.put("old2".to_string(), Bytes::from_static(b"b")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.put("new".to_string(), Bytes::from_static(b"c")).await;

        let live = cache.entries.read().await.len();
        assert!(live <= 2, "expected at most 2 entries, found {live}");
        assert!(
            cache.get("new").await.is_some(),
            "the newest entry must survive eviction"
        );
    }
}
