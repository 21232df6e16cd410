//! TTL cache for upstream payloads, backed by the shared store.
//!
//! Only successful upstream responses are cached; quota refusals, shed
//! requests and upstream failures never produce an entry.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use serde::Serialize;
use tracing::debug;

use crate::error::GatewayError;
use crate::store::GatewayStore;

/// Canonical cache key for an upstream call: `"{endpoint}:{k=v&...}"`
/// over the parameters sorted by name. Insertion order cannot influence
/// the key, so identical parameter sets always collide.
pub fn cache_key(endpoint: &str, params: &BTreeMap<String, String>) -> String {
    let query: Vec<String> = params
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect();
    format!("{}:{}", endpoint, query.join("&"))
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    pub hit_rate: String,
}

pub struct ResponseCache {
    store: Arc<dyn GatewayStore>,
    ttl_secs: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn GatewayStore>, ttl_secs: u64) -> Self {
        Self {
            store,
            ttl_secs,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a payload. An entry whose stored expiry has passed counts
    /// as a miss even if the store has not reaped it yet.
    pub async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, GatewayError> {
        let entry = self.store.cache_get(key).await?;

        match entry {
            Some(entry) if entry.expires_at > Utc::now().timestamp() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key, "cache hit");
                Ok(Some(entry.data))
            }
            Some(_) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key, "cache entry expired");
                Ok(None)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Unconditionally replace the entry for `key` with expiry now + TTL.
    pub async fn put(&self, key: &str, data: &serde_json::Value) -> Result<(), GatewayError> {
        self.store.cache_put(key, data, self.ttl_secs).await
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        };
        CacheStats {
            enabled: true,
            ttl_seconds: self.ttl_secs,
            hits,
            misses,
            total_requests: total,
            hit_rate: format!("{}%", hit_rate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_cache_key_is_order_independent() {
        let a = params(&[("iata_code", "CDG"), ("limit", "10")]);
        let b = params(&[("limit", "10"), ("iata_code", "CDG")]);
        assert_eq!(cache_key("airports", &a), cache_key("airports", &b));
        assert_eq!(cache_key("airports", &a), "airports:iata_code=CDG&limit=10");
    }

    #[test]
    fn test_cache_key_distinguishes_endpoints() {
        let p = params(&[("limit", "100")]);
        assert_ne!(cache_key("airports", &p), cache_key("flights", &p));
    }

    #[tokio::test]
    async fn test_get_put_roundtrip_counts_hit() {
        let cache = ResponseCache::new(Arc::new(MemoryStore::new()), 300);
        let payload = json!({"data": []});

        assert!(cache.get("k").await.unwrap().is_none());
        cache.put("k", &payload).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(payload));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, "50%");
    }

    #[tokio::test]
    async fn test_expired_entry_reads_as_miss() {
        let store = Arc::new(MemoryStore::new());
        let cache = ResponseCache::new(store.clone(), 300);

        // Entry whose expiry is already in the past
        store
            .cache_put("stale", &json!({"data": []}), 0)
            .await
            .unwrap();

        assert!(cache.get("stale").await.unwrap().is_none());
        assert_eq!(cache.stats().misses, 1);
    }
}
