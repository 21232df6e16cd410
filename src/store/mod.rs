//! Durable key-value store adapter.
//!
//! Three logical collections back the traffic-shaping middleware:
//! the response cache, the monthly quota ledger, and the flight history
//! side-collection. `RedisStore` is the shared durable backend; every
//! gateway replica points at the same instance so the cache and the
//! ledger are replica-wide. `MemoryStore` implements the same trait in
//! process memory for local development and tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Ledger key shared by every replica; fixed to match the provider plan
/// the counter tracks.
pub const QUOTA_KEY: &str = "aviationstack_api_calls";

/// Key prefix for cache entries.
pub const CACHE_KEY_PREFIX: &str = "gateway_cache";

/// Key prefix for per-flight history hashes.
pub const HISTORY_KEY_PREFIX: &str = "flight_history";

/// A cached upstream payload with its lifecycle timestamps.
///
/// `expires_at` is authoritative: readers must treat an entry whose
/// expiry has passed as absent even if the store has not reaped it yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: serde_json::Value,
    pub created_at: i64,
    pub expires_at: i64,
}

/// Outcome of an atomic quota reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaReserve {
    /// Reservation granted; carries the count after the increment
    Granted(u64),
    /// Ceiling reached; carries the unchanged count
    Exhausted(u64),
}

/// Typed access to the three collections.
///
/// Every operation maps transport and timeout failures to
/// `GatewayError::StoreUnavailable`; callers surface that without
/// mutating any counter.
#[async_trait]
pub trait GatewayStore: Send + Sync {
    /// Read a cache entry. Returns the raw entry; expiry policy is the
    /// cache layer's concern.
    async fn cache_get(&self, key: &str) -> Result<Option<CacheEntry>, GatewayError>;

    /// Upsert a cache entry with expiry `now + ttl_secs`.
    async fn cache_put(
        &self,
        key: &str,
        data: &serde_json::Value,
        ttl_secs: u64,
    ) -> Result<(), GatewayError>;

    /// Atomically reserve one call against the monthly ledger.
    ///
    /// A stored month tag different from `month` reads as count 0, and a
    /// granted reservation rewrites the tag and count in the same
    /// operation. No interleaving of two reservations may push the count
    /// past `ceiling`.
    async fn quota_reserve(&self, month: &str, ceiling: u64) -> Result<QuotaReserve, GatewayError>;

    /// Read the ledger count for `month`; a different stored tag reads as 0.
    async fn quota_usage(&self, month: &str) -> Result<u64, GatewayError>;

    /// Upsert one flight snapshot keyed by `(flight_iata, flight_date)`.
    async fn history_upsert(
        &self,
        flight_iata: &str,
        flight_date: &str,
        doc: &serde_json::Value,
    ) -> Result<(), GatewayError>;

    /// Snapshots for one flight within `[start_date, end_date]`, ordered
    /// by date ascending.
    async fn history_query(
        &self,
        flight_iata: &str,
        start_date: &str,
        end_date: &str,
    ) -> Result<Vec<serde_json::Value>, GatewayError>;

    /// Connectivity probe for /health.
    async fn ping(&self) -> Result<(), GatewayError>;

    /// Whether state survives a process restart.
    fn is_durable(&self) -> bool;

    fn backend_name(&self) -> &'static str;
}

/// Redis key for a cache entry.
pub(crate) fn cache_storage_key(key: &str) -> String {
    format!("{}:{}", CACHE_KEY_PREFIX, key)
}

/// Redis key for a flight's history hash.
pub(crate) fn history_storage_key(flight_iata: &str) -> String {
    format!("{}:{}", HISTORY_KEY_PREFIX, flight_iata)
}
