//! In-memory implementation of the gateway store.
//!
//! Backs local development and tests, and serves as the fallback when no
//! Redis instance is reachable at startup. State is process-local and
//! lost on restart, so replicas running on this backend do not share the
//! cache or the quota ledger.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{Mutex, RwLock};

use super::{CacheEntry, GatewayStore, QuotaReserve};
use crate::error::GatewayError;

#[derive(Debug, Default)]
struct QuotaCell {
    month: String,
    count: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    cache: RwLock<HashMap<String, CacheEntry>>,
    quota: Mutex<QuotaCell>,
    // flight_iata -> flight_date -> snapshot; BTreeMap keeps dates ordered
    history: RwLock<HashMap<String, BTreeMap<String, serde_json::Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GatewayStore for MemoryStore {
    async fn cache_get(&self, key: &str) -> Result<Option<CacheEntry>, GatewayError> {
        let cache = self.cache.read().await;
        Ok(cache.get(key).cloned())
    }

    async fn cache_put(
        &self,
        key: &str,
        data: &serde_json::Value,
        ttl_secs: u64,
    ) -> Result<(), GatewayError> {
        let now = Utc::now().timestamp();
        let entry = CacheEntry {
            data: data.clone(),
            created_at: now,
            expires_at: now + ttl_secs as i64,
        };
        let mut cache = self.cache.write().await;
        cache.insert(key.to_string(), entry);
        Ok(())
    }

    async fn quota_reserve(&self, month: &str, ceiling: u64) -> Result<QuotaReserve, GatewayError> {
        let mut cell = self.quota.lock().await;
        if cell.month != month {
            // Monthly rollover: tag and count reset together
            cell.month = month.to_string();
            cell.count = 0;
        }
        if cell.count >= ceiling {
            return Ok(QuotaReserve::Exhausted(cell.count));
        }
        cell.count += 1;
        Ok(QuotaReserve::Granted(cell.count))
    }

    async fn quota_usage(&self, month: &str) -> Result<u64, GatewayError> {
        let cell = self.quota.lock().await;
        if cell.month == month {
            Ok(cell.count)
        } else {
            Ok(0)
        }
    }

    async fn history_upsert(
        &self,
        flight_iata: &str,
        flight_date: &str,
        doc: &serde_json::Value,
    ) -> Result<(), GatewayError> {
        let mut history = self.history.write().await;
        history
            .entry(flight_iata.to_string())
            .or_default()
            .insert(flight_date.to_string(), doc.clone());
        Ok(())
    }

    async fn history_query(
        &self,
        flight_iata: &str,
        start_date: &str,
        end_date: &str,
    ) -> Result<Vec<serde_json::Value>, GatewayError> {
        let history = self.history.read().await;
        let Some(by_date) = history.get(flight_iata) else {
            return Ok(Vec::new());
        };
        Ok(by_date
            .range(start_date.to_string()..=end_date.to_string())
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    async fn ping(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
