use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{
    cache_storage_key, history_storage_key, CacheEntry, GatewayStore, QuotaReserve, QUOTA_KEY,
};
use crate::error::GatewayError;

/// Atomic read-modify-write for the monthly ledger.
///
/// Runs as a single script so no two replicas can slip an increment past
/// the ceiling. A stored month different from ARGV[1] counts as 0 and is
/// rewritten together with the incremented count. Returns
/// `{granted, count}` with granted in {0, 1}.
const QUOTA_RESERVE_SCRIPT: &str = r#"
local stored_month = redis.call('HGET', KEYS[1], 'month')
local count = 0
if stored_month == ARGV[1] then
    count = tonumber(redis.call('HGET', KEYS[1], 'count') or '0')
end
local ceiling = tonumber(ARGV[2])
if count >= ceiling then
    return {0, count}
end
redis.call('HSET', KEYS[1],
    'month', ARGV[1],
    'count', count + 1,
    'max_calls', ARGV[2],
    'updated_at', ARGV[3])
return {1, count + 1}
"#;

pub struct RedisStore {
    connection: MultiplexedConnection,
    operation_timeout: Duration,
    reserve_script: Script,
}

impl RedisStore {
    /// Connect and hold one multiplexed connection for the process
    /// lifetime; clones share the underlying pipeline.
    pub async fn connect(redis_url: &str) -> Result<Self, GatewayError> {
        let client = Client::open(redis_url).map_err(|e| {
            GatewayError::StoreUnavailable(format!("failed to create Redis client: {}", e))
        })?;

        let connection = timeout(
            Duration::from_secs(5),
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| GatewayError::StoreUnavailable("connection timeout".to_string()))?
        .map_err(|e| GatewayError::StoreUnavailable(format!("failed to connect: {}", e)))?;

        info!(url = redis_url, "Redis store connected");

        Ok(Self {
            connection,
            operation_timeout: Duration::from_secs(5),
            reserve_script: Script::new(QUOTA_RESERVE_SCRIPT),
        })
    }

    async fn run<T, F>(&self, operation: &'static str, fut: F) -> Result<T, GatewayError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match timeout(self.operation_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(operation, error = %e, "Redis operation failed");
                Err(GatewayError::StoreUnavailable(format!(
                    "{}: {}",
                    operation, e
                )))
            }
            Err(_) => {
                warn!(operation, "Redis operation timed out");
                Err(GatewayError::StoreUnavailable(format!(
                    "{}: timeout",
                    operation
                )))
            }
        }
    }
}

#[async_trait]
impl GatewayStore for RedisStore {
    async fn cache_get(&self, key: &str) -> Result<Option<CacheEntry>, GatewayError> {
        let mut conn = self.connection.clone();
        let storage_key = cache_storage_key(key);
        let raw: Option<String> = self.run("cache_get", conn.get(&storage_key)).await?;

        match raw {
            Some(json) => match serde_json::from_str::<CacheEntry>(&json) {
                Ok(entry) => Ok(Some(entry)),
                Err(e) => {
                    // A corrupt envelope is unreadable, not a transport
                    // failure; treat it as absent.
                    warn!(key, error = %e, "discarding unreadable cache entry");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
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
        let json = serde_json::to_string(&entry)?;

        let mut conn = self.connection.clone();
        let storage_key = cache_storage_key(key);
        // SET ... EX lets the store reap the entry itself; readers still
        // re-check expires_at.
        let _: () = self
            .run("cache_put", conn.set_ex(&storage_key, json, ttl_secs))
            .await?;
        debug!(key, ttl_secs, "cached upstream payload");
        Ok(())
    }

    async fn quota_reserve(&self, month: &str, ceiling: u64) -> Result<QuotaReserve, GatewayError> {
        let mut conn = self.connection.clone();
        let now = Utc::now().to_rfc3339();
        let mut invocation = self.reserve_script.key(QUOTA_KEY);
        invocation.arg(month).arg(ceiling).arg(now);

        let (granted, count): (i64, u64) = self
            .run("quota_reserve", invocation.invoke_async(&mut conn))
            .await?;

        if granted == 1 {
            Ok(QuotaReserve::Granted(count))
        } else {
            Ok(QuotaReserve::Exhausted(count))
        }
    }

    async fn quota_usage(&self, month: &str) -> Result<u64, GatewayError> {
        let mut conn = self.connection.clone();
        let fields: (Option<String>, Option<u64>) = self
            .run("quota_usage", conn.hget(QUOTA_KEY, &["month", "count"]))
            .await?;

        match fields {
            (Some(stored_month), Some(count)) if stored_month == month => Ok(count),
            _ => Ok(0),
        }
    }

    async fn history_upsert(
        &self,
        flight_iata: &str,
        flight_date: &str,
        doc: &serde_json::Value,
    ) -> Result<(), GatewayError> {
        let json = serde_json::to_string(doc)?;
        let mut conn = self.connection.clone();
        let storage_key = history_storage_key(flight_iata);
        // One hash field per date gives the (flight_iata, flight_date)
        // key its uniqueness; HSET is the upsert.
        let _: () = self
            .run("history_upsert", conn.hset(&storage_key, flight_date, json))
            .await?;
        Ok(())
    }

    async fn history_query(
        &self,
        flight_iata: &str,
        start_date: &str,
        end_date: &str,
    ) -> Result<Vec<serde_json::Value>, GatewayError> {
        let mut conn = self.connection.clone();
        let storage_key = history_storage_key(flight_iata);
        let all: HashMap<String, String> =
            self.run("history_query", conn.hgetall(&storage_key)).await?;

        // YYYY-MM-DD sorts lexicographically in date order.
        let mut rows: Vec<(String, String)> = all
            .into_iter()
            .filter(|(date, _)| date.as_str() >= start_date && date.as_str() <= end_date)
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));

        let mut docs = Vec::with_capacity(rows.len());
        for (date, json) in rows {
            match serde_json::from_str(&json) {
                Ok(doc) => docs.push(doc),
                Err(e) => {
                    warn!(flight_iata, date, error = %e, "skipping unreadable history row");
                }
            }
        }
        Ok(docs)
    }

    async fn ping(&self) -> Result<(), GatewayError> {
        let mut conn = self.connection.clone();
        let response: String = self
            .run("ping", redis::cmd("PING").query_async(&mut conn))
            .await?;
        if response == "PONG" {
            Ok(())
        } else {
            Err(GatewayError::StoreUnavailable(
                "unexpected ping response".to_string(),
            ))
        }
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
