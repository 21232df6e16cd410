//! Upstream caller: one entry point wrapping every call to the provider
//! in the full middleware stack, in fixed order.
//!
//! cache lookup -> breaker admission -> coalescer join-or-lead ->
//! (leader only) quota reservation -> HTTP GET -> breaker outcome ->
//! cache store.
//!
//! The ordering carries the guarantees: a cache hit spends no quota and
//! never consults the breaker, an open breaker spends no quota, and
//! coalesced followers inherit the leader's outcome so N simultaneous
//! identical requests cost one quota unit.

use reqwest::StatusCode;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::breaker::CircuitBreaker;
use crate::cache::{cache_key, ResponseCache};
use crate::coalescer::RequestCoalescer;
use crate::config::Config;
use crate::error::GatewayError;
use crate::metrics;
use crate::quota::QuotaLedger;
use crate::store::GatewayStore;

#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    store: Arc<dyn GatewayStore>,
    cache: Arc<ResponseCache>,
    quota: Arc<QuotaLedger>,
    breaker: Arc<CircuitBreaker>,
    coalescer: Arc<RequestCoalescer>,
}

impl UpstreamClient {
    pub fn new(
        config: &Config,
        store: Arc<dyn GatewayStore>,
        cache: Arc<ResponseCache>,
        quota: Arc<QuotaLedger>,
        breaker: Arc<CircuitBreaker>,
        coalescer: Arc<RequestCoalescer>,
    ) -> Result<Self, GatewayError> {
        // One pooled client for the process lifetime; per-call client
        // construction would defeat connection reuse on the hot path.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.upstream_timeout_secs))
            .pool_max_idle_per_host(20)
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.upstream_base_url.clone(),
            api_key: config.api_key.clone(),
            store,
            cache,
            quota,
            breaker,
            coalescer,
        })
    }

    /// Proxy one call to the provider through the middleware stack.
    pub async fn call(
        &self,
        endpoint: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Value, GatewayError> {
        let key = cache_key(endpoint, params);

        // Cache precedes everything: a hit spends no quota and bypasses
        // the breaker because the upstream is not asked.
        if let Some(payload) = self.cache.get(&key).await? {
            metrics::CACHE_HITS.with_label_values(&[endpoint]).inc();
            debug!(cache_key = %key, "serving from cache");
            return Ok(payload);
        }
        metrics::CACHE_MISSES.with_label_values(&[endpoint]).inc();

        if !self.breaker.can_execute() {
            let retry_after = self.breaker.reset_time().map(|t| t.to_rfc3339());
            warn!(
                cache_key = %key,
                breaker_state = %self.breaker.state(),
                "circuit open, shedding request"
            );
            return Err(GatewayError::BreakerOpen { retry_after });
        }

        let outcome = self
            .coalescer
            .execute(&key, {
                let client = self.clone();
                let endpoint = endpoint.to_string();
                let params = params.clone();
                let key = key.clone();
                move || async move { client.fetch_upstream(&endpoint, &params, &key).await }
            })
            .await;

        if outcome.coalesced {
            metrics::COALESCED_REQUESTS
                .with_label_values(&[endpoint])
                .inc();
        }
        outcome.result
    }

    /// Leader path: reserve quota, issue the HTTP call, record the
    /// breaker outcome and cache the payload. Followers never get here.
    async fn fetch_upstream(
        &self,
        endpoint: &str,
        params: &BTreeMap<String, String>,
        cache_key: &str,
    ) -> Result<Value, GatewayError> {
        match self.quota.reserve().await {
            Ok(count) => debug!(count, "quota reserved"),
            Err(err @ GatewayError::QuotaExceeded { .. }) => {
                // Policy refusal, not an upstream failure: the breaker is
                // not consulted and nothing is cached
                metrics::API_CALLS
                    .with_label_values(&[endpoint, "rate_limited"])
                    .inc();
                warn!(
                    cache_key,
                    breaker_state = %self.breaker.state(),
                    "request refused, monthly quota exhausted"
                );
                return Err(err);
            }
            // Store failure: surface without touching any counter
            Err(err) => return Err(err),
        }

        let url = format!("{}/{}", self.base_url, endpoint);
        let mut query: Vec<(&str, &str)> = params
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        query.push(("access_key", self.api_key.as_str()));

        info!(endpoint, cache_key, "calling upstream");

        let response = match self.http.get(&url).query(&query).send().await {
            Ok(response) => response,
            Err(e) => {
                return Err(self.upstream_failure(
                    endpoint,
                    cache_key,
                    "error",
                    GatewayError::UpstreamTransient(format!("request failed: {}", e)),
                ));
            }
        };

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(self.upstream_failure(
                endpoint,
                cache_key,
                "rate_limited",
                GatewayError::UpstreamRateLimited(body),
            ));
        }

        if status.is_server_error() {
            return Err(self.upstream_failure(
                endpoint,
                cache_key,
                "error",
                GatewayError::UpstreamTransient(format!("upstream returned {}", status)),
            ));
        }

        if status.is_client_error() {
            // The caller's input was rejected; the upstream itself is
            // healthy, so the breaker is left alone and the response is
            // passed through verbatim
            let body = response.text().await.unwrap_or_default();
            metrics::API_CALLS
                .with_label_values(&[endpoint, "error"])
                .inc();
            debug!(endpoint, status = status.as_u16(), "upstream rejected request");
            return Err(GatewayError::UpstreamClient {
                status: status.as_u16(),
                body,
            });
        }

        let payload: Value = match response.json().await {
            Ok(payload) => payload,
            Err(e) => {
                return Err(self.upstream_failure(
                    endpoint,
                    cache_key,
                    "error",
                    GatewayError::UpstreamTransient(format!("malformed upstream body: {}", e)),
                ));
            }
        };

        if let Some(envelope) = payload.get("error") {
            return Err(self.upstream_failure(
                endpoint,
                cache_key,
                "error",
                GatewayError::UpstreamEnvelope(envelope.clone()),
            ));
        }

        self.breaker.record_success();
        metrics::API_CALLS
            .with_label_values(&[endpoint, "success"])
            .inc();

        let result_count = payload
            .get("data")
            .and_then(Value::as_array)
            .map(|rows| rows.len())
            .unwrap_or(0);
        info!(endpoint, result_count, "upstream call succeeded");

        if endpoint == "flights" {
            self.store_flight_history(&payload).await;
        }

        // The quota is genuinely spent and the payload is in hand, so a
        // failed cache write must not fail the call
        if let Err(e) = self.cache.put(cache_key, &payload).await {
            warn!(cache_key, error = %e, "failed to cache upstream payload");
        }

        Ok(payload)
    }

    fn upstream_failure(
        &self,
        endpoint: &str,
        cache_key: &str,
        status_label: &str,
        err: GatewayError,
    ) -> GatewayError {
        self.breaker.record_failure();
        metrics::API_CALLS
            .with_label_values(&[endpoint, status_label])
            .inc();
        error!(
            endpoint,
            cache_key,
            breaker_state = %self.breaker.state(),
            error = %err,
            "upstream call failed"
        );
        err
    }

    /// Write-through of flight snapshots keyed by (flight_iata,
    /// flight_date); the history endpoint reads them back later.
    /// Best effort: a write failure is logged, never surfaced.
    async fn store_flight_history(&self, payload: &Value) {
        let Some(rows) = payload.get("data").and_then(Value::as_array) else {
            return;
        };
        for row in rows {
            let iata = row
                .pointer("/flight/iata")
                .and_then(Value::as_str)
                .map(str::to_uppercase);
            let date = row.get("flight_date").and_then(Value::as_str);
            if let (Some(iata), Some(date)) = (iata, date) {
                if let Err(e) = self.store.history_upsert(&iata, date, row).await {
                    warn!(flight_iata = %iata, flight_date = date, error = %e,
                        "failed to record flight history");
                }
            }
        }
    }
}
