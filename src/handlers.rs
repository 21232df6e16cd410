//! HTTP request handlers.
//!
//! The router is intentionally thin: proxy handlers validate parameter
//! shape, hand the normalised set to the upstream caller and forward the
//! payload. Operational handlers snapshot component state. Every
//! gateway-originated failure is JSON; see `response.rs` for the
//! translation.

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::cache::ResponseCache;
use crate::coalescer::RequestCoalescer;
use crate::config::Config;
use crate::error::GatewayError;
use crate::metrics;
use crate::quota::QuotaLedger;
use crate::store::GatewayStore;
use crate::upstream::UpstreamClient;
use crate::validation::RequestValidator;

/// Shared application state; every field is internally synchronised, so
/// handlers borrow it immutably.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn GatewayStore>,
    pub cache: Arc<ResponseCache>,
    pub quota: Arc<QuotaLedger>,
    pub breaker: Arc<CircuitBreaker>,
    pub coalescer: Arc<RequestCoalescer>,
    pub upstream: UpstreamClient,
}

pub type SharedState = Arc<AppState>;

/// Query parameters are taken as raw strings so that malformed values
/// produce the gateway's own JSON validation errors rather than the
/// extractor's plain-text rejection.
#[derive(Debug, Deserialize)]
pub struct AirportsQuery {
    pub iata_code: Option<String>,
    pub search: Option<String>,
    pub country_iso2: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FlightsQuery {
    pub flight_iata: Option<String>,
    pub dep_iata: Option<String>,
    pub arr_iata: Option<String>,
    pub airline_iata: Option<String>,
    pub flight_status: Option<String>,
    pub flight_date: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub flight_iata: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

pub async fn root() -> impl IntoResponse {
    Json(json!({"service": "Aviationstack Gateway", "status": "running"}))
}

/// Proxies airport lookups to the provider's /airports endpoint.
///
/// Parameters are validated structurally, normalised and handed to the
/// middleware stack (cache, breaker, coalescer, quota); the upstream
/// JSON body is forwarded untouched.
///
/// # Query Parameters
///
/// | Parameter      | Description                                   |
/// |----------------|-----------------------------------------------|
/// | `iata_code`    | Airport IATA code, uppercased (e.g. `CDG`)    |
/// | `search`       | Free-text airport name search                 |
/// | `country_iso2` | Two-letter country code, uppercased           |
/// | `limit`        | Page size, clamped to [1, 100] (default 100)  |
///
/// # Request
///
/// ```text
/// GET /airports?iata_code=cdg&limit=10
/// ```
///
/// # Response (200 OK)
///
/// ```json
/// {"data": [{"iata_code": "CDG", "airport_name": "Charles de Gaulle"}]}
/// ```
///
/// A repeat of the same parameter set within the TTL window is served
/// from the cache without spending quota.
///
/// # Errors
///
/// - `400 Bad Request` - malformed parameter, or an upstream error envelope
/// - `429 Too Many Requests` - monthly quota exhausted
/// - `502 Bad Gateway` - upstream transport failure, 5xx or 429
/// - `503 Service Unavailable` - circuit breaker open or store unreachable
///
/// Upstream 4xx responses other than 429 are passed through verbatim.
pub async fn get_airports(
    State(state): State<SharedState>,
    Query(query): Query<AirportsQuery>,
) -> Result<impl IntoResponse, GatewayError> {
    let mut params = BTreeMap::new();
    params.insert(
        "limit".to_string(),
        RequestValidator::parse_limit(query.limit.as_deref())?.to_string(),
    );
    if let Some(code) = &query.iata_code {
        params.insert(
            "iata_code".to_string(),
            RequestValidator::normalize_iata("iata_code", code)?,
        );
    }
    if let Some(search) = &query.search {
        let trimmed = search.trim();
        if trimmed.is_empty() {
            return Err(GatewayError::Validation(
                "search must not be empty".to_string(),
            ));
        }
        params.insert("search".to_string(), trimmed.to_string());
    }
    if let Some(country) = &query.country_iso2 {
        params.insert(
            "country_iso2".to_string(),
            RequestValidator::normalize_country(country)?,
        );
    }

    let payload = state.upstream.call("airports", &params).await?;
    Ok(Json(payload))
}

/// Proxies flight lookups to the provider's /flights endpoint.
///
/// IATA-style codes are uppercased and `flight_status` lowercased
/// before the parameter set is canonicalised, so equivalent requests
/// share one cache entry and one in-flight call. Every flight row in a
/// successful response that carries both `flight.iata` and
/// `flight_date` is also upserted into the history collection read by
/// [`get_flight_history`].
///
/// # Query Parameters
///
/// | Parameter       | Description                                  |
/// |-----------------|----------------------------------------------|
/// | `flight_iata`   | Flight number (e.g. `AF447`)                 |
/// | `dep_iata`      | Departure airport IATA code                  |
/// | `arr_iata`      | Arrival airport IATA code                    |
/// | `airline_iata`  | Airline IATA code                            |
/// | `flight_status` | Status keyword, lowercased (e.g. `active`)   |
/// | `flight_date`   | Strict `YYYY-MM-DD` date                     |
/// | `limit`         | Page size, clamped to [1, 100] (default 100) |
///
/// # Request
///
/// ```text
/// GET /flights?flight_iata=af447&flight_date=2025-11-13
/// ```
///
/// # Response (200 OK)
///
/// ```json
/// {"data": [{"flight_date": "2025-11-13", "flight_status": "active",
///            "flight": {"iata": "AF447"}}]}
/// ```
///
/// # Errors
///
/// - `400 Bad Request` - malformed parameter, or an upstream error envelope
/// - `429 Too Many Requests` - monthly quota exhausted
/// - `502 Bad Gateway` - upstream transport failure, 5xx or 429
/// - `503 Service Unavailable` - circuit breaker open or store unreachable
pub async fn get_flights(
    State(state): State<SharedState>,
    Query(query): Query<FlightsQuery>,
) -> Result<impl IntoResponse, GatewayError> {
    let mut params = BTreeMap::new();
    params.insert(
        "limit".to_string(),
        RequestValidator::parse_limit(query.limit.as_deref())?.to_string(),
    );
    for (name, value) in [
        ("flight_iata", &query.flight_iata),
        ("dep_iata", &query.dep_iata),
        ("arr_iata", &query.arr_iata),
        ("airline_iata", &query.airline_iata),
    ] {
        if let Some(value) = value {
            params.insert(
                name.to_string(),
                RequestValidator::normalize_iata(name, value)?,
            );
        }
    }
    if let Some(status) = &query.flight_status {
        params.insert(
            "flight_status".to_string(),
            RequestValidator::normalize_status(status)?,
        );
    }
    if let Some(date) = &query.flight_date {
        RequestValidator::validate_date("flight_date", date)?;
        params.insert("flight_date".to_string(), date.clone());
    }

    let payload = state.upstream.call("flights", &params).await?;
    Ok(Json(payload))
}

/// Returns accumulated snapshots for one flight from the history
/// collection.
///
/// Successful /flights calls write one snapshot per
/// `(flight_iata, flight_date)`; this endpoint reads them back ordered
/// by date, inclusive of both bounds. No upstream call is made and no
/// quota is spent, so an empty result simply means the flight has not
/// been looked up during the requested period.
///
/// # Query Parameters
///
/// | Parameter     | Description                                |
/// |---------------|--------------------------------------------|
/// | `flight_iata` | Flight number, required (e.g. `AF447`)     |
/// | `start_date`  | Start of the period, required `YYYY-MM-DD` |
/// | `end_date`    | End of the period, required `YYYY-MM-DD`   |
///
/// # Request
///
/// ```text
/// GET /flights/history?flight_iata=AF447&start_date=2025-11-01&end_date=2025-11-30
/// ```
///
/// # Response (200 OK)
///
/// ```json
/// {"flight_iata": "AF447", "start_date": "2025-11-01",
///  "end_date": "2025-11-30", "count": 1, "data": [{"...": "..."}]}
/// ```
///
/// # Errors
///
/// - `400 Bad Request` - missing or malformed parameters, or start after end
/// - `503 Service Unavailable` - store unreachable
pub async fn get_flight_history(
    State(state): State<SharedState>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, GatewayError> {
    let flight_iata = query
        .flight_iata
        .as_deref()
        .ok_or_else(|| GatewayError::Validation("flight_iata is required".to_string()))?;
    let flight_iata = RequestValidator::normalize_iata("flight_iata", flight_iata)?;

    let start_date = query
        .start_date
        .as_deref()
        .ok_or_else(|| GatewayError::Validation("start_date is required".to_string()))?;
    let end_date = query
        .end_date
        .as_deref()
        .ok_or_else(|| GatewayError::Validation("end_date is required".to_string()))?;
    RequestValidator::validate_date_range(start_date, end_date)?;

    let rows = state
        .store
        .history_query(&flight_iata, start_date, end_date)
        .await?;

    Ok(Json(json!({
        "flight_iata": flight_iata,
        "start_date": start_date,
        "end_date": end_date,
        "count": rows.len(),
        "data": rows,
    })))
}

/// Liveness snapshot: overall status, quota, cache flag, breaker state.
pub async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    let rate_limit = match state.quota.usage().await {
        Ok(usage) => json!(usage),
        Err(e) => json!({"error": e.to_string()}),
    };
    metrics::CIRCUIT_BREAKER_STATE.set(state.breaker.state_code());

    let status = if state.breaker.state() == CircuitState::Open {
        "degraded"
    } else {
        "healthy"
    };

    Json(json!({
        "status": status,
        "rate_limit": rate_limit,
        "cache": "enabled",
        "circuit_breaker": state.breaker.state().as_str(),
    }))
}

/// Full per-component statistics.
pub async fn stats(State(state): State<SharedState>) -> impl IntoResponse {
    let rate_limit = match state.quota.usage().await {
        Ok(usage) => json!(usage),
        Err(e) => json!({"error": e.to_string()}),
    };
    metrics::CIRCUIT_BREAKER_STATE.set(state.breaker.state_code());

    Json(json!({
        "rate_limit": rate_limit,
        "circuit_breaker": state.breaker.stats(),
        "request_coalescer": state.coalescer.stats(),
        "cache": state.cache.stats(),
        "store": {
            "backend": state.store.backend_name(),
            "durable": state.store.is_durable(),
        },
    }))
}

/// Quota usage alone.
pub async fn usage(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, GatewayError> {
    let usage = state.quota.usage().await?;
    Ok(Json(usage))
}

/// Prometheus text exposition.
pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}
