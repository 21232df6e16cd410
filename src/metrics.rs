//! Prometheus metrics for the gateway.
//!
//! Centralises every series tied to upstream traffic shaping:
//! cache hits/misses, upstream calls by outcome, coalesced requests,
//! circuit breaker state and the monthly quota gauges.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Cache hits per proxied endpoint
    pub static ref CACHE_HITS: IntCounterVec = IntCounterVec::new(
        Opts::new("gateway_cache_hits_total", "Responses served from the cache"),
        &["endpoint"]
    )
    .expect("metric creation failed");

    /// Cache misses per proxied endpoint
    pub static ref CACHE_MISSES: IntCounterVec = IntCounterVec::new(
        Opts::new("gateway_cache_misses_total", "Cache lookups that required an upstream call"),
        &["endpoint"]
    )
    .expect("metric creation failed");

    /// Upstream calls by endpoint and outcome (success, error, rate_limited)
    pub static ref API_CALLS: IntCounterVec = IntCounterVec::new(
        Opts::new("gateway_api_calls_total", "Calls issued against the Aviationstack API"),
        &["endpoint", "status"]
    )
    .expect("metric creation failed");

    /// Requests merged into an already in-flight identical call
    pub static ref COALESCED_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("gateway_coalesced_requests_total", "Requests coalesced with an in-flight call"),
        &["endpoint"]
    )
    .expect("metric creation failed");

    /// Circuit breaker state (0=closed, 1=half_open, 2=open)
    pub static ref CIRCUIT_BREAKER_STATE: IntGauge = IntGauge::new(
        "gateway_circuit_breaker_state",
        "Circuit breaker state (0=closed, 1=half_open, 2=open)"
    )
    .expect("metric creation failed");

    /// API calls spent this month
    pub static ref RATE_LIMIT_USED: IntGauge = IntGauge::new(
        "gateway_rate_limit_used",
        "API calls used in the current month"
    )
    .expect("metric creation failed");

    /// API calls remaining this month
    pub static ref RATE_LIMIT_REMAINING: IntGauge = IntGauge::new(
        "gateway_rate_limit_remaining",
        "API calls remaining in the current month"
    )
    .expect("metric creation failed");

    /// Inbound request duration per handler
    pub static ref HTTP_REQUEST_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "gateway_http_request_duration_seconds",
            "Inbound request duration"
        ),
        &["handler"]
    )
    .expect("metric creation failed");

    /// Inbound requests currently being served
    pub static ref HTTP_REQUESTS_IN_FLIGHT: IntGauge = IntGauge::new(
        "gateway_http_requests_in_flight",
        "Inbound requests currently being served"
    )
    .expect("metric creation failed");
}

/// Register every series with the gateway registry.
///
/// Safe to call more than once; duplicate registrations are ignored so
/// tests can build multiple servers in one process.
pub fn register_metrics() {
    let _ = REGISTRY.register(Box::new(CACHE_HITS.clone()));
    let _ = REGISTRY.register(Box::new(CACHE_MISSES.clone()));
    let _ = REGISTRY.register(Box::new(API_CALLS.clone()));
    let _ = REGISTRY.register(Box::new(COALESCED_REQUESTS.clone()));
    let _ = REGISTRY.register(Box::new(CIRCUIT_BREAKER_STATE.clone()));
    let _ = REGISTRY.register(Box::new(RATE_LIMIT_USED.clone()));
    let _ = REGISTRY.register(Box::new(RATE_LIMIT_REMAINING.clone()));
    let _ = REGISTRY.register(Box::new(HTTP_REQUEST_DURATION.clone()));
    let _ = REGISTRY.register(Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()));
}

/// Render the registry in the Prometheus text exposition format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
