//! End-to-end tests over the memory store and a local stub upstream.

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tower::ServiceExt;

use aerogate::breaker::{CircuitBreaker, CircuitState};
use aerogate::cache::ResponseCache;
use aerogate::coalescer::RequestCoalescer;
use aerogate::config::Config;
use aerogate::error::GatewayError;
use aerogate::handlers::{AppState, SharedState};
use aerogate::quota::{month_tag, QuotaLedger};
use aerogate::server::build_router;
use aerogate::store::{GatewayStore, MemoryStore};
use aerogate::upstream::UpstreamClient;

#[derive(Clone)]
struct StubState {
    hits: Arc<AtomicU64>,
    delay_ms: u64,
    fail_status: u16,
    fail_body: String,
    fail_remaining: Arc<AtomicI64>,
    body: Value,
}

async fn stub_handler(State(stub): State<StubState>) -> axum::response::Response {
    stub.hits.fetch_add(1, Ordering::SeqCst);
    if stub.delay_ms > 0 {
        sleep(Duration::from_millis(stub.delay_ms)).await;
    }
    if stub.fail_remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
        return (
            StatusCode::from_u16(stub.fail_status).unwrap(),
            stub.fail_body.clone(),
        )
            .into_response();
    }
    Json(stub.body.clone()).into_response()
}

struct StubUpstream {
    base_url: String,
    hits: Arc<AtomicU64>,
}

struct StubOptions {
    delay_ms: u64,
    fail_status: u16,
    fail_body: String,
    fail_count: i64,
    body: Value,
}

impl Default for StubOptions {
    fn default() -> Self {
        Self {
            delay_ms: 0,
            fail_status: 500,
            fail_body: "upstream down".to_string(),
            fail_count: 0,
            body: json!({
                "data": [
                    {
                        "flight_date": "2025-11-13",
                        "flight_status": "active",
                        "flight": {"iata": "AF447"},
                        "iata_code": "CDG"
                    }
                ]
            }),
        }
    }
}

async fn spawn_upstream(options: StubOptions) -> StubUpstream {
    let hits = Arc::new(AtomicU64::new(0));
    let stub = StubState {
        hits: hits.clone(),
        delay_ms: options.delay_ms,
        fail_status: options.fail_status,
        fail_body: options.fail_body,
        fail_remaining: Arc::new(AtomicI64::new(options.fail_count)),
        body: options.body,
    };
    let app = Router::new()
        .route("/v1/airports", get(stub_handler))
        .route("/v1/flights", get(stub_handler))
        .with_state(stub);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    StubUpstream {
        base_url: format!("http://{}/v1", addr),
        hits,
    }
}

struct TestGateway {
    state: SharedState,
    store: Arc<MemoryStore>,
}

fn build_gateway(upstream: &StubUpstream, config_overrides: Config) -> TestGateway {
    aerogate::metrics::register_metrics();

    let config = Config {
        api_key: "test-key".to_string(),
        upstream_base_url: upstream.base_url.clone(),
        ..config_overrides
    };

    let store = Arc::new(MemoryStore::new());
    let store_dyn: Arc<dyn GatewayStore> = store.clone();
    let cache = Arc::new(ResponseCache::new(store_dyn.clone(), config.cache_ttl_secs));
    let quota = Arc::new(QuotaLedger::new(store_dyn.clone(), config.monthly_quota));
    let breaker = Arc::new(CircuitBreaker::new(
        config.breaker_failure_threshold,
        Duration::from_secs(config.breaker_recovery_timeout_secs),
        config.breaker_half_open_max_calls,
    ));
    let coalescer = Arc::new(RequestCoalescer::new());
    let upstream_client = UpstreamClient::new(
        &config,
        store_dyn.clone(),
        cache.clone(),
        quota.clone(),
        breaker.clone(),
        coalescer.clone(),
    )
    .unwrap();

    let state = Arc::new(AppState {
        config,
        store: store_dyn,
        cache,
        quota,
        breaker,
        coalescer,
        upstream: upstream_client,
    });

    TestGateway { state, store }
}

fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn get_json(router: &Router, uri: &str) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_cold_call_then_cache_hit() {
    let upstream = spawn_upstream(StubOptions::default()).await;
    let gateway = build_gateway(&upstream, Config::default());
    let router = build_router(gateway.state.clone());

    let (status, first) = get_json(&router, "/airports?iata_code=CDG").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["data"][0]["iata_code"], "CDG");
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);

    let month = month_tag(&Utc::now());
    assert_eq!(gateway.store.quota_usage(&month).await.unwrap(), 1);

    // Identical call within the TTL window is served from the cache
    let (status, second) = get_json(&router, "/airports?iata_code=CDG").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second, first);
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
    assert_eq!(gateway.store.quota_usage(&month).await.unwrap(), 1);

    let cache_stats = gateway.state.cache.stats();
    assert_eq!(cache_stats.hits, 1);
    assert_eq!(cache_stats.misses, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_requests_coalesce() {
    let upstream = spawn_upstream(StubOptions {
        delay_ms: 100,
        ..StubOptions::default()
    })
    .await;
    let gateway = build_gateway(&upstream, Config::default());

    let mut handles = Vec::new();
    for _ in 0..10 {
        let state = gateway.state.clone();
        handles.push(tokio::spawn(async move {
            state
                .upstream
                .call("flights", &params(&[("flight_iata", "AF447"), ("limit", "100")]))
                .await
        }));
    }

    let mut bodies = Vec::new();
    for handle in handles {
        bodies.push(handle.await.unwrap().unwrap());
    }

    // One upstream call, one quota unit, identical payloads for everyone
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
    let month = month_tag(&Utc::now());
    assert_eq!(gateway.store.quota_usage(&month).await.unwrap(), 1);
    assert!(bodies.windows(2).all(|pair| pair[0] == pair[1]));

    let stats = gateway.state.coalescer.stats();
    assert_eq!(stats.total_requests, 10);
    assert_eq!(stats.coalesced_requests, 9);
    assert_eq!(stats.actual_api_calls, 1);
}

#[tokio::test]
async fn test_quota_ceiling_blocks_without_upstream_call() {
    let upstream = spawn_upstream(StubOptions::default()).await;
    let gateway = build_gateway(
        &upstream,
        Config {
            monthly_quota: 2,
            ..Config::default()
        },
    );

    // Distinct parameter sets so the cache cannot absorb the calls
    gateway
        .state
        .upstream
        .call("airports", &params(&[("iata_code", "CDG")]))
        .await
        .unwrap();
    gateway
        .state
        .upstream
        .call("airports", &params(&[("iata_code", "JFK")]))
        .await
        .unwrap();

    let err = gateway
        .state
        .upstream
        .call("airports", &params(&[("iata_code", "LHR")]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::QuotaExceeded { used: 2, limit: 2, .. }
    ));

    // The refusal consumed no budget, asked the upstream nothing, and is
    // not an upstream failure
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 2);
    let month = month_tag(&Utc::now());
    assert_eq!(gateway.store.quota_usage(&month).await.unwrap(), 2);
    assert_eq!(gateway.state.breaker.state(), CircuitState::Closed);

    // A cached key still answers after exhaustion
    let cached = gateway
        .state
        .upstream
        .call("airports", &params(&[("iata_code", "CDG")]))
        .await
        .unwrap();
    assert_eq!(cached["data"][0]["iata_code"], "CDG");
}

#[tokio::test]
async fn test_quota_exhaustion_maps_to_429() {
    let upstream = spawn_upstream(StubOptions::default()).await;
    let gateway = build_gateway(
        &upstream,
        Config {
            monthly_quota: 1,
            ..Config::default()
        },
    );
    let router = build_router(gateway.state.clone());

    let (status, _) = get_json(&router, "/airports?iata_code=CDG").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = get_json(&router, "/airports?iata_code=JFK").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "quota_exceeded");
}

#[tokio::test]
async fn test_upstream_429_is_a_breaker_failure_surfaced_as_502() {
    let upstream = spawn_upstream(StubOptions {
        fail_status: 429,
        fail_body: "{\"message\":\"provider rate limit\"}".to_string(),
        fail_count: 1,
        ..StubOptions::default()
    })
    .await;
    let gateway = build_gateway(&upstream, Config::default());
    let router = build_router(gateway.state.clone());

    // Unlike the gateway's own quota refusal, a 429 from the provider is
    // an upstream transient: counted against the breaker and answered 502
    let (status, body) = get_json(&router, "/airports?iata_code=CDG").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "upstream_rate_limited");
    assert_eq!(gateway.state.breaker.stats().failure_count, 1);
    assert_eq!(gateway.state.breaker.state(), CircuitState::Closed);

    // The failure was not cached: the retry reaches the upstream again
    let (status, _) = get_json(&router, "/airports?iata_code=CDG").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 2);
    assert_eq!(gateway.state.breaker.stats().failure_count, 0);
}

#[tokio::test]
async fn test_breaker_trips_then_recovers() {
    let upstream = spawn_upstream(StubOptions {
        fail_count: 2,
        ..StubOptions::default()
    })
    .await;
    let gateway = build_gateway(
        &upstream,
        Config {
            breaker_failure_threshold: 2,
            breaker_recovery_timeout_secs: 1,
            breaker_half_open_max_calls: 1,
            ..Config::default()
        },
    );
    let state = gateway.state.clone();

    // Two consecutive 500s trip the breaker
    for code in ["AAA", "BBB"] {
        let err = state
            .upstream
            .call("airports", &params(&[("iata_code", code)]))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamTransient(_)));
    }
    assert_eq!(state.breaker.state(), CircuitState::Open);
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 2);

    // Shed without an upstream call or quota spend
    let month = month_tag(&Utc::now());
    let used_before = state.store.quota_usage(&month).await.unwrap();
    let err = state
        .upstream
        .call("airports", &params(&[("iata_code", "CCC")]))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::BreakerOpen { .. }));
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 2);
    assert_eq!(state.store.quota_usage(&month).await.unwrap(), used_before);

    // After the recovery window the probe goes through and, with one
    // success required, the circuit closes
    sleep(Duration::from_millis(1100)).await;
    let payload = state
        .upstream
        .call("airports", &params(&[("iata_code", "DDD")]))
        .await
        .unwrap();
    assert_eq!(payload["data"][0]["iata_code"], "CDG");
    assert_eq!(state.breaker.state(), CircuitState::Closed);
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_parameter_order_shares_cache_entry() {
    let upstream = spawn_upstream(StubOptions::default()).await;
    let gateway = build_gateway(&upstream, Config::default());
    let router = build_router(gateway.state.clone());

    let (status, _) = get_json(&router, "/airports?iata_code=CDG&limit=10").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = get_json(&router, "/airports?limit=10&iata_code=CDG").await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_validation_rejects_before_middleware() {
    let upstream = spawn_upstream(StubOptions::default()).await;
    let gateway = build_gateway(&upstream, Config::default());
    let router = build_router(gateway.state.clone());

    let (status, body) = get_json(&router, "/flights?flight_date=2025-13-45").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let (status, _) = get_json(&router, "/airports?limit=abc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get_json(&router, "/flights/history?flight_iata=AF447").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Nothing reached the upstream or the ledger
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);
    let month = month_tag(&Utc::now());
    assert_eq!(gateway.store.quota_usage(&month).await.unwrap(), 0);
}

#[tokio::test]
async fn test_flights_success_populates_history() {
    let upstream = spawn_upstream(StubOptions::default()).await;
    let gateway = build_gateway(&upstream, Config::default());
    let router = build_router(gateway.state.clone());

    let (status, _) = get_json(&router, "/flights?flight_iata=af447").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = get_json(
        &router,
        "/flights/history?flight_iata=AF447&start_date=2025-11-01&end_date=2025-11-30",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["data"][0]["flight"]["iata"], "AF447");
    // Reading history spends no quota beyond the original call
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_upstream_error_envelope_is_a_breaker_failure() {
    let upstream = spawn_upstream(StubOptions {
        body: json!({"error": {"code": "invalid_access_key", "message": "denied"}}),
        ..StubOptions::default()
    })
    .await;
    let gateway = build_gateway(&upstream, Config::default());
    let router = build_router(gateway.state.clone());

    let (status, body) = get_json(&router, "/airports?iata_code=CDG").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"]["code"], "invalid_access_key");

    // Counted against the breaker, but one failure does not trip it
    assert_eq!(gateway.state.breaker.state(), CircuitState::Closed);
    assert_eq!(gateway.state.breaker.stats().failure_count, 1);
}

#[tokio::test]
async fn test_upstream_client_error_passes_through() {
    let upstream = spawn_upstream(StubOptions {
        fail_status: 404,
        fail_body: "{\"message\":\"no such resource\"}".to_string(),
        fail_count: 1,
        ..StubOptions::default()
    })
    .await;
    let gateway = build_gateway(&upstream, Config::default());
    let router = build_router(gateway.state.clone());

    let (status, body) = get_json(&router, "/airports?iata_code=CDG").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "no such resource");

    // Caller input, not upstream health: breaker untouched
    assert_eq!(gateway.state.breaker.stats().failure_count, 0);
}

#[tokio::test]
async fn test_operational_endpoints() {
    let upstream = spawn_upstream(StubOptions::default()).await;
    let gateway = build_gateway(&upstream, Config::default());
    let router = build_router(gateway.state.clone());

    let (status, health) = get_json(&router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["circuit_breaker"], "closed");
    assert_eq!(health["rate_limit"]["limit"], 10_000);

    let (status, usage) = get_json(&router, "/usage").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(usage["used"], 0);
    assert_eq!(usage["remaining"], 10_000);
    assert!(usage["reset_date"].as_str().unwrap().starts_with("20"));

    let (status, stats) = get_json(&router, "/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert!(stats["circuit_breaker"]["state"].is_string());
    assert!(stats["request_coalescer"]["total_requests"].is_u64());
    assert!(stats["cache"]["ttl_seconds"].is_u64());

    let response = router
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("gateway_circuit_breaker_state"));
    assert!(text.contains("gateway_rate_limit_remaining"));
}

#[tokio::test]
async fn test_root_banner() {
    let upstream = spawn_upstream(StubOptions::default()).await;
    let gateway = build_gateway(&upstream, Config::default());
    let router = build_router(gateway.state.clone());

    let (status, body) = get_json(&router, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "running");
}
