use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::breaker::CircuitBreaker;
use crate::cache::ResponseCache;
use crate::coalescer::RequestCoalescer;
use crate::config::Config;
use crate::error::GatewayError;
use crate::handlers::{self, AppState, SharedState};
use crate::metrics;
use crate::middleware;
use crate::quota::QuotaLedger;
use crate::store::{GatewayStore, MemoryStore, RedisStore};
use crate::upstream::UpstreamClient;

pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<(), GatewayError> {
        let addr = format!("{}:{}", self.config.server_host, self.config.server_port);
        let state = build_state(self.config).await?;
        let app = build_router(state);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| GatewayError::Config(format!("failed to bind {}: {}", addr, e)))?;
        info!(addr, "gateway listening");

        axum::serve(listener, app)
            .await
            .map_err(|e| GatewayError::Internal(format!("server error: {}", e)))
    }
}

/// Wire up the store and the middleware stack.
///
/// Redis is the durable backend shared by every replica; when it is not
/// reachable at startup the gateway still comes up on the process-local
/// memory store, matching the degraded mode of the rest of the platform.
pub async fn build_state(config: Config) -> Result<SharedState, GatewayError> {
    metrics::register_metrics();

    let store: Arc<dyn GatewayStore> = if config.redis_url.is_empty() {
        warn!("REDIS_URL is empty, using process-local memory store");
        Arc::new(MemoryStore::new())
    } else {
        match RedisStore::connect(&config.redis_url).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                warn!(error = %e, "Redis unavailable, falling back to memory store");
                Arc::new(MemoryStore::new())
            }
        }
    };

    let cache = Arc::new(ResponseCache::new(store.clone(), config.cache_ttl_secs));
    info!(ttl_secs = config.cache_ttl_secs, "response cache ready");

    let quota = Arc::new(QuotaLedger::new(store.clone(), config.monthly_quota));

    let breaker = Arc::new(CircuitBreaker::new(
        config.breaker_failure_threshold,
        Duration::from_secs(config.breaker_recovery_timeout_secs),
        config.breaker_half_open_max_calls,
    ));

    let coalescer = Arc::new(RequestCoalescer::new());
    info!("request coalescer ready");

    let upstream = UpstreamClient::new(
        &config,
        store.clone(),
        cache.clone(),
        quota.clone(),
        breaker.clone(),
        coalescer.clone(),
    )?;

    Ok(Arc::new(AppState {
        config,
        store,
        cache,
        quota,
        breaker,
        coalescer,
        upstream,
    }))
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/airports", get(handlers::get_airports))
        .route("/flights", get(handlers::get_flights))
        .route("/flights/history", get(handlers::get_flight_history))
        .route("/health", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .route("/usage", get(handlers::usage))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(axum::middleware::from_fn(middleware::logging_middleware))
        .layer(axum::middleware::from_fn(middleware::metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(45)))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
