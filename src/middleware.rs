use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{info, warn};

use crate::metrics;

/// Logging middleware that tracks request duration and status
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    let duration = start.elapsed();
    let status = response.status();

    if status.is_server_error() {
        warn!(
            method = %method,
            uri = %uri,
            status = %status.as_u16(),
            duration_ms = duration.as_millis(),
            "Request completed with error"
        );
    } else {
        info!(
            method = %method,
            uri = %uri,
            status = %status.as_u16(),
            duration_ms = duration.as_millis(),
            "Request completed"
        );
    }

    response
}

/// Per-request duration histogram and in-flight gauge
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    // The route set is small and fixed, so the raw path is a safe label
    let handler = request.uri().path().to_string();
    let start = Instant::now();

    metrics::HTTP_REQUESTS_IN_FLIGHT.inc();
    let response = next.run(request).await;
    metrics::HTTP_REQUESTS_IN_FLIGHT.dec();

    metrics::HTTP_REQUEST_DURATION
        .with_label_values(&[&handler])
        .observe(start.elapsed().as_secs_f64());

    response
}
