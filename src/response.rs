//! HTTP response shaping: JSON bodies for the operational endpoints and
//! the translation of `GatewayError` into status codes. Components below
//! the router never see HTTP; this module is the only place errors
//! become responses.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use crate::error::GatewayError;

/// Body shape for every gateway-originated non-2xx response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub detail: serde_json::Value,
}

impl ErrorBody {
    pub fn new(kind: &str, detail: serde_json::Value) -> Self {
        Self {
            error: kind.to_string(),
            detail,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            GatewayError::QuotaExceeded { .. } => {
                (StatusCode::TOO_MANY_REQUESTS, json!(self.to_string()))
            }
            GatewayError::BreakerOpen { retry_after } => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({
                    "message": "Service temporarily unavailable (circuit breaker open)",
                    "retry_after": retry_after,
                }),
            ),
            GatewayError::UpstreamTransient(_) => {
                (StatusCode::BAD_GATEWAY, json!(self.to_string()))
            }
            GatewayError::UpstreamRateLimited(_) => {
                (StatusCode::BAD_GATEWAY, json!(self.to_string()))
            }
            GatewayError::UpstreamEnvelope(envelope) => {
                (StatusCode::BAD_REQUEST, envelope.clone())
            }
            GatewayError::UpstreamClient { status, body } => {
                // Upstream 4xx other than 429 passes through verbatim
                let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST);
                return (
                    status,
                    [(header::CONTENT_TYPE, "application/json")],
                    body.clone(),
                )
                    .into_response();
            }
            GatewayError::StoreUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, json!(self.to_string()))
            }
            GatewayError::Validation(_) => (StatusCode::BAD_REQUEST, json!(self.to_string())),
            GatewayError::Config(_) | GatewayError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, json!(self.to_string()))
            }
        };

        (status, Json(ErrorBody::new(self.kind(), detail))).into_response()
    }
}
