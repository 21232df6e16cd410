//! Error handling for the gateway.

use std::fmt;

/// Errors that can occur on the gateway's proxy and operational paths.
///
/// The enum is `Clone` so a settled failure can be shared with every
/// coalesced waiter of the same in-flight call.
#[derive(Debug, Clone)]
pub enum GatewayError {
    /// Monthly call budget exhausted; no upstream call was made
    QuotaExceeded {
        used: u64,
        limit: u64,
        reset_date: String,
    },
    /// Circuit breaker is open; the request was shed
    BreakerOpen { retry_after: Option<String> },
    /// Upstream transport error, 5xx, timeout, or malformed body
    UpstreamTransient(String),
    /// Upstream answered 429
    UpstreamRateLimited(String),
    /// Upstream answered 2xx but the body carries an error envelope
    UpstreamEnvelope(serde_json::Value),
    /// Upstream 4xx other than 429; body and status are passed through
    UpstreamClient { status: u16, body: String },
    /// KV store transport or timeout failure
    StoreUnavailable(String),
    /// Inbound query parameter failed structural validation
    Validation(String),
    /// Configuration error
    Config(String),
    /// Invariant violation inside the gateway itself
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable kind, used in JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::QuotaExceeded { .. } => "quota_exceeded",
            GatewayError::BreakerOpen { .. } => "circuit_open",
            GatewayError::UpstreamTransient(_) => "upstream_error",
            GatewayError::UpstreamRateLimited(_) => "upstream_rate_limited",
            GatewayError::UpstreamEnvelope(_) => "upstream_error",
            GatewayError::UpstreamClient { .. } => "upstream_client_error",
            GatewayError::StoreUnavailable(_) => "store_unavailable",
            GatewayError::Validation(_) => "validation_error",
            GatewayError::Config(_) => "config_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::QuotaExceeded {
                used,
                limit,
                reset_date,
            } => write!(
                f,
                "Monthly quota reached: {}/{} calls, resets {}",
                used, limit, reset_date
            ),
            GatewayError::BreakerOpen { retry_after } => match retry_after {
                Some(at) => write!(
                    f,
                    "Service temporarily unavailable (circuit breaker open), retry after {}",
                    at
                ),
                None => write!(f, "Service temporarily unavailable (circuit breaker open)"),
            },
            GatewayError::UpstreamTransient(msg) => write!(f, "Upstream error: {}", msg),
            GatewayError::UpstreamRateLimited(msg) => {
                write!(f, "Upstream rate limited: {}", msg)
            }
            GatewayError::UpstreamEnvelope(detail) => {
                write!(f, "Upstream returned an error envelope: {}", detail)
            }
            GatewayError::UpstreamClient { status, .. } => {
                write!(f, "Upstream rejected the request with status {}", status)
            }
            GatewayError::StoreUnavailable(msg) => write!(f, "Store unavailable: {}", msg),
            GatewayError::Validation(msg) => write!(f, "Invalid parameter: {}", msg),
            GatewayError::Config(msg) => write!(f, "Configuration error: {}", msg),
            GatewayError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<redis::RedisError> for GatewayError {
    fn from(error: redis::RedisError) -> Self {
        GatewayError::StoreUnavailable(error.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(error: serde_json::Error) -> Self {
        GatewayError::Internal(format!("serialization error: {}", error))
    }
}
