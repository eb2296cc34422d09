//! Error taxonomy for the Pylon gateway.
//!
//! Every failure a pipeline stage can produce is represented here, together
//! with its HTTP mapping. The orchestrator owns the translation from an
//! error kind to the final response so individual stages never build error
//! bodies themselves.

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use serde_json::json;

/// Gateway error kinds with fixed HTTP status mappings.
///
/// | Kind | Status |
/// |------|--------|
/// | `Unauthenticated` | 401 |
/// | `TokenBlacklisted` | 401 |
/// | `Forbidden` | 403 |
/// | `RateLimited` | 429 |
/// | `CircuitOpen` | 503 |
/// | `NoHealthyInstance` | 503 |
/// | `UpstreamTimeout` | 504 |
/// | `BadGateway` | 502 |
/// | `Validation` | 400 |
/// | `NotFound` | 404 |
/// | `Internal` | 500 |
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("Authentication required: {reason}")]
    Unauthenticated { reason: String },

    #[error("Token has been revoked")]
    TokenBlacklisted,

    #[error("Access denied: {reason}")]
    Forbidden { reason: String },

    #[error("Rate limit exceeded: {reason}")]
    RateLimited {
        reason: String,
        limit: u64,
        reset_secs: u64,
    },

    #[error("Circuit breaker open for service {service}")]
    CircuitOpen { service: String, retry_after_secs: u64 },

    #[error("No healthy instances available for service {service}")]
    NoHealthyInstance { service: String },

    #[error("Upstream request timed out after {timeout_secs}s")]
    UpstreamTimeout { timeout_secs: u64 },

    #[error("Upstream service error: {message}")]
    BadGateway { message: String },

    #[error("Request validation failed: {message}")]
    Validation { message: String },

    #[error("No service configured for path {path}")]
    NotFound { path: String },

    #[error("Internal gateway error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Status code this error maps to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            GatewayError::TokenBlacklisted => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden { .. } => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::NoHealthyInstance { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Validation { .. } => StatusCode::BAD_REQUEST,
            GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable identifier used in error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Unauthenticated { .. } => "unauthenticated",
            GatewayError::TokenBlacklisted => "token_blacklisted",
            GatewayError::Forbidden { .. } => "forbidden",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::CircuitOpen { .. } => "circuit_open",
            GatewayError::NoHealthyInstance { .. } => "no_healthy_instance",
            GatewayError::UpstreamTimeout { .. } => "upstream_timeout",
            GatewayError::BadGateway { .. } => "bad_gateway",
            GatewayError::Validation { .. } => "validation_failure",
            GatewayError::NotFound { .. } => "not_found",
            GatewayError::Internal { .. } => "internal",
        }
    }

    /// Seconds the client should wait before retrying, when applicable.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited { reset_secs, .. } => Some(*reset_secs),
            GatewayError::CircuitOpen { retry_after_secs, .. } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Builds the JSON error body shared by all gateway errors.
    ///
    /// The shape is `{error, message, timestamp, requestId}` plus
    /// kind-specific fields such as `retryAfter`. Internal errors are
    /// reported without detail when `production` is set.
    pub fn to_body(&self, request_id: &str, production: bool) -> serde_json::Value {
        let message = match self {
            GatewayError::Internal { .. } if production => {
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let mut body = json!({
            "error": self.kind(),
            "message": message,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "requestId": request_id,
        });

        if let Some(retry_after) = self.retry_after() {
            body["retryAfter"] = json!(retry_after);
        }
        if let GatewayError::RateLimited { limit, .. } = self {
            body["limit"] = json!(limit);
        }
        if let GatewayError::CircuitOpen { service, .. }
        | GatewayError::NoHealthyInstance { service } = self
        {
            body["service"] = json!(service);
        }

        body
    }

    /// Renders the error as a complete HTTP response.
    pub fn to_response(&self, request_id: &str, production: bool) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status_code());
        if let Some(retry_after) = self.retry_after() {
            builder.insert_header(("Retry-After", retry_after.to_string()));
        }
        builder.json(self.to_body(request_id, production))
    }
}

impl actix_web::error::ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        GatewayError::status_code(self)
    }

    fn error_response(&self) -> HttpResponse {
        // Fallback path for errors surfaced outside the pipeline, where no
        // request id has been assigned yet.
        self.to_response("unknown", true)
    }
}
