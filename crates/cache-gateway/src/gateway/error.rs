//! Error taxonomy of the cache gateway
//!
//! Errors are `Clone` because a coalesced read hands the same outcome to every
//! waiting caller.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use thiserror::Error;

use crate::gateway::operations::OperationClass;
use crate::models::ErrorResponse;

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway error types
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Malformed or missing request fields, scope violations
    #[error("{0}")]
    Validation(String),

    /// Identity required but missing
    #[error("{0}")]
    Auth(String),

    /// Caller exceeded the budget of an operation class
    #[error("Rate limit exceeded for {class} operations (limit: {limit} per minute)")]
    RateLimited { class: OperationClass, limit: u64 },

    /// Breaker is open, backend calls are not attempted
    #[error("Cache backend temporarily unavailable, retry in {retry_after} seconds")]
    CircuitOpen { retry_after: u64 },

    /// Backend command or credential failure
    #[error("{message}")]
    Server {
        message: String,
        /// Raw backend response body, kept for diagnostics
        body: Option<String>,
    },
}

impl GatewayError {
    /// Create a Validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an Auth error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create a Server error without a backend body
    pub fn server(msg: impl Into<String>) -> Self {
        Self::Server {
            message: msg.into(),
            body: None,
        }
    }

    /// Create a Server error wrapping the raw backend body
    pub fn backend(msg: impl Into<String>, body: impl Into<String>) -> Self {
        Self::Server {
            message: msg.into(),
            body: Some(body.into()),
        }
    }

    /// Whether this error should count against the circuit breaker
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, GatewayError::Server { .. })
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "validation_error",
            GatewayError::Auth(_) => "unauthorized",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::CircuitOpen { .. } => "circuit_open",
            GatewayError::Server { .. } => "server_error",
        }
    }

    /// Seconds a client should wait before retrying, if any
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited { .. } => Some(60),
            GatewayError::CircuitOpen { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Build the JSON error response, echoing the operation when known
    pub fn to_response(&self, operation: Option<&str>) -> HttpResponse {
        let mut body = ErrorResponse::new(self.code(), self.to_string());
        if let Some(op) = operation {
            body = body.with_operation(op);
        }
        match self {
            GatewayError::Server {
                body: Some(raw), ..
            } => {
                body = body.with_details(serde_json::json!({ "backendResponse": raw }));
            }
            GatewayError::RateLimited { class, limit } => {
                body = body.with_details(serde_json::json!({
                    "class": class.as_str(),
                    "limit": limit,
                    "window": 60,
                }));
            }
            _ => {}
        }

        let mut builder = HttpResponse::build(self.status_code());
        if let Some(secs) = self.retry_after() {
            builder.insert_header(("Retry-After", secs.to_string()));
        }
        builder.json(body)
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Server { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        self.to_response(None)
    }
}

impl From<shared::SecretsError> for GatewayError {
    fn from(e: shared::SecretsError) -> Self {
        GatewayError::server(format!("Failed to resolve cache credentials: {}", e))
    }
}
