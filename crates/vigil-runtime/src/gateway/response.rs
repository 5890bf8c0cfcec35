use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use vigil_core::VigilError;

/// Error body returned by every endpoint: `{"error": code, "message": text}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("NOT_FOUND", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("UNAUTHORIZED", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("FORBIDDEN", message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("VALIDATION_ERROR", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("INTERNAL_ERROR", message)
    }

    /// HTTP status for this error code.
    pub fn status_code(&self) -> StatusCode {
        match self.error.as_str() {
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "UNAUTHORIZED" => StatusCode::UNAUTHORIZED,
            "FORBIDDEN" => StatusCode::FORBIDDEN,
            "VALIDATION_ERROR" | "INVALID_ARGUMENT" => StatusCode::BAD_REQUEST,
            "TIMEOUT" => StatusCode::GATEWAY_TIMEOUT,
            "RATE_LIMITED" => StatusCode::TOO_MANY_REQUESTS,
            "INTEGRITY_VIOLATION" => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self)).into_response()
    }
}

impl From<VigilError> for ApiError {
    fn from(err: VigilError) -> Self {
        match err {
            VigilError::NotFound(msg) => Self::not_found(msg),
            VigilError::Unauthorized(msg) => Self::unauthorized(msg),
            VigilError::Forbidden(msg) => Self::forbidden(msg),
            VigilError::Validation(msg) => Self::validation(msg),
            VigilError::InvalidArgument(msg) => Self::new("INVALID_ARGUMENT", msg),
            VigilError::Timeout(msg) => Self::new("TIMEOUT", msg),
            VigilError::RateLimitExceeded { retry_after, .. } => Self::new(
                "RATE_LIMITED",
                format!("rate limit exceeded, retry after {:?}", retry_after),
            ),
            VigilError::Integrity(msg) => Self::new("INTEGRITY_VIOLATION", msg),
            VigilError::Database(msg) => Self::internal(format!("Database error: {}", msg)),
            other => Self::internal(other.to_string()),
        }
    }
}

/// Shorthand for handler results.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
