use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Convenience type alias for Results with AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Main error type for the scanner pipeline.
///
/// API handlers convert these into `(StatusCode, Json<ErrorResponse>)`
/// tuples with stable machine-readable codes; workers record them on the
/// scan row as human-readable failure reasons.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Request body too large: {0}")]
    PayloadTooLarge(String),

    #[error("Invalid or disallowed target URL: {0}")]
    DisallowedTarget(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Scan cooldown active, retry in {retry_after_seconds}s")]
    Cooldown { retry_after_seconds: u64 },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Analysis error: {0}")]
    Analysis(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Stable error code surfaced in API responses.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            AppError::DisallowedTarget(_) => "INVALID_TARGET",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Cooldown { .. } => "COOLDOWN_ACTIVE",
            AppError::Database(_) => "CONNECTION_ERROR",
            AppError::Queue(_) => "CONNECTION_ERROR",
            AppError::Storage(_) => "CONNECTION_ERROR",
            AppError::Http(_) => "CONNECTION_ERROR",
            AppError::Serialization(_) => "JSON_PARSE_ERROR",
            AppError::Render(_) => "INTERNAL_ERROR",
            AppError::Analysis(_) => "INTERNAL_ERROR",
            AppError::Timeout(_) => "TIMEOUT_ERROR",
            AppError::Config(_) => "INTERNAL_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_)
            | AppError::PayloadTooLarge(_)
            | AppError::DisallowedTarget(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Cooldown { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Database(_)
            | AppError::Queue(_)
            | AppError::Storage(_)
            | AppError::Http(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Serialization(_) => StatusCode::BAD_REQUEST,
            AppError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Render(_)
            | AppError::Analysis(_)
            | AppError::Config(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// ============================================
// API error payload
// ============================================

#[derive(Serialize, Clone)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(rename = "retryAfterSeconds", skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
            details: None,
            retry_after_seconds: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_seconds = Some(seconds);
        self
    }
}

/// Handler error shape used across the API layer.
pub type ApiError = (StatusCode, Json<ErrorResponse>);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        let status = err.status();
        let code = err.code();
        let body = match &err {
            AppError::Cooldown {
                retry_after_seconds,
            } => ErrorResponse::new(err.to_string(), code).with_retry_after(*retry_after_seconds),
            // Internal detail stays in the logs, not the response body.
            AppError::Database(_) | AppError::Internal(_) => {
                tracing::error!("Internal error: {}", err);
                ErrorResponse::new("Internal server error", code)
            }
            _ => ErrorResponse::new(err.to_string(), code),
        };
        (status, Json(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(AppError::Validation("x".into()).code(), "VALIDATION_ERROR");
        assert_eq!(
            AppError::PayloadTooLarge("x".into()).code(),
            "PAYLOAD_TOO_LARGE"
        );
        assert_eq!(
            AppError::DisallowedTarget("x".into()).code(),
            "INVALID_TARGET"
        );
        assert_eq!(
            AppError::Cooldown {
                retry_after_seconds: 10
            }
            .code(),
            "COOLDOWN_ACTIVE"
        );
        assert_eq!(AppError::Timeout("x".into()).code(), "TIMEOUT_ERROR");
    }

    #[test]
    fn json_parse_failures_keep_their_own_code() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err = AppError::Serialization(parse_err);
        assert_eq!(err.code(), "JSON_PARSE_ERROR");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            AppError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::PayloadTooLarge("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Cooldown {
                retry_after_seconds: 5
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn cooldown_carries_retry_after() {
        let (status, body) = ApiError::from(AppError::Cooldown {
            retry_after_seconds: 25,
        });
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body.0.retry_after_seconds, Some(25));
    }
}
