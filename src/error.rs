/// Unified error types for the moderation service
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the moderation service
#[derive(Error, Debug)]
pub enum ModerationError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration errors
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Authentication errors
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Authorization errors
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Rate limiting errors
    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after: std::time::Duration },

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Conflict errors (e.g., resolving an already resolved report)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// JSON encoding/decoding of stored columns
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<validator::ValidationErrors> for ModerationError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut fields: Vec<String> = errors
            .field_errors()
            .into_iter()
            .map(|(field, errs)| {
                let detail = errs
                    .iter()
                    .filter_map(|e| e.message.as_ref().map(|m| m.to_string()))
                    .next()
                    .unwrap_or_else(|| "is invalid".to_string());
                format!("{} {}", field, detail)
            })
            .collect();
        fields.sort();
        ModerationError::Validation(fields.join("; "))
    }
}

/// JSON error body returned by every endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ModerationError {
    /// Status code and stable error code for this error
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ModerationError::Authentication(_) => (StatusCode::UNAUTHORIZED, "AuthenticationRequired"),
            ModerationError::Authorization(_) => (StatusCode::FORBIDDEN, "Forbidden"),
            ModerationError::Validation(_) => (StatusCode::BAD_REQUEST, "InvalidRequest"),
            ModerationError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            ModerationError::Conflict(_) => (StatusCode::CONFLICT, "Conflict"),
            ModerationError::RateLimitExceeded { .. } => {
                (StatusCode::TOO_MANY_REQUESTS, "RateLimitExceeded")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "InternalServerError"),
        }
    }
}

/// Convert ModerationError to HTTP response
impl IntoResponse for ModerationError {
    fn into_response(self) -> Response {
        let (status, error_code) = self.status_and_code();

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Internal error while handling request: {}", self);
            crate::metrics::record_error(error_code, "api");
            "Internal server error".to_string() // Don't leak details
        } else {
            self.to_string()
        };

        let retry_after = match &self {
            ModerationError::RateLimitExceeded { retry_after } => Some(retry_after.as_secs().max(1)),
            _ => None,
        };

        let body = Json(ErrorResponse {
            error: error_code.to_string(),
            message,
        });

        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Result type alias for moderation operations
pub type ModerationResult<T> = Result<T, ModerationError>;
