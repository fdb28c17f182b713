use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for service operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy of the service.
///
/// Analytics-path failures deliberately have no variant here: they are
/// absorbed inside the aggregator worker (logged and retried, or counted as
/// dropped) and can never surface to a redirect or creation caller.
#[derive(Error, Debug)]
pub enum Error {
    /// Target URL failed validation (not an absolute http/https URL).
    #[error("invalid target URL: {0}")]
    InvalidUrl(String),

    /// Custom short code failed charset/length rules.
    #[error("invalid short code: {0}")]
    InvalidCode(String),

    /// The short code is already taken. Only ever surfaced for custom
    /// codes; generated-code collisions are retried internally.
    #[error("short code already taken: {0}")]
    CodeConflict(String),

    /// Unknown short code, or a link that was deleted or has expired.
    #[error("not found: {0}")]
    NotFound(String),

    /// Random generation exhausted its retry budget. A service-capacity
    /// condition, not a user error.
    #[error("short code generation exhausted after {0} attempts")]
    GenerationExhausted(u32),

    /// Database connection or query errors.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    pub fn not_found(code: impl Into<String>) -> Self {
        Error::NotFound(code.into())
    }

    /// Get the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            Error::InvalidCode(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::CodeConflict(_) => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::GenerationExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error identifier used in response bodies.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::InvalidUrl(_) => "invalid_url",
            Error::InvalidCode(_) => "invalid_code",
            Error::CodeConflict(_) => "code_conflict",
            Error::NotFound(_) => "not_found",
            Error::GenerationExhausted(_) => "generation_exhausted",
            Error::Database(_) => "database_error",
        }
    }
}

/// Automatic JSON error responses for handlers returning `Result<_>`.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Never leak internal detail on 5xx responses.
        let message = if status.is_server_error() {
            "internal error".to_owned()
        } else {
            self.to_string()
        };

        match status {
            StatusCode::INTERNAL_SERVER_ERROR | StatusCode::SERVICE_UNAVAILABLE => {
                tracing::error!(error = ?self, "request failed");
            }
            _ => {
                tracing::debug!(error = %self, "client error");
            }
        }

        let body = Json(json!({
            "error": {
                "message": message,
                "type": self.error_type(),
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}
