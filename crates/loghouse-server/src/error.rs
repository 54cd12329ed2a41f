//! Server Error Types
//!
//! Two layers:
//!
//! - [`Error`]: operational failures (startup, registration, persistence)
//!   that never travel over HTTP
//! - [`ApiError`]: the response-shaped error every handler returns; its
//!   `IntoResponse` impl is the single place the status-code mapping
//!   lives: out-of-bounds consume -> 204, not-found -> 404, conflict ->
//!   409, invalid input -> 400, everything else -> 500 with a single-line
//!   message

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

/// Operational errors: initialization, registration, persistence.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] loghouse_storage::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("registration with controller failed: {0}")]
    Registration(String),
}

/// Handler-facing error carrying its HTTP mapping.
#[derive(Debug)]
pub enum ApiError {
    /// Consume hit the end (or the trim horizon): an empty 204, not a
    /// failure.
    NoContent,
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::NoContent => write!(f, "no content"),
            ApiError::BadRequest(m) => write!(f, "bad request: {}", m),
            ApiError::NotFound(m) => write!(f, "not found: {}", m),
            ApiError::Conflict(m) => write!(f, "conflict: {}", m),
            ApiError::Internal(m) => write!(f, "internal error: {}", m),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NoContent => StatusCode::NO_CONTENT.into_response(),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, line(m)).into_response(),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, line(m)).into_response(),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, line(m)).into_response(),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, line(m)).into_response(),
        }
    }
}

/// Error bodies are a single line of text.
fn line(mut m: String) -> String {
    if let Some(at) = m.find('\n') {
        m.truncate(at);
    }
    m.push('\n');
    m
}

impl From<loghouse_storage::Error> for ApiError {
    fn from(e: loghouse_storage::Error) -> ApiError {
        use loghouse_storage::Error as E;
        match e {
            E::OutOfBounds { .. } => ApiError::NoContent,
            E::MessageTooLarge { .. }
            | E::ContentTypeTooLong(_)
            | E::IdMismatch { .. }
            | E::Codec(_) => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<loghouse_core::Error> for ApiError {
    fn from(e: loghouse_core::Error) -> ApiError {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<loghouse_client::Error> for ApiError {
    fn from(e: loghouse_client::Error) -> ApiError {
        use loghouse_client::Error as E;
        match e {
            E::InvalidName(_) => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_bounds_maps_to_no_content() {
        let api: ApiError = loghouse_storage::Error::OutOfBounds { id: 7 }.into();
        assert!(matches!(api, ApiError::NoContent));
    }

    #[test]
    fn test_rejected_input_maps_to_bad_request() {
        let api: ApiError = loghouse_storage::Error::IdMismatch {
            provided: 3,
            expected: 5,
        }
        .into();
        assert!(matches!(api, ApiError::BadRequest(_)));

        let api: ApiError = loghouse_storage::Error::MessageTooLarge { size: 10, max: 1 }.into();
        assert!(matches!(api, ApiError::BadRequest(_)));
    }

    #[test]
    fn test_everything_else_is_internal() {
        let api: ApiError = loghouse_storage::Error::BufferClosed.into();
        assert!(matches!(api, ApiError::Internal(_)));
        let api: ApiError = loghouse_storage::Error::Transient("x".into()).into();
        assert!(matches!(api, ApiError::Internal(_)));
    }

    #[test]
    fn test_error_body_is_single_line() {
        assert_eq!(line("a\nb\nc".to_string()), "a\n");
        assert_eq!(line("plain".to_string()), "plain\n");
    }
}
