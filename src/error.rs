use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Error kinds surfaced by the streaming core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("already running: {0}")]
    AlreadyRunning(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("misconfigured: {0}")]
    Misconfigured(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::IllegalState(_) | Self::AlreadyRunning(_) => StatusCode::CONFLICT,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::Misconfigured(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(format!("io: {err}"))
    }
}

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Self::Internal(format!("webrtc: {err}"))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "error": self.to_string(),
        }));
        (self.status_code(), body).into_response()
    }
}

/// Log-and-discard helper for teardown paths where an error must not stop
/// the remaining cleanup steps.
pub trait LogError<T> {
    fn log_error(self, context: &str) -> Option<T>;
}

impl<T, E: std::fmt::Display> LogError<T> for std::result::Result<T, E> {
    fn log_error(self, context: &str) -> Option<T> {
        match self {
            Ok(val) => Some(val),
            Err(e) => {
                tracing::error!("{context}: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(Error::Unavailable("s3 503".into()).is_transient());
        assert!(Error::Timeout("readiness".into()).is_transient());
        assert!(!Error::PermissionDenied("denied".into()).is_transient());
        assert!(!Error::NotFound("gone".into()).is_transient());
    }

    #[test]
    fn status_codes_match_kinds() {
        assert_eq!(
            Error::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::InvalidArgument("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::AlreadyRunning("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::Unavailable("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn log_error_converts_to_option() {
        let ok: std::result::Result<u32, String> = Ok(7);
        assert_eq!(ok.log_error("ctx"), Some(7));
        let err: std::result::Result<u32, String> = Err("boom".into());
        assert_eq!(err.log_error("ctx"), None);
    }
}
