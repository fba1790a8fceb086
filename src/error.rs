use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

pub type ThrottlerResult<T> = Result<T, ThrottlerError>;

#[derive(Debug, Clone, Error)]
pub enum ThrottlerError {
    /// The bucket store could not be reached or did not answer in time.
    #[error("Bucket store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Compare-and-swap kept losing to concurrent writers for the same key.
    #[error("Gave up updating bucket '{key}' after {attempts} attempts")]
    Contention { key: String, attempts: u32 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Missing API key")]
    MissingApiKey,

    #[error("Missing user id")]
    MissingUserId,

    #[error("Invalid key strategy: {0}")]
    InvalidKeyStrategy(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ThrottlerError {
    /// Errors that the fallback policy resolves instead of surfacing to clients.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            ThrottlerError::StoreUnavailable(_)
                | ThrottlerError::Contention { .. }
                | ThrottlerError::Serialization(_)
                | ThrottlerError::Internal(_)
        )
    }
}

impl From<redis::RedisError> for ThrottlerError {
    fn from(err: redis::RedisError) -> Self {
        ThrottlerError::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for ThrottlerError {
    fn from(err: serde_json::Error) -> Self {
        ThrottlerError::Serialization(err.to_string())
    }
}

impl From<validator::ValidationErrors> for ThrottlerError {
    fn from(err: validator::ValidationErrors) -> Self {
        ThrottlerError::InvalidConfig(err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_error(err: &ThrottlerError) -> Self {
        let message = err.to_string();
        match err {
            ThrottlerError::StoreUnavailable(_) | ThrottlerError::Contention { .. } => {
                Self::new("service_unavailable", &message, 503)
            }
            ThrottlerError::InvalidConfig(_) | ThrottlerError::InvalidKeyStrategy(_) => {
                Self::new("configuration_error", &message, 500)
            }
            ThrottlerError::MissingApiKey | ThrottlerError::MissingUserId => {
                Self::new("bad_request", &message, 400)
            }
            ThrottlerError::Serialization(_) | ThrottlerError::Internal(_) => {
                Self::new("internal_error", &message, 500)
            }
        }
    }
}

impl IntoResponse for ThrottlerError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_error(&self);
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}
