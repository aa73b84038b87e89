use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Failures surfaced by the broker services.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Bucket, object, credentials or fetch request absent, or owned by another tenant.
    #[error("{0} not found")]
    NotFound(String),
    /// Empty filename, malformed signed token, unusable input.
    #[error("validation failed: {0}")]
    Validation(String),
    /// The credential issuer failed or handed back incomplete secrets.
    #[error("credential issuance failed: {0}")]
    IssuanceFailed(String),
    /// Non-success status or network failure while fetching a source URL.
    #[error("upstream fetch failed: {0}")]
    UpstreamFetchFailed(String),
    /// Writing or deleting bytes in object storage failed.
    #[error("storage write failed: {0}")]
    StorageWriteFailed(String),
    #[error("could not presign `{0}`")]
    PresignUnavailable(String),
    #[error("dispatch failed: {0}")]
    Dispatch(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn not_found(what: impl fmt::Display) -> Self {
        ServiceError::NotFound(what.to_string())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ServiceError::Validation(msg.into())
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 401 Unauthorized
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::IssuanceFailed(_)
            | ServiceError::UpstreamFetchFailed(_)
            | ServiceError::StorageWriteFailed(_)
            | ServiceError::PresignUnavailable(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Dispatch(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Database(db_err) => {
                tracing::error!("database error: {}", db_err);
                return AppError::internal("internal database error");
            }
        };
        AppError::new(status, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (ServiceError::not_found("object"), StatusCode::NOT_FOUND),
            (ServiceError::validation("empty filename"), StatusCode::BAD_REQUEST),
            (ServiceError::IssuanceFailed("down".into()), StatusCode::BAD_GATEWAY),
            (ServiceError::Dispatch("closed".into()), StatusCode::SERVICE_UNAVAILABLE),
            (ServiceError::Database(sqlx::Error::RowNotFound), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(AppError::from(err).status, expected);
        }
    }

    #[test]
    fn test_database_message_is_not_leaked() {
        let err = AppError::from(ServiceError::Database(sqlx::Error::PoolTimedOut));
        assert_eq!(err.message, "internal database error");
    }
}
