//! Identifies the caller of an API request.

use crate::errors::AppError;
use axum::{extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

pub const CALLER_HEADER: &str = "x-caller-id";

/// The UUID from the `x-caller-id` header. Requests without a valid one are
/// rejected with 401.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller(pub Uuid);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(CALLER_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::unauthorized(format!("missing {} header", CALLER_HEADER)))?;
        Uuid::parse_str(raw.trim())
            .map(Caller)
            .map_err(|_| AppError::unauthorized(format!("invalid {} header", CALLER_HEADER)))
    }
}
