//! Upload endpoints: direct-upload intents, their completion callback and
//! server-side URL fetches.

use crate::{
    errors::{AppError, ServiceError},
    handlers::caller::Caller,
    models::object::FileMetadata,
    routes::routes::AppState,
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct BeginUploadReq {
    pub filename: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteUploadReq {
    /// Signed token from the upload intent.
    pub object_data: Option<String>,
    #[serde(default)]
    pub completed: bool,
    pub errors: Option<Value>,
    pub file_data: Option<FileMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct FetchReq {
    pub url: String,
}

/// `POST /buckets/{bucket_id}/uploads`
pub async fn begin_upload(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(bucket_id): Path<Uuid>,
    Json(req): Json<BeginUploadReq>,
) -> Result<impl IntoResponse, AppError> {
    let filename = req
        .filename
        .filter(|f| !f.is_empty())
        .ok_or_else(|| ServiceError::validation("filename is required"))?;
    let intent = state
        .uploads
        .begin_direct_upload(bucket_id, &filename, Some(caller))
        .await?;
    Ok(Json(intent))
}

/// `POST /uploads/complete`
pub async fn complete_upload(
    State(state): State<AppState>,
    Caller(_): Caller,
    Json(req): Json<CompleteUploadReq>,
) -> Result<impl IntoResponse, AppError> {
    let object_data = req
        .object_data
        .ok_or_else(|| ServiceError::validation("signed object data is required"))?;
    let object = state
        .uploads
        .complete_direct_upload(&object_data, req.completed, req.errors, req.file_data)
        .await?;
    Ok(Json(json!({ "status": "ok", "object": object })))
}

/// `POST /buckets/{bucket_id}/fetches`
pub async fn request_fetch(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(bucket_id): Path<Uuid>,
    Json(req): Json<FetchReq>,
) -> Result<impl IntoResponse, AppError> {
    let request = state
        .uploads
        .request_url_upload(bucket_id, &req.url, Some(caller))
        .await?;
    Ok((StatusCode::ACCEPTED, Json(request)))
}
