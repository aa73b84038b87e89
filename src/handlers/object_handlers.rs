//! HTTP handlers for reading and removing objects of a bucket.

use crate::{
    errors::AppError,
    handlers::caller::Caller,
    routes::routes::AppState,
    services::object_service::{DEFAULT_PAGE_SIZE, ListOptions},
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect},
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ListObjectsQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    /// Skip the listing cache.
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    #[serde(default)]
    pub force_download: bool,
}

/// `GET /buckets/{bucket_id}/objects`
pub async fn list_objects(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(bucket_id): Path<Uuid>,
    Query(query): Query<ListObjectsQuery>,
) -> Result<impl IntoResponse, AppError> {
    state.buckets.get_bucket(bucket_id).await?;
    let options = ListOptions {
        force_refresh: query.refresh,
        client: Some(caller.to_string()),
    };
    let page = state
        .objects
        .list_for_bucket(
            bucket_id,
            query.page.unwrap_or(1),
            query.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
            &options,
        )
        .await?;
    Ok(Json(page))
}

/// `GET /buckets/{bucket_id}/objects/{object_id}`
pub async fn get_object(
    State(state): State<AppState>,
    Caller(_): Caller,
    Path((bucket_id, object_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, AppError> {
    let object = state.objects.get_in_bucket(bucket_id, object_id).await?;
    Ok(Json(object))
}

/// `GET /buckets/{bucket_id}/objects/{object_id}/download`: redirect to a presigned GET.
pub async fn download_object(
    State(state): State<AppState>,
    Caller(_): Caller,
    Path((bucket_id, object_id)): Path<(Uuid, Uuid)>,
    Query(query): Query<DownloadQuery>,
) -> Result<impl IntoResponse, AppError> {
    let url = state
        .uploads
        .download_url(bucket_id, object_id, query.force_download)
        .await?;
    Ok(Redirect::temporary(&url))
}

/// `DELETE /buckets/{bucket_id}/objects/{object_id}`
pub async fn delete_object(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((bucket_id, object_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, AppError> {
    state.uploads.delete_object(bucket_id, object_id).await?;
    tracing::info!("{} deleted object {}", caller, object_id);
    Ok(StatusCode::NO_CONTENT)
}
