//! Defines the HTTP surface of the broker.
//!
//! ## Structure
//! - **Probes**
//!   - `GET    /healthz`, `GET /readyz`
//!
//! - **Tenants**
//!   - `PUT    /tenants/{tenant_id}/bucket`: get or provision the tenant bucket
//!
//! - **Uploads**
//!   - `POST   /buckets/{bucket_id}/uploads`: direct-upload intent
//!   - `POST   /uploads/complete`: direct-upload completion callback
//!   - `POST   /buckets/{bucket_id}/fetches`: server-side URL fetch
//!
//! - **Objects**
//!   - `GET    /buckets/{bucket_id}/objects`: paginated listing
//!   - `GET    /buckets/{bucket_id}/objects/{object_id}`: one object
//!   - `GET    /buckets/{bucket_id}/objects/{object_id}/download`: redirect to a presigned URL
//!   - `DELETE /buckets/{bucket_id}/objects/{object_id}`: delete bytes and row
//!
//! Everything except the probes requires an `x-caller-id` header.

use crate::{
    handlers::{
        bucket_handlers::ensure_bucket,
        health_handlers::{healthz, readyz},
        object_handlers::{delete_object, download_object, get_object, list_objects},
        upload_handlers::{begin_upload, complete_upload, request_fetch},
    },
    services::{
        bucket_service::BucketService, object_service::ObjectService,
        upload_service::UploadService,
    },
};
use axum::{
    Router,
    routing::{get, post, put},
};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub buckets: BucketService,
    pub objects: ObjectService,
    pub uploads: UploadService,
}

/// Build the router. Call `.with_state` to attach an [`AppState`].
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/tenants/{tenant_id}/bucket", put(ensure_bucket))
        .route("/uploads/complete", post(complete_upload))
        .route("/buckets/{bucket_id}/uploads", post(begin_upload))
        .route("/buckets/{bucket_id}/fetches", post(request_fetch))
        .route("/buckets/{bucket_id}/objects", get(list_objects))
        .route(
            "/buckets/{bucket_id}/objects/{object_id}",
            get(get_object).delete(delete_object),
        )
        .route(
            "/buckets/{bucket_id}/objects/{object_id}/download",
            get(download_object),
        )
}
