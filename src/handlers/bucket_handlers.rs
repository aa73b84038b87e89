use crate::{errors::AppError, handlers::caller::Caller, routes::routes::AppState};
use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use uuid::Uuid;

/// `PUT /tenants/{tenant_id}/bucket`: get or provision the tenant's bucket.
///
/// Answers with the bucket even when the provider step failed; `active`
/// tells the caller whether to try again.
pub async fn ensure_bucket(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(tenant_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    tracing::debug!("{} ensures bucket for tenant {}", caller, tenant_id);
    let bucket = state.buckets.ensure_bucket(tenant_id).await?;
    Ok(Json(bucket))
}
