//! Short-lived signed URLs for uploading to and downloading from a bucket.
//!
//! Nothing here fails loudly: missing secrets or a signing error yield `None`
//! and callers decide what that means for them.

use crate::formatting::normalize_filename;
use crate::models::credentials::BucketCredentials;
use crate::storage::{ObjectStorage, PresignOperation, PresignParams, PresignRequest};
use chrono::{DateTime, Utc};
use std::time::{Duration, SystemTime};
use tracing::warn;

/// One week, the longest a SigV4 URL may live.
pub const DEFAULT_PRESIGN_TTL_SECONDS: u64 = 60 * 60 * 24 * 7;

#[derive(Debug, Clone, Copy)]
pub struct PresignSettings {
    pub upload_ttl: Duration,
    pub download_ttl: Duration,
}

impl Default for PresignSettings {
    fn default() -> Self {
        Self {
            upload_ttl: Duration::from_secs(DEFAULT_PRESIGN_TTL_SECONDS),
            download_ttl: Duration::from_secs(DEFAULT_PRESIGN_TTL_SECONDS),
        }
    }
}

/// `Content-Disposition` override for a download.
pub fn content_disposition(filename: Option<&str>, force_download: bool) -> Option<String> {
    let kind = if force_download { "attachment" } else { "inline" };
    match normalize_filename(filename, None, 0) {
        Some(normalized) => Some(format!(
            "{}; filename*=UTF-8''{}",
            kind,
            urlencoding::encode(&normalized)
        )),
        None if force_download => Some("attachment".to_string()),
        None => None,
    }
}

/// Signed PUT for exactly `key`.
pub async fn presign_upload(
    storage: &dyn ObjectStorage,
    bucket_name: &str,
    credentials: &BucketCredentials,
    key: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Option<String> {
    presign(
        storage,
        credentials,
        PresignRequest {
            operation: PresignOperation::Put,
            bucket: bucket_name,
            key,
            params: PresignParams::default(),
            expires_in: ttl,
            start_time: SystemTime::from(now),
        },
    )
    .await
}

/// Signed GET for `key`, optionally naming the file the browser saves.
#[allow(clippy::too_many_arguments)]
pub async fn presign_download(
    storage: &dyn ObjectStorage,
    bucket_name: &str,
    credentials: &BucketCredentials,
    key: &str,
    filename: Option<&str>,
    force_download: bool,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Option<String> {
    presign(
        storage,
        credentials,
        PresignRequest {
            operation: PresignOperation::Get,
            bucket: bucket_name,
            key,
            params: PresignParams {
                content_disposition: content_disposition(filename, force_download),
            },
            expires_in: ttl,
            start_time: SystemTime::from(now),
        },
    )
    .await
}

async fn presign(
    storage: &dyn ObjectStorage,
    credentials: &BucketCredentials,
    request: PresignRequest<'_>,
) -> Option<String> {
    let keys = credentials.access_keys()?;
    let key = request.key.to_string();
    match storage.presigned_url(&keys, request).await {
        Ok(url) => Some(url),
        Err(err) => {
            warn!("Presigning {} failed: {}", key, err);
            None
        }
    }
}
