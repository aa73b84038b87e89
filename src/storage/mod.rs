//! Object storage capability.
//!
//! Every call is made with a bucket-scoped credential set, so implementations
//! build their client per request instead of holding long-lived keys.

use crate::models::credentials::AccessKeys;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::{Duration, SystemTime};
use thiserror::Error;

#[cfg(test)]
pub mod fake;
pub mod s3;

pub use s3::S3ObjectStorage;

/// Errors that can occur when talking to object storage.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("failed to put object {key}: {message}")]
    Put { key: String, message: String },

    #[error("failed to delete object {key}: {message}")]
    Delete { key: String, message: String },

    #[error("failed to presign {key}: {message}")]
    Presign { key: String, message: String },
}

/// Storage operation a presigned URL grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresignOperation {
    Get,
    Put,
}

/// Extra response parameters baked into a presigned URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresignParams {
    /// Value for `response-content-disposition` on downloads.
    pub content_disposition: Option<String>,
}

/// A single object write.
#[derive(Debug, Clone)]
pub struct PutRequest<'a> {
    pub bucket: &'a str,
    pub key: &'a str,
    pub body: Bytes,
    pub content_type: Option<&'a str>,
    /// Base64 MD5 digest of `body`, checked by the storage provider.
    pub content_md5: Option<&'a str>,
}

/// A presigned URL request.
#[derive(Debug, Clone)]
pub struct PresignRequest<'a> {
    pub operation: PresignOperation,
    pub bucket: &'a str,
    pub key: &'a str,
    pub params: PresignParams,
    pub expires_in: Duration,
    /// Start of the signature validity window.
    pub start_time: SystemTime,
}

/// S3-compatible object storage operations used by the broker.
#[async_trait]
pub trait ObjectStorage: Send + Sync + 'static {
    async fn put(&self, keys: &AccessKeys, request: PutRequest<'_>) -> Result<(), StorageError>;

    async fn presigned_url(
        &self,
        keys: &AccessKeys,
        request: PresignRequest<'_>,
    ) -> Result<String, StorageError>;

    async fn delete(&self, keys: &AccessKeys, bucket: &str, key: &str)
    -> Result<(), StorageError>;
}
