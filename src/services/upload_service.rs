//! src/services/upload_service.rs
//!
//! The two ways bytes get into a bucket:
//!
//! - **Direct upload**: the client asks for an intent, PUTs the file straight
//!   to storage with the presigned URL, then reports back with the signed
//!   token it was handed.
//! - **URL fetch**: the server downloads a remote URL and writes it to the
//!   bucket itself, as a unit of work handed to the [`Dispatcher`].

use crate::clock::Clock;
use crate::dispatch::{Dispatcher, UnitOfWork};
use crate::errors::{ServiceError, ServiceResult};
use crate::formatting::{guess_content_type, normalize_filename};
use crate::models::{
    bucket::Bucket,
    credentials::{AccessKeys, BucketCredentials},
    fetch_request::UrlFetchRequest,
    object::{FileMetadata, Object, ObjectSource},
};
use crate::services::{
    bucket_service::find_bucket,
    credentials_service::CredentialService,
    object_service::{ObjectRef, ObjectService},
    presign::{PresignSettings, presign_download, presign_upload},
};
use crate::signing::{ObjectToken, TokenSigner};
use crate::storage::{ObjectStorage, PutRequest};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::BytesMut;
use futures::{FutureExt, StreamExt};
use md5::Context;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Name given to fetched files whose URL path has no last segment.
pub const FALLBACK_FILENAME: &str = "downloaded_file";

#[derive(Debug, Clone, Copy)]
pub struct FetchSettings {
    /// Applied to the whole download request.
    pub timeout: Duration,
    /// Larger bodies are rejected mid-stream.
    pub max_bytes: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_bytes: 100 * 1024 * 1024,
        }
    }
}

/// Everything a client needs to upload one file directly to storage.
#[derive(Debug, Clone, Serialize)]
pub struct UploadIntent {
    /// Presigned PUT URL.
    pub url: String,
    pub key: String,
    /// Final keyname of the file in the bucket.
    pub filename: String,
    pub object_id: Uuid,
    /// Signed token to send back on completion.
    pub object_data: String,
}

/// Result of running a URL fetch.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Completed(Object),
    AlreadyCompleted,
}

#[derive(Clone)]
pub struct UploadService {
    pub db: Arc<SqlitePool>,
    objects: ObjectService,
    credentials: CredentialService,
    storage: Arc<dyn ObjectStorage>,
    dispatcher: Arc<dyn Dispatcher>,
    signer: TokenSigner,
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
    presign: PresignSettings,
    fetch: FetchSettings,
}

impl UploadService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<SqlitePool>,
        objects: ObjectService,
        credentials: CredentialService,
        storage: Arc<dyn ObjectStorage>,
        dispatcher: Arc<dyn Dispatcher>,
        signer: TokenSigner,
        http: reqwest::Client,
        clock: Arc<dyn Clock>,
        presign: PresignSettings,
        fetch: FetchSettings,
    ) -> Self {
        Self {
            db,
            objects,
            credentials,
            storage,
            dispatcher,
            signer,
            http,
            clock,
            presign,
            fetch,
        }
    }

    /// Register a pending object and hand out a presigned PUT for it.
    ///
    /// Credentials are obtained before the object row exists, and the row is
    /// removed again when presigning fails, so a failed intent leaves nothing
    /// behind.
    pub async fn begin_direct_upload(
        &self,
        bucket_id: Uuid,
        filename: &str,
        caller: Option<Uuid>,
    ) -> ServiceResult<UploadIntent> {
        if normalize_filename(Some(filename), None, 0).is_none() {
            return Err(ServiceError::validation("a usable filename is required"));
        }

        let (bucket_name, credentials) = self.bucket_access(bucket_id).await?;
        let object = self
            .objects
            .create_pending(bucket_id, filename, caller, ObjectSource::User)
            .await?;
        let (key, keyname) = match (object.storage_key(), object.keyname.clone()) {
            (Some(key), Some(keyname)) => (key, keyname),
            _ => return Err(ServiceError::validation("filename yields no storage key")),
        };

        let now = self.clock.now();
        let presigned = presign_upload(
            self.storage.as_ref(),
            &bucket_name,
            &credentials,
            &key,
            self.presign.upload_ttl,
            now,
        )
        .await;
        let Some(url) = presigned else {
            self.objects.remove(&object).await?;
            return Err(ServiceError::PresignUnavailable(key));
        };

        let object_data = self.signer.sign(&ObjectToken {
            object_id: object.id,
            bucket_id,
            key: key.clone(),
            filename: keyname.clone(),
            issued_at: now,
        });

        info!("Upload intent for object {} at {}", object.id, key);
        Ok(UploadIntent {
            url,
            key,
            filename: keyname,
            object_id: object.id,
            object_data,
        })
    }

    /// Record the outcome the client reports for a direct upload.
    pub async fn complete_direct_upload(
        &self,
        object_data: &str,
        completed: bool,
        errors: Option<Value>,
        file_metadata: Option<FileMetadata>,
    ) -> ServiceResult<Object> {
        let token = self
            .signer
            .verify(object_data, self.clock.now())
            .map_err(|e| ServiceError::validation(format!("signed object data rejected: {}", e)))?;

        self.objects
            .complete(
                ObjectRef {
                    object_id: token.object_id,
                    bucket_id: token.bucket_id,
                },
                completed,
                errors,
                file_metadata,
            )
            .await
    }

    /// Persist a fetch request for `url` and hand it to the dispatcher.
    pub async fn request_url_upload(
        &self,
        bucket_id: Uuid,
        url: &str,
        caller: Option<Uuid>,
    ) -> ServiceResult<UrlFetchRequest> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| ServiceError::validation(format!("invalid url `{}`: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ServiceError::validation(format!(
                "unsupported url scheme `{}`",
                parsed.scheme()
            )));
        }
        find_bucket(&self.db, bucket_id).await?;

        let request = UrlFetchRequest::new(bucket_id, url, caller, self.clock.now());
        sqlx::query(
            "INSERT INTO url_fetch_requests (id, bucket_id, url, added_by, tries, completed,
                                             created_at, updated_at)
             VALUES (?, ?, ?, ?, 0, 0, ?, ?)",
        )
        .bind(request.id)
        .bind(request.bucket_id)
        .bind(&request.url)
        .bind(request.added_by)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&*self.db)
        .await?;
        info!("Queued fetch {} of {}", request.id, request.url);

        let service = self.clone();
        let request_id = request.id;
        self.dispatcher
            .submit(UnitOfWork::new(
                format!("process_url_upload:{}", request_id),
                move || {
                    let service = service.clone();
                    async move {
                        match service.process_url_upload(request_id).await? {
                            FetchOutcome::Completed(object) => debug!(
                                "Fetch {} linked object {} ({} bytes)",
                                request_id,
                                object.id,
                                object.uploaded_size.unwrap_or_default()
                            ),
                            FetchOutcome::AlreadyCompleted => {}
                        }
                        Ok::<(), ServiceError>(())
                    }
                    .boxed()
                },
            ))
            .await?;

        self.fetch_request(request_id).await
    }

    /// Download the request's URL into its bucket. Safe to run again after a
    /// failure; a completed request is left untouched.
    pub async fn process_url_upload(&self, request_id: Uuid) -> ServiceResult<FetchOutcome> {
        let mut request = self.fetch_request(request_id).await?;
        if request.completed {
            info!("Fetch {} already completed", request_id);
            return Ok(FetchOutcome::AlreadyCompleted);
        }

        request.tries += 1;
        sqlx::query("UPDATE url_fetch_requests SET tries = ?, updated_at = ? WHERE id = ?")
            .bind(request.tries)
            .bind(self.clock.now())
            .bind(request.id)
            .execute(&*self.db)
            .await?;

        match self.fetch_into_bucket(&request).await {
            Ok(object) => {
                info!(
                    "Fetch {} stored {} as object {} (attempt {})",
                    request.id, request.url, object.id, request.tries
                );
                Ok(FetchOutcome::Completed(object))
            }
            Err(err) => {
                warn!("Fetch {} attempt {} failed: {}", request.id, request.tries, err);
                let now = self.clock.now();
                sqlx::query(
                    "UPDATE url_fetch_requests SET last_error = ?, last_error_at = ?, updated_at = ?
                     WHERE id = ?",
                )
                .bind(err.to_string())
                .bind(now)
                .bind(now)
                .bind(request.id)
                .execute(&*self.db)
                .await?;
                Err(err)
            }
        }
    }

    pub async fn fetch_request(&self, request_id: Uuid) -> ServiceResult<UrlFetchRequest> {
        sqlx::query_as::<_, UrlFetchRequest>("SELECT * FROM url_fetch_requests WHERE id = ?")
            .bind(request_id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("fetch request {}", request_id)))
    }

    /// Presigned GET for an object, named after its downloadable filename.
    pub async fn download_url(
        &self,
        bucket_id: Uuid,
        object_id: Uuid,
        force_download: bool,
    ) -> ServiceResult<String> {
        let object = self.objects.get_in_bucket(bucket_id, object_id).await?;
        let key = object
            .storage_key()
            .ok_or_else(|| ServiceError::not_found(format!("storage key of object {}", object_id)))?;
        let (bucket_name, credentials) = self.bucket_access(bucket_id).await?;

        presign_download(
            self.storage.as_ref(),
            &bucket_name,
            &credentials,
            &key,
            object.downloadable_filename.as_deref(),
            force_download,
            self.presign.download_ttl,
            self.clock.now(),
        )
        .await
        .ok_or(ServiceError::PresignUnavailable(key))
    }

    /// Remove the stored bytes, then the row.
    pub async fn delete_object(&self, bucket_id: Uuid, object_id: Uuid) -> ServiceResult<()> {
        let object = self.objects.get_in_bucket(bucket_id, object_id).await?;
        if let Some(key) = object.storage_key() {
            let (bucket_name, credentials) = self.bucket_access(bucket_id).await?;
            let keys = usable_keys(&credentials)?;
            self.storage
                .delete(&keys, &bucket_name, &key)
                .await
                .map_err(|e| ServiceError::StorageWriteFailed(e.to_string()))?;
        }
        self.objects.remove(&object).await
    }

    /// Provider bucket name plus usable credentials for it.
    async fn bucket_access(&self, bucket_id: Uuid) -> ServiceResult<(String, BucketCredentials)> {
        let bucket: Bucket = find_bucket(&self.db, bucket_id).await?;
        let name = bucket
            .provisioned_name()
            .ok_or_else(|| {
                ServiceError::IssuanceFailed(format!("bucket {} is not provisioned", bucket_id))
            })?
            .to_string();
        let credentials = self.credentials.credentials_for(&bucket).await?;
        usable_keys(&credentials)?;
        Ok((name, credentials))
    }

    async fn fetch_into_bucket(&self, request: &UrlFetchRequest) -> ServiceResult<Object> {
        let filename = filename_from_url(&request.url);
        if normalize_filename(Some(&filename), None, 0).is_none() {
            return Err(ServiceError::validation(format!(
                "no usable filename in {}",
                request.url
            )));
        }

        let download = self.download(&request.url).await?;
        let (bucket_name, credentials) = self.bucket_access(request.bucket_id).await?;
        let keys = usable_keys(&credentials)?;

        let object = self
            .objects
            .create_pending(request.bucket_id, &filename, request.added_by, ObjectSource::Bot)
            .await?;
        let object_ref = ObjectRef {
            object_id: object.id,
            bucket_id: object.bucket_id,
        };
        let key = object
            .storage_key()
            .ok_or_else(|| ServiceError::validation("filename yields no storage key"))?;

        let size = download.body.len() as i64;
        let content_type = download
            .content_type
            .or_else(|| guess_content_type(&filename));
        let put = self
            .storage
            .put(
                &keys,
                PutRequest {
                    bucket: &bucket_name,
                    key: &key,
                    body: download.body,
                    content_type: content_type.as_deref(),
                    content_md5: Some(&STANDARD.encode(download.md5)),
                },
            )
            .await;
        if let Err(err) = put {
            let message = err.to_string();
            self.objects
                .complete(object_ref, false, Some(json!({ "storage": message })), None)
                .await?;
            return Err(ServiceError::StorageWriteFailed(message));
        }

        let mut extra = serde_json::Map::new();
        extra.insert("md5".into(), Value::String(hex(&download.md5)));
        let metadata = FileMetadata {
            size: Some(size),
            content_type,
            duration: None,
            width: None,
            height: None,
            extra,
        };

        let mut tx = self.db.begin().await?;
        let object = self
            .objects
            .complete_in(&mut tx, object_ref, true, None, Some(metadata))
            .await?;
        sqlx::query(
            "UPDATE url_fetch_requests SET completed = 1, object_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(object.id)
        .bind(self.clock.now())
        .bind(request.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.objects.invalidate(&object).await;
        Ok(object)
    }

    async fn download(&self, url: &str) -> ServiceResult<Download> {
        let upstream = |e: reqwest::Error| ServiceError::UpstreamFetchFailed(e.to_string());
        let response = self
            .http
            .get(url)
            .timeout(self.fetch.timeout)
            .send()
            .await
            .map_err(upstream)?
            .error_for_status()
            .map_err(upstream)?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let mut body = BytesMut::new();
        let mut digest = Context::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(upstream)?;
            if (body.len() + chunk.len()) as u64 > self.fetch.max_bytes {
                return Err(ServiceError::UpstreamFetchFailed(format!(
                    "{} exceeds {} bytes",
                    url, self.fetch.max_bytes
                )));
            }
            digest.consume(&chunk);
            body.extend_from_slice(&chunk);
        }

        Ok(Download {
            body: body.freeze(),
            content_type,
            md5: digest.compute().0,
        })
    }
}

struct Download {
    body: bytes::Bytes,
    content_type: Option<String>,
    md5: [u8; 16],
}

fn usable_keys(credentials: &BucketCredentials) -> ServiceResult<AccessKeys> {
    credentials
        .access_keys()
        .ok_or_else(|| ServiceError::IssuanceFailed("credentials are missing secrets".into()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Last path segment of `url`, percent-decoded, or [`FALLBACK_FILENAME`].
pub fn filename_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            urlencoding::decode(&segment)
                .map(|decoded| decoded.into_owned())
                .unwrap_or(segment)
        })
        .unwrap_or_else(|| FALLBACK_FILENAME.to_string())
}
