use crate::models::credentials::AccessKeys;
use crate::storage::{
    ObjectStorage, PresignOperation, PresignRequest, PutRequest, StorageError,
};
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Region},
    error::DisplayErrorContext,
    presigning::PresigningConfig,
    primitives::ByteStream,
};
use tracing::debug;

/// Connection settings shared by every per-credential client.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// Custom endpoint, e.g. `https://<account>.r2.cloudflarestorage.com`.
    pub endpoint: Option<String>,
    pub region: String,
    pub force_path_style: bool,
}

/// S3-compatible storage backed by `aws-sdk-s3`.
#[derive(Debug, Clone)]
pub struct S3ObjectStorage {
    settings: StorageSettings,
}

impl S3ObjectStorage {
    pub fn new(settings: StorageSettings) -> Self {
        Self { settings }
    }

    /// Build a client signing with the given temporary keys.
    fn client_for(&self, keys: &AccessKeys) -> Client {
        let credentials = Credentials::new(
            keys.access_key_id.clone(),
            keys.secret_access_key.clone(),
            Some(keys.session_token.clone()),
            None,
            "BucketCredentials",
        );

        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(self.settings.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(self.settings.force_path_style);
        if let Some(endpoint) = &self.settings.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Client::from_conf(builder.build())
    }
}

#[async_trait]
impl ObjectStorage for S3ObjectStorage {
    async fn put(&self, keys: &AccessKeys, request: PutRequest<'_>) -> Result<(), StorageError> {
        debug!(
            "Putting {} bytes to {}/{}",
            request.body.len(),
            request.bucket,
            request.key
        );
        self.client_for(keys)
            .put_object()
            .bucket(request.bucket)
            .key(request.key)
            .body(ByteStream::from(request.body))
            .set_content_type(request.content_type.map(str::to_string))
            .set_content_md5(request.content_md5.map(str::to_string))
            .send()
            .await
            .map_err(|e| StorageError::Put {
                key: request.key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;
        Ok(())
    }

    async fn presigned_url(
        &self,
        keys: &AccessKeys,
        request: PresignRequest<'_>,
    ) -> Result<String, StorageError> {
        let presign_err = |message: String| StorageError::Presign {
            key: request.key.to_string(),
            message,
        };
        let config = PresigningConfig::builder()
            .start_time(request.start_time)
            .expires_in(request.expires_in)
            .build()
            .map_err(|e| presign_err(e.to_string()))?;

        let client = self.client_for(keys);
        let presigned = match request.operation {
            PresignOperation::Put => client
                .put_object()
                .bucket(request.bucket)
                .key(request.key)
                .presigned(config)
                .await
                .map_err(|e| presign_err(DisplayErrorContext(&e).to_string()))?,
            PresignOperation::Get => client
                .get_object()
                .bucket(request.bucket)
                .key(request.key)
                .set_response_content_disposition(request.params.content_disposition.clone())
                .presigned(config)
                .await
                .map_err(|e| presign_err(DisplayErrorContext(&e).to_string()))?,
        };
        Ok(presigned.uri().to_string())
    }

    async fn delete(
        &self,
        keys: &AccessKeys,
        bucket: &str,
        key: &str,
    ) -> Result<(), StorageError> {
        self.client_for(keys)
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::Delete {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;
        debug!("Deleted {}/{}", bucket, key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PresignParams;
    use std::time::{Duration, SystemTime};

    fn storage() -> S3ObjectStorage {
        S3ObjectStorage::new(StorageSettings {
            endpoint: Some("https://account.r2.cloudflarestorage.com".into()),
            region: "auto".into(),
            force_path_style: true,
        })
    }

    fn keys() -> AccessKeys {
        AccessKeys {
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "wJalrXUtnFEMI".into(),
            session_token: "session-token".into(),
        }
    }

    #[tokio::test]
    async fn test_presign_get_offline() {
        let url = storage()
            .presigned_url(
                &keys(),
                PresignRequest {
                    operation: PresignOperation::Get,
                    bucket: "srv-0123456789abcdef",
                    key: "2025/3/4/report_abcde.pdf",
                    params: PresignParams {
                        content_disposition: Some("attachment".into()),
                    },
                    expires_in: Duration::from_secs(60 * 60 * 24 * 7),
                    start_time: SystemTime::now(),
                },
            )
            .await
            .unwrap();

        assert!(url.starts_with(
            "https://account.r2.cloudflarestorage.com/srv-0123456789abcdef/2025/3/4/report_abcde.pdf?"
        ));
        assert!(url.contains("X-Amz-Signature="));
        assert!(url.contains("X-Amz-Security-Token=session-token"));
        assert!(url.contains("response-content-disposition=attachment"));
        assert!(url.contains("X-Amz-Expires=604800"));
    }

    #[tokio::test]
    async fn test_presign_rejects_expiry_over_a_week() {
        let result = storage()
            .presigned_url(
                &keys(),
                PresignRequest {
                    operation: PresignOperation::Put,
                    bucket: "bucket",
                    key: "k",
                    params: PresignParams::default(),
                    expires_in: Duration::from_secs(60 * 60 * 24 * 8),
                    start_time: SystemTime::now(),
                },
            )
            .await;
        assert!(matches!(result, Err(StorageError::Presign { .. })));
    }
}
