use crate::models::credentials::AccessKeys;
use crate::storage::{ObjectStorage, PresignOperation, PresignRequest, PutRequest, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// A stored object as seen by [`FakeStorage`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub body: Bytes,
    pub content_type: Option<String>,
    pub content_md5: Option<String>,
    pub access_key_id: String,
}

/// In-memory [`ObjectStorage`] for tests.
///
/// Presigned URLs are deterministic strings that expose every input so tests
/// can assert on them.
#[derive(Clone, Default)]
pub struct FakeStorage {
    objects: Arc<Mutex<HashMap<(String, String), StoredObject>>>,
    fail_puts: Arc<Mutex<HashSet<String>>>,
    fail_presign: Arc<Mutex<bool>>,
}

impl FakeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every put to `bucket` fail.
    pub async fn fake_fail_puts(&self, bucket: &str) {
        self.fail_puts.lock().await.insert(bucket.to_string());
    }

    pub async fn fake_fail_presign(&self) {
        *self.fail_presign.lock().await = true;
    }

    pub async fn fake_insert(&self, bucket: &str, key: &str, body: Bytes) {
        self.objects.lock().await.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body,
                content_type: None,
                content_md5: None,
                access_key_id: String::new(),
            },
        );
    }

    pub async fn stored(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub async fn object_count(&self) -> usize {
        self.objects.lock().await.len()
    }
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn put(&self, keys: &AccessKeys, request: PutRequest<'_>) -> Result<(), StorageError> {
        if self.fail_puts.lock().await.contains(request.bucket) {
            return Err(StorageError::Put {
                key: request.key.to_string(),
                message: "simulated failure".into(),
            });
        }
        self.objects.lock().await.insert(
            (request.bucket.to_string(), request.key.to_string()),
            StoredObject {
                body: request.body,
                content_type: request.content_type.map(str::to_string),
                content_md5: request.content_md5.map(str::to_string),
                access_key_id: keys.access_key_id.clone(),
            },
        );
        Ok(())
    }

    async fn presigned_url(
        &self,
        keys: &AccessKeys,
        request: PresignRequest<'_>,
    ) -> Result<String, StorageError> {
        if *self.fail_presign.lock().await {
            return Err(StorageError::Presign {
                key: request.key.to_string(),
                message: "simulated failure".into(),
            });
        }
        let method = match request.operation {
            PresignOperation::Get => "GET",
            PresignOperation::Put => "PUT",
        };
        let mut url = format!(
            "https://fake.storage/{}/{}?method={}&access_key={}&expires={}",
            request.bucket,
            request.key,
            method,
            keys.access_key_id,
            request.expires_in.as_secs()
        );
        if let Some(disposition) = &request.params.content_disposition {
            url.push_str("&disposition=");
            url.push_str(disposition);
        }
        Ok(url)
    }

    async fn delete(
        &self,
        _keys: &AccessKeys,
        bucket: &str,
        key: &str,
    ) -> Result<(), StorageError> {
        self.objects
            .lock()
            .await
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}
