//! Hands out bucket-scoped temporary credentials, reusing a live set when one
//! exists and asking the issuer for a new one otherwise.

use crate::clock::Clock;
use crate::cloudflare::{CredentialIssuer, IssueRequest};
use crate::errors::{ServiceError, ServiceResult};
use crate::models::bucket::Bucket;
use crate::models::credentials::{
    AccessKeys, BucketCredentials, DEFAULT_CREDENTIAL_TTL_SECONDS, Permission,
};
use crate::services::bucket_service::find_bucket;
use sqlx::SqlitePool;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What every newly issued credential set is scoped to.
#[derive(Debug, Clone)]
pub struct CredentialSettings {
    pub ttl_seconds: i64,
    pub permission: Permission,
    pub account_id: Option<String>,
    pub parent_access_key_id: Option<String>,
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: DEFAULT_CREDENTIAL_TTL_SECONDS,
            permission: Permission::ReadWrite,
            account_id: None,
            parent_access_key_id: None,
        }
    }
}

#[derive(Clone)]
pub struct CredentialService {
    pub db: Arc<SqlitePool>,
    issuer: Arc<dyn CredentialIssuer>,
    clock: Arc<dyn Clock>,
    settings: CredentialSettings,
    /// One issuance at a time per bucket.
    locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl CredentialService {
    pub fn new(
        db: Arc<SqlitePool>,
        issuer: Arc<dyn CredentialIssuer>,
        clock: Arc<dyn Clock>,
        settings: CredentialSettings,
    ) -> Self {
        Self {
            db,
            issuer,
            clock,
            settings,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Return the newest live credential set for the bucket, issuing one when
    /// none is left.
    pub async fn get_or_issue_credentials(&self, bucket_id: Uuid) -> ServiceResult<BucketCredentials> {
        let bucket = find_bucket(&self.db, bucket_id).await?;
        self.credentials_for(&bucket).await
    }

    /// Same as [`Self::get_or_issue_credentials`] for a bucket the caller already loaded.
    pub async fn credentials_for(&self, bucket: &Bucket) -> ServiceResult<BucketCredentials> {
        let bucket_id = bucket.id;
        let bucket_name = bucket
            .provisioned_name()
            .ok_or_else(|| {
                ServiceError::IssuanceFailed(format!("bucket {} is not provisioned", bucket_id))
            })?
            .to_string();

        if let Some(live) = self.find_live(bucket_id).await? {
            debug!("Reusing credentials {} for bucket {}", live.id, bucket_id);
            return Ok(live);
        }

        let lock = self.bucket_lock(bucket_id).await;
        let _guard = lock.lock().await;

        // Another task may have issued while we waited.
        if let Some(live) = self.find_live(bucket_id).await? {
            debug!("Reusing credentials {} for bucket {}", live.id, bucket_id);
            return Ok(live);
        }

        self.issue(bucket_id, &bucket_name).await
    }

    async fn find_live(&self, bucket_id: Uuid) -> ServiceResult<Option<BucketCredentials>> {
        let now = self.clock.now();
        let row = sqlx::query_as::<_, BucketCredentials>(
            "SELECT * FROM bucket_credentials
             WHERE bucket_id = ? AND expires_at >= ?
               AND access_key_id IS NOT NULL AND access_key_id != ''
               AND secret_access_key IS NOT NULL AND secret_access_key != ''
               AND session_token IS NOT NULL AND session_token != ''
             ORDER BY created_at DESC
             LIMIT 1",
        )
        .bind(bucket_id)
        .bind(now)
        .fetch_optional(&*self.db)
        .await?;
        Ok(row.filter(|c| c.is_usable() && c.is_live_at(now)))
    }

    async fn bucket_lock(&self, bucket_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(bucket_id).or_default().clone()
    }

    async fn issue(&self, bucket_id: Uuid, bucket_name: &str) -> ServiceResult<BucketCredentials> {
        let mut creds = BucketCredentials::new(
            bucket_id,
            self.settings.ttl_seconds,
            self.settings.permission,
            self.settings.account_id.clone(),
            self.settings.parent_access_key_id.clone(),
            self.clock.now(),
        );

        sqlx::query(
            "INSERT INTO bucket_credentials (id, bucket_id, account_id, parent_access_key_id,
                                             ttl_seconds, permission, expires_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(creds.id)
        .bind(creds.bucket_id)
        .bind(&creds.account_id)
        .bind(&creds.parent_access_key_id)
        .bind(creds.ttl_seconds)
        .bind(creds.permission)
        .bind(creds.expires_at)
        .bind(creds.created_at)
        .bind(creds.updated_at)
        .execute(&*self.db)
        .await?;

        let request = IssueRequest {
            bucket: bucket_name.to_string(),
            account_id: creds.account_id.clone(),
            parent_access_key_id: creds.parent_access_key_id.clone(),
            ttl_seconds: creds.ttl_seconds,
            permission: creds.permission,
        };
        let keys = self.issuer.issue(&request).await.map_err(|e| {
            warn!("Credential issuance for bucket {} failed: {}", bucket_id, e);
            ServiceError::IssuanceFailed(e.to_string())
        })?;
        let AccessKeys {
            access_key_id,
            secret_access_key,
            session_token,
        } = keys;

        creds.access_key_id = Some(access_key_id);
        creds.secret_access_key = Some(secret_access_key);
        creds.session_token = Some(session_token);
        creds.updated_at = self.clock.now();

        sqlx::query(
            "UPDATE bucket_credentials
             SET access_key_id = ?, secret_access_key = ?, session_token = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&creds.access_key_id)
        .bind(&creds.secret_access_key)
        .bind(&creds.session_token)
        .bind(creds.updated_at)
        .bind(creds.id)
        .execute(&*self.db)
        .await?;

        if !creds.is_usable() {
            warn!("Issuer returned incomplete credentials for bucket {}", bucket_id);
            return Err(ServiceError::IssuanceFailed(
                "issuer returned incomplete credentials".into(),
            ));
        }

        info!(
            "Issued credentials {} for bucket {} (expires {})",
            creds.id, bucket_id, creds.expires_at
        );
        Ok(creds)
    }
}
