//! Tenant bucket rows and their one-way activation against the provider.

use crate::clock::Clock;
use crate::cloudflare::{BucketProvider, default_cors_rules};
use crate::db::is_unique_violation;
use crate::errors::{ServiceError, ServiceResult};
use crate::models::bucket::{Bucket, LocationHint, StorageClass};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::{fmt::Write as _, sync::Arc};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    /// `srv` in production, `srv-dev` elsewhere.
    pub name_prefix: String,
    pub cors_origins: Vec<String>,
    pub location_hint: LocationHint,
    pub storage_class: StorageClass,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            name_prefix: "srv-dev".into(),
            cors_origins: vec!["http://localhost:3000".into()],
            location_hint: LocationHint::Auto,
            storage_class: StorageClass::Standard,
        }
    }
}

/// Load a bucket by id.
pub async fn find_bucket(db: &SqlitePool, bucket_id: Uuid) -> ServiceResult<Bucket> {
    sqlx::query_as::<_, Bucket>("SELECT * FROM buckets WHERE id = ?")
        .bind(bucket_id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| ServiceError::not_found(format!("bucket {}", bucket_id)))
}

/// Provider-side name for a tenant: `{prefix}-{first 16 hex chars of sha256(tenant id)}`.
pub fn bucket_name_for(prefix: &str, tenant_id: Uuid) -> String {
    let digest = Sha256::digest(tenant_id.to_string().as_bytes());
    let mut name = format!("{}-", prefix);
    for byte in &digest[..8] {
        let _ = write!(name, "{:02x}", byte);
    }
    name
}

#[derive(Clone)]
pub struct BucketService {
    pub db: Arc<SqlitePool>,
    provider: Arc<dyn BucketProvider>,
    clock: Arc<dyn Clock>,
    settings: ProvisionSettings,
}

impl BucketService {
    pub fn new(
        db: Arc<SqlitePool>,
        provider: Arc<dyn BucketProvider>,
        clock: Arc<dyn Clock>,
        settings: ProvisionSettings,
    ) -> Self {
        Self {
            db,
            provider,
            clock,
            settings,
        }
    }

    pub async fn get_bucket(&self, bucket_id: Uuid) -> ServiceResult<Bucket> {
        find_bucket(&self.db, bucket_id).await
    }

    /// Get or create the tenant's bucket and try to activate it.
    ///
    /// Provider failures leave the bucket inactive; calling again retries.
    pub async fn ensure_bucket(&self, tenant_id: Uuid) -> ServiceResult<Bucket> {
        let bucket = self.get_or_create_row(tenant_id).await?;
        if bucket.active {
            return Ok(bucket);
        }

        let name = bucket_name_for(&self.settings.name_prefix, tenant_id);
        let registered = match self.provision(&name).await {
            Ok(registered) => registered,
            Err(message) => {
                warn!("Provisioning bucket {} failed: {}", name, message);
                return Ok(bucket);
            }
        };

        let now = self.clock.now();
        let activated = sqlx::query(
            "UPDATE buckets SET name = ?, active = 1, activated_at = ?, updated_at = ?
             WHERE id = ? AND active = 0",
        )
        .bind(&registered)
        .bind(now)
        .bind(now)
        .bind(bucket.id)
        .execute(&*self.db)
        .await?
        .rows_affected();
        if activated > 0 {
            info!("Activated bucket {} as {}", bucket.id, registered);
        }

        find_bucket(&self.db, bucket.id).await
    }

    async fn get_or_create_row(&self, tenant_id: Uuid) -> ServiceResult<Bucket> {
        if let Some(existing) = self.find_by_tenant(tenant_id).await? {
            return Ok(existing);
        }

        let now = self.clock.now();
        let bucket = Bucket {
            id: Uuid::new_v4(),
            tenant_id,
            name: None,
            storage_class: self.settings.storage_class,
            location_hint: self.settings.location_hint,
            active: false,
            activated_at: None,
            created_at: now,
            updated_at: now,
        };
        let inserted = sqlx::query(
            "INSERT INTO buckets (id, tenant_id, name, storage_class, location_hint, active,
                                  activated_at, created_at, updated_at)
             VALUES (?, ?, NULL, ?, ?, 0, NULL, ?, ?)",
        )
        .bind(bucket.id)
        .bind(bucket.tenant_id)
        .bind(bucket.storage_class)
        .bind(bucket.location_hint)
        .bind(bucket.created_at)
        .bind(bucket.updated_at)
        .execute(&*self.db)
        .await;

        match inserted {
            Ok(_) => {
                info!("Created bucket {} for tenant {}", bucket.id, tenant_id);
                Ok(bucket)
            }
            // Lost a race with a concurrent create for the same tenant.
            Err(err) if is_unique_violation(&err) => self
                .find_by_tenant(tenant_id)
                .await?
                .ok_or_else(|| ServiceError::not_found(format!("bucket for tenant {}", tenant_id))),
            Err(err) => Err(err.into()),
        }
    }

    async fn find_by_tenant(&self, tenant_id: Uuid) -> ServiceResult<Option<Bucket>> {
        let bucket = sqlx::query_as::<_, Bucket>("SELECT * FROM buckets WHERE tenant_id = ?")
            .bind(tenant_id)
            .fetch_optional(&*self.db)
            .await?;
        Ok(bucket)
    }

    async fn provision(&self, name: &str) -> Result<String, String> {
        let registered = self
            .provider
            .create_bucket(name, self.settings.location_hint, self.settings.storage_class)
            .await
            .map_err(|e| e.to_string())?;
        let rules = default_cors_rules(&self.settings.cors_origins);
        self.provider
            .update_cors(&registered, &rules)
            .await
            .map_err(|e| e.to_string())?;
        Ok(registered)
    }
}
