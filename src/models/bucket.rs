//! Represents a tenant's bucket, the container every object and credential set hangs off.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Storage class requested from the provider when the bucket is created.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
pub enum StorageClass {
    Standard,
    InfrequentAccess,
}

/// Jurisdiction hint passed to the provider at bucket creation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum LocationHint {
    Apac,
    Eeur,
    Enam,
    Weur,
    Wnam,
    Auto,
}

impl LocationHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationHint::Apac => "apac",
            LocationHint::Eeur => "eeur",
            LocationHint::Enam => "enam",
            LocationHint::Weur => "weur",
            LocationHint::Wnam => "wnam",
            LocationHint::Auto => "auto",
        }
    }
}

/// One storage bucket per tenant.
///
/// The row exists before the provider has created the remote bucket; `name`
/// is only filled in when the bucket is activated, and activation never
/// reverses.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    /// Unique identifier for this bucket.
    pub id: Uuid,

    /// Tenant (project, workspace...) owning the bucket.
    pub tenant_id: Uuid,

    /// Provider-side bucket name, absent until provisioned.
    pub name: Option<String>,

    pub storage_class: StorageClass,

    pub location_hint: LocationHint,

    /// Whether the provider confirmed the bucket exists.
    pub active: bool,

    /// When the bucket was activated.
    pub activated_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Bucket {
    /// Provider name of an activated bucket.
    pub fn provisioned_name(&self) -> Option<&str> {
        if self.active {
            self.name.as_deref()
        } else {
            None
        }
    }
}
