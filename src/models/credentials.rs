//! Temporary, bucket-scoped access keys handed out by the credential issuer.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Default lifetime of an issued credential set: one day.
pub const DEFAULT_CREDENTIAL_TTL_SECONDS: i64 = 60 * 60 * 24;

/// Permission scope of a credential set.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
pub enum Permission {
    #[serde(rename = "object-read-write")]
    #[sqlx(rename = "object-read-write")]
    ReadWrite,
    #[serde(rename = "object-read")]
    #[sqlx(rename = "object-read")]
    ReadOnly,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::ReadWrite => "object-read-write",
            Permission::ReadOnly => "object-read",
        }
    }
}

/// A scoped, expiring grant against one bucket.
///
/// Rows are written before the issuer is called, so a failed issuance leaves a
/// row without secrets behind. Such a row is never usable.
#[derive(Clone, FromRow)]
pub struct BucketCredentials {
    pub id: Uuid,
    pub bucket_id: Uuid,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub account_id: Option<String>,
    pub parent_access_key_id: Option<String>,
    pub ttl_seconds: i64,
    pub permission: Permission,
    /// `created_at + ttl_seconds`, fixed at creation.
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The three secrets needed to sign requests with a credential set.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessKeys {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
}

impl BucketCredentials {
    /// Build a fresh row whose expiry is derived from its creation time.
    pub fn new(
        bucket_id: Uuid,
        ttl_seconds: i64,
        permission: Permission,
        account_id: Option<String>,
        parent_access_key_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            bucket_id,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            account_id,
            parent_access_key_id,
            ttl_seconds,
            permission,
            expires_at: now + Duration::seconds(ttl_seconds),
            created_at: now,
            updated_at: now,
        }
    }

    /// Secrets, if all three are present and non-empty.
    pub fn access_keys(&self) -> Option<AccessKeys> {
        let non_empty = |v: &Option<String>| v.as_deref().filter(|s| !s.is_empty()).map(str::to_string);
        Some(AccessKeys {
            access_key_id: non_empty(&self.access_key_id)?,
            secret_access_key: non_empty(&self.secret_access_key)?,
            session_token: non_empty(&self.session_token)?,
        })
    }

    pub fn is_usable(&self) -> bool {
        self.access_keys().is_some()
    }

    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at >= now
    }
}

impl fmt::Debug for BucketCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("BucketCredentials")
            .field("id", &self.id)
            .field("bucket_id", &self.bucket_id)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &redact(&self.secret_access_key))
            .field("session_token", &redact(&self.session_token))
            .field("permission", &self.permission)
            .field("ttl_seconds", &self.ttl_seconds)
            .field("expires_at", &self.expires_at)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl fmt::Debug for AccessKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessKeys")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(now: DateTime<Utc>) -> BucketCredentials {
        BucketCredentials::new(
            Uuid::new_v4(),
            DEFAULT_CREDENTIAL_TTL_SECONDS,
            Permission::ReadWrite,
            Some("account".into()),
            Some("parent".into()),
            now,
        )
    }

    #[test]
    fn test_expiry_is_created_plus_ttl() {
        let now = Utc.with_ymd_and_hms(2025, 3, 4, 10, 0, 0).unwrap();
        let creds = sample(now);
        assert_eq!(creds.expires_at, now + Duration::seconds(86_400));
        assert!(creds.is_live_at(now + Duration::seconds(86_400)));
        assert!(!creds.is_live_at(now + Duration::seconds(86_401)));
    }

    #[test]
    fn test_missing_secret_is_unusable() {
        let mut creds = sample(Utc::now());
        assert!(!creds.is_usable());

        creds.access_key_id = Some("AKID".into());
        creds.secret_access_key = Some("secret".into());
        creds.session_token = Some(String::new());
        assert!(!creds.is_usable());

        creds.session_token = Some("token".into());
        assert!(creds.is_usable());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut creds = sample(Utc::now());
        creds.secret_access_key = Some("super-secret".into());
        creds.session_token = Some("session-secret".into());
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("session-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
