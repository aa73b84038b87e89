//! A request to pull a remote URL into a bucket on the server side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Tracks one server-side URL import.
///
/// `tries` is bumped before every download attempt and `completed` guards
/// against re-running a finished import.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UrlFetchRequest {
    pub id: Uuid,

    /// Bucket receiving the fetched file.
    pub bucket_id: Uuid,

    /// Source URL.
    pub url: String,

    pub added_by: Option<Uuid>,

    /// Number of attempts started so far.
    pub tries: i64,

    pub completed: bool,

    /// Object created by the successful attempt.
    pub object_id: Option<Uuid>,

    /// Message of the most recent failed attempt.
    pub last_error: Option<String>,

    pub last_error_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl UrlFetchRequest {
    pub fn new(bucket_id: Uuid, url: &str, added_by: Option<Uuid>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            bucket_id,
            url: url.to_string(),
            added_by,
            tries: 0,
            completed: false,
            object_id: None,
            last_error: None,
            last_error_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
