//! Object rows: creation, completion, cached lookups and paginated listings.
//!
//! Every mutation goes through here so the object and listing caches are
//! invalidated in one place.

use crate::cache::{TtlCache, get_json, set_json};
use crate::clock::Clock;
use crate::errors::{ServiceError, ServiceResult};
use crate::formatting::normalize_filename;
use crate::models::object::{FileMetadata, OBJECT_COLUMNS, Object, ObjectSource};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction, types::Json};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;

/// How long the listing generation marker outlives any single listing entry.
const GENERATION_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    pub object_ttl: Duration,
    pub listing_ttl: Duration,
    /// Sliding window for the repeated-listing heuristic.
    pub refresh_window: Duration,
    /// Listing requests within the window that force a refresh.
    pub refresh_threshold: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            object_ttl: Duration::seconds(300),
            listing_ttl: Duration::seconds(300),
            refresh_window: Duration::seconds(10),
            refresh_threshold: 3,
        }
    }
}

/// Identifies an object within the bucket that must own it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRef {
    pub object_id: Uuid,
    pub bucket_id: Uuid,
}

/// One page of results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: i64,
    pub page_size: i64,
    pub total: i64,
    pub num_pages: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub force_refresh: bool,
    /// Caller the refresh heuristic tracks; `None` disables it.
    pub client: Option<String>,
}

/// Notices a caller hammering the listing endpoint (usually someone waiting
/// for an upload to show up) and lets them skip the cache.
#[derive(Default)]
struct RefreshTracker {
    history: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl RefreshTracker {
    /// Only callers seen within the window are kept.
    async fn record(&self, client: &str, now: DateTime<Utc>, settings: &CacheSettings) -> bool {
        let mut history = self.history.lock().await;
        history.retain(|_, hits| {
            hits.retain(|at| now - *at <= settings.refresh_window);
            !hits.is_empty()
        });
        let hits = history.entry(client.to_string()).or_default();
        hits.push(now);
        if hits.len() >= settings.refresh_threshold {
            history.remove(client);
            return true;
        }
        false
    }
}

fn object_key(object_id: Uuid) -> String {
    format!("r2:object:{}", object_id)
}

fn generation_key(bucket_id: Uuid) -> String {
    format!("r2:bucket:{}:generation", bucket_id)
}

fn listing_key(bucket_id: Uuid, generation: &str, page: i64, page_size: i64) -> String {
    format!("r2:bucket:{}:objects:{}:{}:{}", bucket_id, generation, page, page_size)
}

#[derive(Clone)]
pub struct ObjectService {
    pub db: Arc<SqlitePool>,
    cache: Arc<dyn TtlCache>,
    clock: Arc<dyn Clock>,
    settings: CacheSettings,
    tracker: Arc<RefreshTracker>,
}

impl ObjectService {
    pub fn new(
        db: Arc<SqlitePool>,
        cache: Arc<dyn TtlCache>,
        clock: Arc<dyn Clock>,
        settings: CacheSettings,
    ) -> Self {
        Self {
            db,
            cache,
            clock,
            settings,
            tracker: Arc::new(RefreshTracker::default()),
        }
    }

    /// Create a pending object with its derived names filled in.
    pub async fn create_pending(
        &self,
        bucket_id: Uuid,
        filename: &str,
        added_by: Option<Uuid>,
        source: ObjectSource,
    ) -> ServiceResult<Object> {
        if normalize_filename(Some(filename), None, 0).is_none() {
            return Err(ServiceError::validation(format!(
                "filename `{}` yields no usable name",
                filename
            )));
        }

        let now = self.clock.now();
        let mut object = Object::pending(bucket_id, filename, added_by, source, now);
        object.prepare_save(now);

        let mut conn = self.db.acquire().await?;
        insert_object(&mut conn, &object).await?;
        drop(conn);

        debug!("Created pending object {} in bucket {}", object.id, bucket_id);
        self.invalidate_bucket_listing(bucket_id).await;
        Ok(object)
    }

    /// Record the outcome of an upload in its own transaction.
    pub async fn complete(
        &self,
        object_ref: ObjectRef,
        uploaded: bool,
        errors: Option<Value>,
        metadata: Option<FileMetadata>,
    ) -> ServiceResult<Object> {
        let mut tx = self.db.begin().await?;
        let object = self
            .complete_in(&mut tx, object_ref, uploaded, errors, metadata)
            .await?;
        tx.commit().await?;
        self.invalidate(&object).await;
        Ok(object)
    }

    /// Record the outcome of an upload inside the caller's transaction.
    ///
    /// Caches are left alone; invalidate them with [`ObjectService::invalidate`]
    /// once the transaction commits.
    pub async fn complete_in(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        object_ref: ObjectRef,
        uploaded: bool,
        errors: Option<Value>,
        metadata: Option<FileMetadata>,
    ) -> ServiceResult<Object> {
        let mut object = select_object(&mut **tx, object_ref.object_id)
            .await?
            .filter(|o| o.bucket_id == object_ref.bucket_id)
            .ok_or_else(|| ServiceError::not_found(format!("object {}", object_ref.object_id)))?;

        if let Some(metadata) = metadata {
            object.apply_file_metadata(metadata);
        }
        object.uploaded = uploaded;
        object.errors = errors.map(Json);
        object.prepare_save(self.clock.now());

        update_object(&mut **tx, &object).await?;
        info!("Object {} is now {:?}", object.id, object.state());
        Ok(object)
    }

    /// Cached lookup by id.
    pub async fn get(&self, object_id: Uuid, force_refresh: bool) -> ServiceResult<Option<Object>> {
        let key = object_key(object_id);
        if !force_refresh {
            if let Some(cached) = get_json::<Object>(self.cache.as_ref(), &key).await {
                debug!("Cache hit for {}", key);
                return Ok(Some(cached));
            }
        }

        debug!("Cache miss for {}", key);
        let mut conn = self.db.acquire().await?;
        let object = select_object(&mut conn, object_id).await?;
        if let Some(object) = &object {
            set_json(self.cache.as_ref(), &key, object, self.settings.object_ttl).await;
        }
        Ok(object)
    }

    /// Lookup restricted to one bucket; objects of other buckets are reported missing.
    pub async fn get_in_bucket(&self, bucket_id: Uuid, object_id: Uuid) -> ServiceResult<Object> {
        self.get(object_id, false)
            .await?
            .filter(|o| o.bucket_id == bucket_id)
            .ok_or_else(|| ServiceError::not_found(format!("object {}", object_id)))
    }

    /// Newest-first page of a bucket's objects.
    ///
    /// `page` below 1 is treated as 1 and a page past the end as the last page.
    pub async fn list_for_bucket(
        &self,
        bucket_id: Uuid,
        page: i64,
        page_size: i64,
        options: &ListOptions,
    ) -> ServiceResult<Page<Object>> {
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let now = self.clock.now();

        let mut bypass = options.force_refresh;
        if let Some(client) = &options.client {
            if self.tracker.record(client, now, &self.settings).await {
                debug!("{} keeps listing bucket {}, skipping cache", client, bucket_id);
                bypass = true;
            }
        }

        let generation = self.listing_generation(bucket_id).await;
        let key = listing_key(bucket_id, &generation, page, page_size);
        if !bypass {
            if let Some(cached) = get_json::<Page<Object>>(self.cache.as_ref(), &key).await {
                debug!("Cache hit for {}", key);
                return Ok(cached);
            }
        }

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM objects WHERE bucket_id = ?")
            .bind(bucket_id)
            .fetch_one(&*self.db)
            .await?;
        let num_pages = ((total + page_size - 1) / page_size).max(1);
        let current = page.clamp(1, num_pages);

        let items = sqlx::query_as::<_, Object>(&format!(
            "SELECT {} FROM objects WHERE bucket_id = ?
             ORDER BY created_at DESC, id DESC
             LIMIT ? OFFSET ?",
            OBJECT_COLUMNS
        ))
        .bind(bucket_id)
        .bind(page_size)
        .bind((current - 1) * page_size)
        .fetch_all(&*self.db)
        .await?;

        let result = Page {
            items,
            page: current,
            page_size,
            total,
            num_pages,
        };
        set_json(self.cache.as_ref(), &key, &result, self.settings.listing_ttl).await;
        Ok(result)
    }

    /// Delete the row and drop it from every cache.
    pub async fn remove(&self, object: &Object) -> ServiceResult<()> {
        sqlx::query("DELETE FROM objects WHERE id = ?")
            .bind(object.id)
            .execute(&*self.db)
            .await?;
        info!("Removed object {} from bucket {}", object.id, object.bucket_id);
        self.invalidate(object).await;
        Ok(())
    }

    /// Drop the object entry and every cached listing page of its bucket.
    pub async fn invalidate(&self, object: &Object) {
        self.invalidate_object(object.id).await;
        self.invalidate_bucket_listing(object.bucket_id).await;
    }

    pub async fn invalidate_object(&self, object_id: Uuid) {
        self.cache.delete(&object_key(object_id)).await;
    }

    /// Start a new listing generation; pages cached under the old one are never read again.
    pub async fn invalidate_bucket_listing(&self, bucket_id: Uuid) {
        let generation = Uuid::new_v4().simple().to_string();
        set_json(
            self.cache.as_ref(),
            &generation_key(bucket_id),
            &generation,
            Duration::hours(GENERATION_TTL_HOURS),
        )
        .await;
    }

    async fn listing_generation(&self, bucket_id: Uuid) -> String {
        let key = generation_key(bucket_id);
        match get_json::<String>(self.cache.as_ref(), &key).await {
            Some(generation) => generation,
            None => {
                let generation = Uuid::new_v4().simple().to_string();
                set_json(
                    self.cache.as_ref(),
                    &key,
                    &generation,
                    Duration::hours(GENERATION_TTL_HOURS),
                )
                .await;
                generation
            }
        }
    }
}

async fn select_object(conn: &mut SqliteConnection, object_id: Uuid) -> ServiceResult<Option<Object>> {
    let object = sqlx::query_as::<_, Object>(&format!(
        "SELECT {} FROM objects WHERE id = ?",
        OBJECT_COLUMNS
    ))
    .bind(object_id)
    .fetch_optional(conn)
    .await?;
    Ok(object)
}

async fn insert_object(conn: &mut SqliteConnection, object: &Object) -> ServiceResult<()> {
    sqlx::query(&format!(
        "INSERT INTO objects ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        OBJECT_COLUMNS
    ))
    .bind(object.id)
    .bind(object.bucket_id)
    .bind(object.added_by)
    .bind(object.source)
    .bind(&object.keyname)
    .bind(&object.downloadable_filename)
    .bind(&object.filename)
    .bind(&object.file_extension)
    .bind(object.uploaded_width)
    .bind(object.uploaded_height)
    .bind(object.uploaded_size)
    .bind(&object.display_size)
    .bind(&object.uploaded_type)
    .bind(object.is_image_file)
    .bind(object.is_video_file)
    .bind(object.is_audio_file)
    .bind(&object.uploaded_metadata)
    .bind(object.uploaded_duration)
    .bind(object.uploaded)
    .bind(object.uploaded_at)
    .bind(&object.errors)
    .bind(object.errors_at)
    .bind(object.created_at)
    .bind(object.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn update_object(conn: &mut SqliteConnection, object: &Object) -> ServiceResult<()> {
    sqlx::query(
        "UPDATE objects SET
            keyname = ?, downloadable_filename = ?, file_extension = ?,
            uploaded_width = ?, uploaded_height = ?, uploaded_size = ?, display_size = ?,
            uploaded_type = ?, is_image_file = ?, is_video_file = ?, is_audio_file = ?,
            uploaded_metadata = ?, uploaded_duration = ?, uploaded = ?, uploaded_at = ?,
            errors = ?, errors_at = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(&object.keyname)
    .bind(&object.downloadable_filename)
    .bind(&object.file_extension)
    .bind(object.uploaded_width)
    .bind(object.uploaded_height)
    .bind(object.uploaded_size)
    .bind(&object.display_size)
    .bind(&object.uploaded_type)
    .bind(object.is_image_file)
    .bind(object.is_video_file)
    .bind(object.is_audio_file)
    .bind(&object.uploaded_metadata)
    .bind(object.uploaded_duration)
    .bind(object.uploaded)
    .bind(object.uploaded_at)
    .bind(&object.errors)
    .bind(object.errors_at)
    .bind(object.updated_at)
    .bind(object.id)
    .execute(conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::models::bucket::Bucket;
    use crate::models::object::ObjectState;
    use crate::test_utils::{ManualClock, seed_bucket, test_pool};
    use serde_json::json;

    struct Harness {
        service: ObjectService,
        clock: Arc<ManualClock>,
        db: Arc<SqlitePool>,
        bucket: Bucket,
    }

    async fn harness() -> Harness {
        let db = Arc::new(test_pool().await);
        let clock = Arc::new(ManualClock::default());
        let cache = Arc::new(MemoryCache::new(clock.clone()));
        let service = ObjectService::new(db.clone(), cache, clock.clone(), CacheSettings::default());
        let bucket = seed_bucket(&db, "srv-objects").await;
        Harness {
            service,
            clock,
            db,
            bucket,
        }
    }

    fn reference(object: &Object) -> ObjectRef {
        ObjectRef {
            object_id: object.id,
            bucket_id: object.bucket_id,
        }
    }

    fn metadata(size: i64, content_type: &str) -> FileMetadata {
        serde_json::from_value(json!({"size": size, "type": content_type})).unwrap()
    }

    #[tokio::test]
    async fn test_create_pending_derives_names() {
        let h = harness().await;
        let object = h
            .service
            .create_pending(h.bucket.id, "My Report.PDF", None, ObjectSource::User)
            .await
            .unwrap();

        let prefix: String = object.id.to_string().chars().take(5).collect();
        assert_eq!(object.keyname, Some(format!("my_report_{}.PDF", prefix)));
        assert_eq!(object.file_extension.as_deref(), Some("PDF"));
        assert_eq!(object.state(), ObjectState::Pending);
        assert_eq!(
            object.storage_key(),
            Some(format!("2025/3/4/my_report_{}.PDF", prefix))
        );
    }

    #[tokio::test]
    async fn test_create_pending_rejects_unusable_filename() {
        let h = harness().await;
        for filename in ["", "!!!"] {
            let err = h
                .service
                .create_pending(h.bucket.id, filename, None, ObjectSource::User)
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::Validation(_)));
        }
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM objects")
            .fetch_one(&*h.db)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_complete_sets_media_flags_and_size() {
        let h = harness().await;
        let object = h
            .service
            .create_pending(h.bucket.id, "photo.png", None, ObjectSource::User)
            .await
            .unwrap();

        let done = h
            .service
            .complete(reference(&object), true, None, Some(metadata(100, "image/png")))
            .await
            .unwrap();
        assert!(done.is_image_file);
        assert!(!done.is_video_file);
        assert!(!done.is_audio_file);
        assert!(done.uploaded_at.is_some());
        assert_eq!(done.display_size.as_deref(), Some("100 B"));
        assert_eq!(done.uploaded_type.as_deref(), Some("image/png"));
        assert_eq!(done.state(), ObjectState::Uploaded);
    }

    #[tokio::test]
    async fn test_second_completion_keeps_first_timestamp() {
        let h = harness().await;
        let object = h
            .service
            .create_pending(h.bucket.id, "clip.mp4", None, ObjectSource::User)
            .await
            .unwrap();

        let first = h
            .service
            .complete(reference(&object), true, None, None)
            .await
            .unwrap();
        h.clock.advance(Duration::minutes(5));
        let second = h
            .service
            .complete(reference(&object), false, Some(json!({"x": 1})), None)
            .await
            .unwrap();

        assert_eq!(second.uploaded_at, first.uploaded_at);
        assert_eq!(second.errors_at, Some(h.clock.now()));
        assert_eq!(second.state(), ObjectState::Errored);
    }

    #[tokio::test]
    async fn test_complete_is_scoped_to_bucket() {
        let h = harness().await;
        let other = seed_bucket(&h.db, "srv-other").await;
        let object = h
            .service
            .create_pending(h.bucket.id, "a.txt", None, ObjectSource::User)
            .await
            .unwrap();

        let err = h
            .service
            .complete(
                ObjectRef {
                    object_id: object.id,
                    bucket_id: other.id,
                },
                true,
                None,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));

        let err = h.service.get_in_bucket(other.id, object.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        let stored = h.service.get(object.id, true).await.unwrap().unwrap();
        assert!(!stored.uploaded);
    }

    #[tokio::test]
    async fn test_get_is_cached_until_invalidated() {
        let h = harness().await;
        let object = h
            .service
            .create_pending(h.bucket.id, "a.txt", None, ObjectSource::User)
            .await
            .unwrap();
        h.service.get(object.id, false).await.unwrap().unwrap();

        sqlx::query("UPDATE objects SET uploaded = 1 WHERE id = ?")
            .bind(object.id)
            .execute(&*h.db)
            .await
            .unwrap();
        assert!(!h.service.get(object.id, false).await.unwrap().unwrap().uploaded);
        assert!(h.service.get(object.id, true).await.unwrap().unwrap().uploaded);

        h.service.remove(&object).await.unwrap();
        assert!(h.service.get(object.id, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_listing_is_newest_first_and_cached() {
        let h = harness().await;
        let mut ids = Vec::new();
        for name in ["one.txt", "two.txt", "three.txt"] {
            let object = h
                .service
                .create_pending(h.bucket.id, name, None, ObjectSource::User)
                .await
                .unwrap();
            ids.push(object.id);
            h.clock.advance(Duration::seconds(1));
        }

        let page = h
            .service
            .list_for_bucket(h.bucket.id, 1, 2, &ListOptions::default())
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.num_pages, 2);
        let listed: Vec<Uuid> = page.items.iter().map(|o| o.id).collect();
        assert_eq!(listed, vec![ids[2], ids[1]]);

        // Out-of-band change is hidden by the cache until it expires.
        sqlx::query("DELETE FROM objects WHERE id = ?")
            .bind(ids[2])
            .execute(&*h.db)
            .await
            .unwrap();
        let cached = h
            .service
            .list_for_bucket(h.bucket.id, 1, 2, &ListOptions::default())
            .await
            .unwrap();
        assert_eq!(cached.items[0].id, ids[2]);

        h.clock.advance(Duration::seconds(301));
        let fresh = h
            .service
            .list_for_bucket(h.bucket.id, 1, 2, &ListOptions::default())
            .await
            .unwrap();
        assert_eq!(fresh.total, 2);
        assert_eq!(fresh.items[0].id, ids[1]);
    }

    #[tokio::test]
    async fn test_listing_pages_clamp() {
        let h = harness().await;
        for name in ["a.txt", "b.txt", "c.txt"] {
            h.service
                .create_pending(h.bucket.id, name, None, ObjectSource::User)
                .await
                .unwrap();
            h.clock.advance(Duration::seconds(1));
        }
        let last = h
            .service
            .list_for_bucket(h.bucket.id, 99, 2, &ListOptions::default())
            .await
            .unwrap();
        assert_eq!(last.page, 2);
        assert_eq!(last.items.len(), 1);

        let first = h
            .service
            .list_for_bucket(h.bucket.id, 0, 2, &ListOptions::default())
            .await
            .unwrap();
        assert_eq!(first.page, 1);

        let empty = h
            .service
            .list_for_bucket(seed_bucket(&h.db, "srv-empty").await.id, 3, 10, &ListOptions::default())
            .await
            .unwrap();
        assert_eq!(empty.page, 1);
        assert_eq!(empty.num_pages, 1);
        assert!(empty.items.is_empty());
    }

    #[tokio::test]
    async fn test_new_object_invalidates_listing() {
        let h = harness().await;
        let before = h
            .service
            .list_for_bucket(h.bucket.id, 1, 10, &ListOptions::default())
            .await
            .unwrap();
        assert_eq!(before.total, 0);

        h.service
            .create_pending(h.bucket.id, "new.txt", None, ObjectSource::User)
            .await
            .unwrap();
        let after = h
            .service
            .list_for_bucket(h.bucket.id, 1, 10, &ListOptions::default())
            .await
            .unwrap();
        assert_eq!(after.total, 1);
    }

    #[tokio::test]
    async fn test_force_refresh_and_repeated_requests_bypass_cache() {
        let h = harness().await;
        let object = h
            .service
            .create_pending(h.bucket.id, "a.txt", None, ObjectSource::User)
            .await
            .unwrap();
        let options = ListOptions {
            force_refresh: false,
            client: Some("caller-1".into()),
        };

        // First request primes the cache.
        h.service.list_for_bucket(h.bucket.id, 1, 10, &options).await.unwrap();
        sqlx::query("DELETE FROM objects WHERE id = ?")
            .bind(object.id)
            .execute(&*h.db)
            .await
            .unwrap();

        let second = h.service.list_for_bucket(h.bucket.id, 1, 10, &options).await.unwrap();
        assert_eq!(second.total, 1);
        let third = h.service.list_for_bucket(h.bucket.id, 1, 10, &options).await.unwrap();
        assert_eq!(third.total, 0);

        let forced = h
            .service
            .list_for_bucket(
                h.bucket.id,
                1,
                10,
                &ListOptions {
                    force_refresh: true,
                    client: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(forced.total, 0);
    }

    #[tokio::test]
    async fn test_refresh_window_slides() {
        let tracker = RefreshTracker::default();
        let settings = CacheSettings::default();
        let start = Utc::now();

        assert!(!tracker.record("c", start, &settings).await);
        assert!(!tracker.record("c", start + Duration::seconds(5), &settings).await);
        // The first hit has left the window.
        assert!(!tracker.record("c", start + Duration::seconds(12), &settings).await);
        assert!(tracker.record("c", start + Duration::seconds(13), &settings).await);
        // History resets after triggering.
        assert!(!tracker.record("c", start + Duration::seconds(14), &settings).await);
        assert!(!tracker.record("other", start + Duration::seconds(14), &settings).await);
    }

    #[tokio::test]
    async fn test_idle_callers_are_forgotten() {
        let tracker = RefreshTracker::default();
        let settings = CacheSettings::default();
        let start = Utc::now();

        for i in 0..1000 {
            tracker.record(&format!("client-{i}"), start, &settings).await;
        }
        assert_eq!(tracker.history.lock().await.len(), 1000);

        tracker
            .record("late", start + Duration::hours(5), &settings)
            .await;
        let history = tracker.history.lock().await;
        assert_eq!(history.len(), 1);
        assert!(history.contains_key("late"));
    }
}
