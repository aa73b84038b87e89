//! Shared helpers for unit tests: a controllable clock, an in-memory database,
//! local HTTP servers and fakes for the Cloudflare capabilities.

use crate::clock::Clock;
use crate::cloudflare::{BucketProvider, CloudflareError, CorsRule, CredentialIssuer, IssueRequest};
use crate::db;
use crate::models::bucket::{Bucket, LocationHint, StorageClass};
use crate::models::credentials::AccessKeys;
use async_trait::async_trait;
use axum::Router;
use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use tokio::net::TcpListener;
use uuid::Uuid;

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at(Utc.with_ymd_and_hms(2025, 3, 4, 10, 0, 0).unwrap())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Fresh in-memory database with the schema applied.
///
/// A single connection that never idles out keeps the in-memory database alive.
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    db::run_migrations(&pool).await.expect("migrations");
    pool
}

/// Insert an activated bucket for a new tenant.
pub async fn seed_bucket(pool: &SqlitePool, name: &str) -> Bucket {
    let now = Utc::now();
    let bucket = Bucket {
        id: Uuid::new_v4(),
        tenant_id: Uuid::new_v4(),
        name: Some(name.to_string()),
        storage_class: StorageClass::Standard,
        location_hint: LocationHint::Auto,
        active: true,
        activated_at: Some(now),
        created_at: now,
        updated_at: now,
    };
    sqlx::query(
        "INSERT INTO buckets (id, tenant_id, name, storage_class, location_hint, active,
                              activated_at, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(bucket.id)
    .bind(bucket.tenant_id)
    .bind(&bucket.name)
    .bind(bucket.storage_class)
    .bind(bucket.location_hint)
    .bind(bucket.active)
    .bind(bucket.activated_at)
    .bind(bucket.created_at)
    .bind(bucket.updated_at)
    .execute(pool)
    .await
    .expect("seed bucket");
    bucket
}

/// Serve `app` on an ephemeral local port and return its base URL.
pub async fn spawn_http(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

/// Counts issuance calls and hands out numbered keys.
#[derive(Default)]
pub struct FakeIssuer {
    calls: AtomicUsize,
    fail: AtomicBool,
    incomplete: AtomicBool,
    requests: Mutex<Vec<IssueRequest>>,
}

impl FakeIssuer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fake_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Return credentials without a session token.
    pub fn fake_incomplete(&self, incomplete: bool) {
        self.incomplete.store(incomplete, Ordering::SeqCst);
    }

    pub fn last_request(&self) -> Option<IssueRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl CredentialIssuer for FakeIssuer {
    async fn issue(&self, request: &IssueRequest) -> Result<AccessKeys, CloudflareError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push(request.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(CloudflareError::Api {
                status: 500,
                message: "simulated outage".into(),
            });
        }
        let session_token = if self.incomplete.load(Ordering::SeqCst) {
            String::new()
        } else {
            format!("session-{}", n)
        };
        Ok(AccessKeys {
            access_key_id: format!("access-{}", n),
            secret_access_key: format!("secret-{}", n),
            session_token,
        })
    }
}

/// Records provisioning calls; can be told to fail bucket creation.
#[derive(Default)]
pub struct FakeProvider {
    pub created: Mutex<Vec<String>>,
    pub cors_updates: Mutex<Vec<(String, Vec<CorsRule>)>>,
    fail_create: AtomicBool,
}

impl FakeProvider {
    pub fn fake_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BucketProvider for FakeProvider {
    async fn create_bucket(
        &self,
        name: &str,
        _location_hint: LocationHint,
        _storage_class: StorageClass,
    ) -> Result<String, CloudflareError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(CloudflareError::Api {
                status: 409,
                message: "bucket exists".into(),
            });
        }
        self.created.lock().unwrap().push(name.to_string());
        Ok(name.to_string())
    }

    async fn update_cors(&self, name: &str, rules: &[CorsRule]) -> Result<(), CloudflareError> {
        self.cors_updates
            .lock()
            .unwrap()
            .push((name.to_string(), rules.to_vec()));
        Ok(())
    }
}
