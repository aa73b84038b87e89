//! Cloudflare R2 management API: temporary credentials, bucket creation and CORS.

use crate::models::{
    bucket::{LocationHint, StorageClass},
    credentials::{AccessKeys, Permission},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_API_BASE: &str = "https://api.cloudflare.com/client/v4";
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum CloudflareError {
    #[error("request to Cloudflare failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Cloudflare API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Cloudflare response is missing `{0}`")]
    MissingField(&'static str),

    #[error("no Cloudflare account id configured")]
    MissingAccountId,
}

/// Parameters for a temporary credential grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRequest {
    pub bucket: String,
    pub account_id: Option<String>,
    pub parent_access_key_id: Option<String>,
    pub ttl_seconds: i64,
    pub permission: Permission,
}

/// Issues temporary credentials scoped to one bucket.
#[async_trait]
pub trait CredentialIssuer: Send + Sync + 'static {
    async fn issue(&self, request: &IssueRequest) -> Result<AccessKeys, CloudflareError>;
}

/// Creates remote buckets and applies their CORS policy.
#[async_trait]
pub trait BucketProvider: Send + Sync + 'static {
    /// Create the bucket, returning the name the provider registered.
    async fn create_bucket(
        &self,
        name: &str,
        location_hint: LocationHint,
        storage_class: StorageClass,
    ) -> Result<String, CloudflareError>;

    async fn update_cors(&self, name: &str, rules: &[CorsRule]) -> Result<(), CloudflareError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorsAllowed {
    pub origins: Vec<String>,
    pub methods: Vec<String>,
    pub headers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorsRule {
    pub allowed: CorsAllowed,
    pub expose_headers: Vec<String>,
    pub max_age_seconds: u32,
}

/// CORS policy letting browsers on `origins` upload straight to the bucket.
pub fn default_cors_rules(origins: &[String]) -> Vec<CorsRule> {
    let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    vec![CorsRule {
        allowed: CorsAllowed {
            origins: origins.to_vec(),
            methods: strings(&["GET", "PUT", "POST", "DELETE", "HEAD"]),
            headers: strings(&[
                "Content-Type",
                "Origin",
                "x-amz-acl",
                "x-amz-content-sha256",
                "x-amz-date",
            ]),
        },
        expose_headers: strings(&["ETag"]),
        max_age_seconds: 3600,
    }]
}

/// API location and credentials.
#[derive(Debug, Clone)]
pub struct CloudflareSettings {
    pub api_base: String,
    pub api_token: Option<String>,
    pub account_id: Option<String>,
    /// Per-request timeout, independent of whatever the shared client carries.
    pub timeout: Duration,
}

/// `reqwest` client for the R2 management endpoints.
#[derive(Debug, Clone)]
pub struct CloudflareClient {
    http: reqwest::Client,
    settings: CloudflareSettings,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TempCredentialsBody<'a> {
    bucket: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_access_key_id: Option<&'a str>,
    permission: &'static str,
    ttl_seconds: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TempCredentials {
    access_key_id: Option<String>,
    secret_access_key: Option<String>,
    session_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateBucketBody<'a> {
    name: &'a str,
    location_hint: &'static str,
    storage_class: StorageClass,
}

#[derive(Debug, Deserialize)]
struct CreatedBucket {
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct CorsBody<'a> {
    rules: &'a [CorsRule],
}

impl CloudflareClient {
    pub fn new(http: reqwest::Client, settings: CloudflareSettings) -> Self {
        Self { http, settings }
    }

    fn account<'a>(&'a self, requested: Option<&'a str>) -> Result<&'a str, CloudflareError> {
        requested
            .or(self.settings.account_id.as_deref())
            .ok_or(CloudflareError::MissingAccountId)
    }

    fn url(&self, account_id: &str, path: &str) -> String {
        format!(
            "{}/accounts/{}/r2/{}",
            self.settings.api_base.trim_end_matches('/'),
            account_id,
            path
        )
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Option<T>, CloudflareError> {
        let request = request.timeout(self.settings.timeout);
        let request = match &self.settings.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().await?;
        let status = response.status();
        let envelope: Envelope<T> = response.json().await?;
        if !status.is_success() || !envelope.success {
            let message = envelope
                .errors
                .iter()
                .map(|e| format!("{} ({})", e.message, e.code))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(CloudflareError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(envelope.result)
    }
}

#[async_trait]
impl CredentialIssuer for CloudflareClient {
    async fn issue(&self, request: &IssueRequest) -> Result<AccessKeys, CloudflareError> {
        let account_id = self.account(request.account_id.as_deref())?;
        let body = TempCredentialsBody {
            bucket: &request.bucket,
            parent_access_key_id: request.parent_access_key_id.as_deref(),
            permission: request.permission.as_str(),
            ttl_seconds: request.ttl_seconds,
        };
        debug!(
            "Requesting {} credentials for bucket {} (ttl {}s)",
            body.permission, body.bucket, body.ttl_seconds
        );

        let result: TempCredentials = self
            .send(
                self.http
                    .post(self.url(account_id, "temp-access-credentials"))
                    .json(&body),
            )
            .await?
            .ok_or(CloudflareError::MissingField("result"))?;

        Ok(AccessKeys {
            access_key_id: result.access_key_id.unwrap_or_default(),
            secret_access_key: result.secret_access_key.unwrap_or_default(),
            session_token: result.session_token.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl BucketProvider for CloudflareClient {
    async fn create_bucket(
        &self,
        name: &str,
        location_hint: LocationHint,
        storage_class: StorageClass,
    ) -> Result<String, CloudflareError> {
        let account_id = self.account(None)?;
        let body = CreateBucketBody {
            name,
            location_hint: location_hint.as_str(),
            storage_class,
        };
        let created: CreatedBucket = self
            .send(self.http.post(self.url(account_id, "buckets")).json(&body))
            .await?
            .ok_or(CloudflareError::MissingField("result"))?;
        created.name.ok_or(CloudflareError::MissingField("name"))
    }

    async fn update_cors(&self, name: &str, rules: &[CorsRule]) -> Result<(), CloudflareError> {
        let account_id = self.account(None)?;
        self.send::<serde_json::Value>(
            self.http
                .put(self.url(account_id, &format!("buckets/{}/cors", name)))
                .json(&CorsBody { rules }),
        )
        .await?;
        Ok(())
    }
}
