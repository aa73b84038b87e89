use anyhow::Result;
use axum::Router;
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod cache;
mod clock;
mod cloudflare;
mod config;
mod db;
mod dispatch;
mod errors;
mod formatting;
mod handlers;
mod models;
mod routes;
mod services;
mod signing;
mod storage;
#[cfg(test)]
mod test_utils;

use crate::{
    cache::MemoryCache,
    clock::{Clock, SystemClock},
    cloudflare::CloudflareClient,
    dispatch::{DispatchMode, Dispatcher, InlineDispatcher, QueueDispatcher},
    routes::routes::AppState,
    services::{
        bucket_service::BucketService, credentials_service::CredentialService,
        object_service::ObjectService, upload_service::UploadService,
    },
    signing::{TokenSigner, UPLOAD_SALT},
    storage::S3ObjectStorage,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!(
        "Starting bucket-broker on {} (database {}, dispatch {:?})",
        cfg.addr(),
        cfg.database_url,
        cfg.dispatch.mode
    );

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url, cfg.max_connections).await?);

    // --- Handle migration mode ---
    if migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Capabilities ---
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let http = reqwest::Client::builder()
        .timeout(cfg.fetch.timeout)
        .build()?;
    let api_http = reqwest::Client::builder()
        .timeout(cfg.cloudflare.timeout)
        .build()?;
    let cloudflare = Arc::new(CloudflareClient::new(api_http, cfg.cloudflare.clone()));
    let storage = Arc::new(S3ObjectStorage::new(cfg.storage.clone()));
    let cache = Arc::new(MemoryCache::new(clock.clone()));
    let dispatcher: Arc<dyn Dispatcher> = match cfg.dispatch.mode {
        DispatchMode::Inline => Arc::new(InlineDispatcher),
        DispatchMode::Queue => {
            let (queue, _worker) = QueueDispatcher::spawn(cfg.dispatch.retry);
            Arc::new(queue)
        }
    };

    // --- Initialize core services ---
    let objects = ObjectService::new(db.clone(), cache, clock.clone(), cfg.cache);
    let credentials = CredentialService::new(
        db.clone(),
        cloudflare.clone(),
        clock.clone(),
        cfg.credentials.clone(),
    );
    let buckets = BucketService::new(db.clone(), cloudflare, clock.clone(), cfg.provision.clone());
    let uploads = UploadService::new(
        db.clone(),
        objects.clone(),
        credentials,
        storage,
        dispatcher,
        TokenSigner::new(cfg.secret_key.as_bytes(), UPLOAD_SALT, cfg.token_max_age),
        http,
        clock,
        cfg.presign,
        cfg.fetch,
    );

    let state = AppState {
        db,
        buckets,
        objects,
        uploads,
    };

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
