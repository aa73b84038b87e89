use crate::cloudflare::{CloudflareSettings, DEFAULT_API_BASE, DEFAULT_API_TIMEOUT};
use crate::dispatch::{DispatchMode, DispatchSettings, RetryPolicy};
use crate::models::{
    bucket::{LocationHint, StorageClass},
    credentials::{DEFAULT_CREDENTIAL_TTL_SECONDS, Permission},
};
use crate::services::{
    bucket_service::ProvisionSettings,
    credentials_service::CredentialSettings,
    object_service::CacheSettings,
    presign::{DEFAULT_PRESIGN_TTL_SECONDS, PresignSettings},
    upload_service::FetchSettings,
};
use crate::storage::s3::StorageSettings;
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, fmt, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "BUCKET_BROKER_";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub max_connections: u32,
    pub secret_key: String,
    /// Oldest signed upload token still accepted.
    pub token_max_age: Option<chrono::Duration>,
    pub credentials: CredentialSettings,
    pub presign: PresignSettings,
    pub cache: CacheSettings,
    pub fetch: FetchSettings,
    pub provision: ProvisionSettings,
    pub storage: StorageSettings,
    pub cloudflare: CloudflareSettings,
    pub dispatch: DispatchSettings,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Bucket credential and upload broker")]
pub struct Args {
    /// Host to bind to (overrides BUCKET_BROKER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides BUCKET_BROKER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides BUCKET_BROKER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// How URL fetches run (overrides BUCKET_BROKER_DISPATCH)
    #[arg(long, value_enum)]
    pub dispatch: Option<DispatchMode>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Reads `BUCKET_BROKER_*` variables through an injectable lookup.
struct EnvSource<F> {
    lookup: F,
}

impl<F> EnvSource<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.string(name) {
            Some(value) => value
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| anyhow::anyhow!("{}", e))
                .with_context(|| format!("parsing {}{} value `{}`", ENV_PREFIX, name, value)),
            None => Ok(None),
        }
    }

    fn parse_or<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        Ok(self.parse(name)?.unwrap_or(default))
    }

    fn keyword<T>(&self, name: &str, default: T, parse: fn(&str) -> Option<T>) -> Result<T> {
        match self.string(name) {
            Some(value) => parse(value.trim().to_ascii_lowercase().as_str())
                .with_context(|| format!("unsupported {}{} value `{}`", ENV_PREFIX, name, value)),
            None => Ok(default),
        }
    }
}

fn parse_permission(value: &str) -> Option<Permission> {
    match value {
        "object-read-write" => Some(Permission::ReadWrite),
        "object-read" => Some(Permission::ReadOnly),
        _ => None,
    }
}

fn parse_storage_class(value: &str) -> Option<StorageClass> {
    match value {
        "standard" => Some(StorageClass::Standard),
        "infrequentaccess" | "infrequent-access" => Some(StorageClass::InfrequentAccess),
        _ => None,
    }
}

fn parse_location_hint(value: &str) -> Option<LocationHint> {
    match value {
        "apac" => Some(LocationHint::Apac),
        "eeur" => Some(LocationHint::Eeur),
        "enam" => Some(LocationHint::Enam),
        "weur" => Some(LocationHint::Weur),
        "wnam" => Some(LocationHint::Wnam),
        "auto" => Some(LocationHint::Auto),
        _ => None,
    }
}

fn parse_dispatch(value: &str) -> Option<DispatchMode> {
    match value {
        "inline" => Some(DispatchMode::Inline),
        "queue" => Some(DispatchMode::Queue),
        _ => None,
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_sources(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI args over environment values over built-in defaults.
    pub fn from_sources<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvSource { lookup };

        // --- Server + database ---
        let env_host = env.string("HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = env.parse_or("PORT", 3000u16)?;
        let env_db = env
            .string("DATABASE_URL")
            .unwrap_or_else(|| "sqlite://./data/meta/bucket_broker.db".into());
        let max_connections = env.parse_or("MAX_CONNECTIONS", 5u32)?;

        let secret_key = match env.string("SECRET_KEY") {
            Some(secret) => secret,
            None => {
                tracing::warn!(
                    "{}SECRET_KEY is not set; upload tokens will not survive a restart",
                    ENV_PREFIX
                );
                uuid::Uuid::new_v4().simple().to_string()
            }
        };
        let token_max_age = env
            .parse::<i64>("TOKEN_MAX_AGE_SECONDS")?
            .map(chrono::Duration::seconds);

        // --- Cloudflare ---
        let account_id = env.string("CLOUDFLARE_ACCOUNT_ID");
        let cloudflare = CloudflareSettings {
            api_base: env
                .string("CLOUDFLARE_API_BASE")
                .unwrap_or_else(|| DEFAULT_API_BASE.into()),
            api_token: env.string("CLOUDFLARE_API_TOKEN"),
            account_id: account_id.clone(),
            timeout: Duration::from_secs(
                env.parse_or("CLOUDFLARE_TIMEOUT_SECONDS", DEFAULT_API_TIMEOUT.as_secs())?,
            ),
        };

        let credentials = CredentialSettings {
            ttl_seconds: env.parse_or("CREDENTIAL_TTL_SECONDS", DEFAULT_CREDENTIAL_TTL_SECONDS)?,
            permission: env.keyword(
                "CREDENTIAL_PERMISSION",
                Permission::ReadWrite,
                parse_permission,
            )?,
            account_id: account_id.clone(),
            parent_access_key_id: env.string("PARENT_ACCESS_KEY_ID"),
        };
        if credentials.ttl_seconds <= 0 {
            bail!("{}CREDENTIAL_TTL_SECONDS must be positive", ENV_PREFIX);
        }

        let presign = PresignSettings {
            upload_ttl: Duration::from_secs(
                env.parse_or("PRESIGN_UPLOAD_TTL_SECONDS", DEFAULT_PRESIGN_TTL_SECONDS)?,
            ),
            download_ttl: Duration::from_secs(
                env.parse_or("PRESIGN_DOWNLOAD_TTL_SECONDS", DEFAULT_PRESIGN_TTL_SECONDS)?,
            ),
        };

        let cache_ttl = chrono::Duration::seconds(env.parse_or("CACHE_TTL_SECONDS", 300i64)?);
        let cache = CacheSettings {
            object_ttl: cache_ttl,
            listing_ttl: cache_ttl,
            ..CacheSettings::default()
        };

        let fetch_defaults = FetchSettings::default();
        let fetch = FetchSettings {
            timeout: Duration::from_secs(
                env.parse_or("FETCH_TIMEOUT_SECONDS", fetch_defaults.timeout.as_secs())?,
            ),
            max_bytes: env.parse_or("FETCH_MAX_BYTES", fetch_defaults.max_bytes)?,
        };

        let provision_defaults = ProvisionSettings::default();
        let provision = ProvisionSettings {
            name_prefix: env
                .string("BUCKET_PREFIX")
                .unwrap_or(provision_defaults.name_prefix),
            cors_origins: env
                .string("CORS_ORIGINS")
                .map(|origins| {
                    origins
                        .split(',')
                        .map(str::trim)
                        .filter(|o| !o.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or(provision_defaults.cors_origins),
            location_hint: env.keyword(
                "LOCATION_HINT",
                provision_defaults.location_hint,
                parse_location_hint,
            )?,
            storage_class: env.keyword(
                "STORAGE_CLASS",
                provision_defaults.storage_class,
                parse_storage_class,
            )?,
        };

        let storage = StorageSettings {
            endpoint: env.string("S3_ENDPOINT").or_else(|| {
                account_id
                    .as_ref()
                    .map(|account| format!("https://{}.r2.cloudflarestorage.com", account))
            }),
            region: env.string("S3_REGION").unwrap_or_else(|| "auto".into()),
            force_path_style: true,
        };

        let retry_defaults = RetryPolicy::default();
        let env_dispatch = env.keyword("DISPATCH", DispatchMode::Queue, parse_dispatch)?;
        let dispatch = DispatchSettings {
            mode: args.dispatch.unwrap_or(env_dispatch),
            retry: RetryPolicy {
                max_attempts: env.parse_or("DISPATCH_MAX_ATTEMPTS", retry_defaults.max_attempts)?,
                backoff: Duration::from_secs(
                    env.parse_or("DISPATCH_BACKOFF_SECONDS", retry_defaults.backoff.as_secs())?,
                ),
            },
        };

        // --- Merge ---
        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            max_connections,
            secret_key,
            token_max_age,
            credentials,
            presign,
            cache,
            fetch,
            provision,
            storage,
            cloudflare,
            dispatch,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
