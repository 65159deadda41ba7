use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

use crate::services::upload_service::DEFAULT_CHUNK_SIZE;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Root of the local blob store.
    pub storage_dir: String,
    /// Chunks, merged payloads and dead letters.
    pub staging_dir: String,
    pub database_url: String,
    /// Session store; sessions are kept in memory when unset.
    pub redis_url: Option<String>,
    pub chunk_size: i64,
    pub session_ttl: Duration,
    /// Quota given to newly provisioned stores, in bytes.
    pub default_quota: i64,
    pub offload_max_attempts: u32,
    pub offload_backoff: Duration,
    pub maintenance_interval: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Chunked-upload cloud storage API")]
pub struct Args {
    /// Host to bind to (overrides CLOUD_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CLOUD_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where blobs are stored (overrides CLOUD_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Directory for staged chunks (overrides CLOUD_STORE_STAGING_DIR)
    #[arg(long)]
    pub staging_dir: Option<String>,

    /// Database URL (overrides CLOUD_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Redis URL for upload sessions (overrides CLOUD_STORE_REDIS_URL)
    #[arg(long)]
    pub redis_url: Option<String>,

    /// Chunk size in bytes (overrides CLOUD_STORE_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<i64>,

    /// Upload session lifetime in seconds (overrides CLOUD_STORE_SESSION_TTL_SECS)
    #[arg(long)]
    pub session_ttl_secs: Option<u64>,

    /// Default per-user quota in bytes (overrides CLOUD_STORE_DEFAULT_QUOTA)
    #[arg(long)]
    pub default_quota: Option<i64>,

    /// Blob upload attempts before dead-lettering (overrides CLOUD_STORE_OFFLOAD_MAX_ATTEMPTS)
    #[arg(long)]
    pub offload_max_attempts: Option<u32>,

    /// Base retry backoff in milliseconds (overrides CLOUD_STORE_OFFLOAD_BACKOFF_MS)
    #[arg(long)]
    pub offload_backoff_ms: Option<u64>,

    /// Seconds between maintenance passes (overrides CLOUD_STORE_MAINTENANCE_INTERVAL_SECS)
    #[arg(long)]
    pub maintenance_interval_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read and parse `name`, falling back to `default` when unset.
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    fn merge(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env::var("CLOUD_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("CLOUD_STORE_PORT", 3000u16)?;
        let env_storage =
            env::var("CLOUD_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/blobs".into());
        let env_staging =
            env::var("CLOUD_STORE_STAGING_DIR").unwrap_or_else(|_| "./data/staging".into());
        let env_db = env::var("CLOUD_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/cloud_store.db".into());
        let env_redis = env::var("CLOUD_STORE_REDIS_URL").ok();
        let env_chunk = env_parse("CLOUD_STORE_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?;
        let env_ttl = env_parse("CLOUD_STORE_SESSION_TTL_SECS", 24 * 60 * 60u64)?;
        let env_quota = env_parse("CLOUD_STORE_DEFAULT_QUOTA", 1024 * 1024 * 1024i64)?;
        let env_attempts = env_parse("CLOUD_STORE_OFFLOAD_MAX_ATTEMPTS", 3u32)?;
        let env_backoff = env_parse("CLOUD_STORE_OFFLOAD_BACKOFF_MS", 500u64)?;
        let env_interval = env_parse("CLOUD_STORE_MAINTENANCE_INTERVAL_SECS", 300u64)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            staging_dir: args.staging_dir.unwrap_or(env_staging),
            database_url: args.database_url.unwrap_or(env_db),
            redis_url: args.redis_url.or(env_redis).filter(|url| !url.is_empty()),
            chunk_size: args.chunk_size.unwrap_or(env_chunk),
            session_ttl: Duration::from_secs(args.session_ttl_secs.unwrap_or(env_ttl)),
            default_quota: args.default_quota.unwrap_or(env_quota),
            offload_max_attempts: args.offload_max_attempts.unwrap_or(env_attempts),
            offload_backoff: Duration::from_millis(args.offload_backoff_ms.unwrap_or(env_backoff)),
            maintenance_interval: Duration::from_secs(
                args.maintenance_interval_secs.unwrap_or(env_interval),
            ),
        };

        if cfg.chunk_size <= 0 {
            anyhow::bail!("chunk size must be positive, got {}", cfg.chunk_size);
        }
        if cfg.session_ttl.is_zero() || cfg.maintenance_interval.is_zero() {
            anyhow::bail!("session TTL and maintenance interval must be non-zero");
        }
        if cfg.default_quota <= 0 {
            anyhow::bail!("default quota must be positive, got {}", cfg.default_quota);
        }
        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "cloud-store",
            "--port",
            "8080",
            "--chunk-size",
            "1024",
            "--redis-url",
            "redis://cache:6379",
            "--migrate",
        ]);
        assert!(args.migrate);
        let cfg = AppConfig::merge(args).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.chunk_size, 1024);
        assert_eq!(cfg.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(cfg.addr(), format!("{}:8080", cfg.host));
    }

    #[test]
    fn rejects_non_positive_chunk_size() {
        let args = Args::parse_from(["cloud-store", "--chunk-size", "0"]);
        assert!(AppConfig::merge(args).is_err());
    }
}
