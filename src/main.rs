use anyhow::Result;
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::services::{
    accountant::Accountant,
    blob_store::{BlobStore, LocalBlobStore},
    chunk_staging::ChunkStaging,
    content_registry::ContentReaper,
    maintenance::Maintenance,
    offload::{OffloadPolicy, OffloadQueue},
    recycle_bin::RecycleBinService,
    redis_session_store::RedisSessionStore,
    session_store::{MemorySessionStore, SessionStore},
    upload_service::UploadService,
};

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;
#[cfg(test)]
mod test_support;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting cloud-store with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    tracing::debug!("Connecting using raw URL => {}", cfg.database_url);
    let db = Arc::new(db::connect(&cfg.database_url, 5).await?);

    // --- Schema (idempotent) + migration mode ---
    db::run_migrations(&db).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Ensure storage directories exist ---
    for dir in [&cfg.storage_dir, &cfg.staging_dir] {
        if !Path::new(dir).exists() {
            fs::create_dir_all(dir)?;
            tracing::info!("Created directory at {}", dir);
        }
    }
    let staging = ChunkStaging::new(&cfg.staging_dir);
    staging.ensure_dirs().await?;

    // --- Collaborators ---
    let sessions: Arc<dyn SessionStore> = match &cfg.redis_url {
        Some(url) => {
            tracing::info!("Keeping upload sessions in Redis");
            Arc::new(RedisSessionStore::new(url, cfg.session_ttl)?)
        }
        None => {
            tracing::warn!("No Redis URL configured; upload sessions are process-local");
            Arc::new(MemorySessionStore::new(cfg.session_ttl))
        }
    };
    let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(&cfg.storage_dir));
    let reaper = ContentReaper::new(db.clone(), blobs, staging.clone());
    let (offload, _offload_worker) = OffloadQueue::spawn(
        db.clone(),
        reaper.clone(),
        staging.clone(),
        OffloadPolicy {
            max_attempts: cfg.offload_max_attempts,
            base_backoff: cfg.offload_backoff,
        },
    );

    // --- Initialize core services ---
    let accountant = Accountant::new(db.clone(), reaper.clone(), cfg.default_quota);
    let uploads = UploadService::new(
        db.clone(),
        sessions.clone(),
        staging.clone(),
        offload.clone(),
        cfg.chunk_size,
    );
    let recycle = RecycleBinService::new(db.clone(), reaper);

    let _maintenance = Maintenance::new(
        recycle.clone(),
        offload.clone(),
        uploads.clone(),
        staging.clone(),
        cfg.session_ttl,
    )
    .spawn(cfg.maintenance_interval);

    let state = state::AppState {
        db,
        sessions,
        staging,
        accountant,
        uploads,
        recycle,
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
