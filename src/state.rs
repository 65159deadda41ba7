use sqlx::SqlitePool;
use std::sync::Arc;

use crate::services::{
    accountant::Accountant, chunk_staging::ChunkStaging, recycle_bin::RecycleBinService,
    session_store::SessionStore, upload_service::UploadService,
};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub sessions: Arc<dyn SessionStore>,
    pub staging: ChunkStaging,
    pub accountant: Accountant,
    pub uploads: UploadService,
    pub recycle: RecycleBinService,
}
