//! Chunked upload sessions.
//!
//! A client opens a session for a file of known size, PUTs every chunk
//! (in any order), optionally polls progress, then completes. The receiver,
//! progress and assembly steps live in `chunk_receiver`, `progress` and
//! `assembler` as further `impl UploadService` blocks.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    accountant,
    chunk_staging::ChunkStaging,
    error::{ServiceError, ServiceResult},
    offload::OffloadQueue,
    session_store::SessionStore,
};
use crate::models::session::UploadSession;

pub const DEFAULT_CHUNK_SIZE: i64 = 5 * 1024 * 1024;

/// What a client needs to start sending chunks.
#[derive(Debug, Clone, Serialize)]
pub struct UploadPlan {
    pub upload_id: String,
    pub file_name: String,
    pub file_size: i64,
    pub chunk_size: i64,
    pub total_chunks: u32,
    pub folder_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct UploadService {
    pub(super) db: Arc<SqlitePool>,
    pub(super) sessions: Arc<dyn SessionStore>,
    pub(super) staging: ChunkStaging,
    pub(super) offload: OffloadQueue,
    pub(super) chunk_size: i64,
}

impl UploadService {
    pub fn new(
        db: Arc<SqlitePool>,
        sessions: Arc<dyn SessionStore>,
        staging: ChunkStaging,
        offload: OffloadQueue,
        chunk_size: i64,
    ) -> Self {
        Self {
            db,
            sessions,
            staging,
            offload,
            chunk_size,
        }
    }

    pub fn chunk_size(&self) -> i64 {
        self.chunk_size
    }

    pub(super) fn expires_at(&self, session: &UploadSession) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.sessions.ttl()).unwrap_or(chrono::Duration::MAX);
        session
            .created_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Load a live session and check the caller owns it.
    pub(super) async fn owned_session(
        &self,
        user_id: &str,
        upload_id: &str,
    ) -> ServiceResult<UploadSession> {
        let session = self
            .sessions
            .get(upload_id)
            .await?
            .ok_or_else(|| ServiceError::SessionNotFound(upload_id.to_string()))?;
        if session.user_id != user_id {
            return Err(ServiceError::Forbidden);
        }
        Ok(session)
    }

    /// Declare an upload and get back its chunk plan.
    ///
    /// Quota is checked here as a courtesy; the binding check happens again
    /// inside the completion transaction.
    pub async fn open_session(
        &self,
        user_id: &str,
        file_name: &str,
        file_size: i64,
        folder_id: &str,
    ) -> ServiceResult<UploadPlan> {
        let file_name = file_name.trim();
        if file_name.is_empty() || file_name.contains('/') {
            return Err(ServiceError::InvalidInput(
                "file name must be non-empty and contain no `/`".into(),
            ));
        }
        if file_size <= 0 {
            return Err(ServiceError::InvalidInput("file size must be positive".into()));
        }

        {
            let mut conn = self.db.acquire().await?;
            accountant::owned_folder(&mut conn, user_id, folder_id).await?;
        }
        accountant::check_capacity(&self.db, user_id, file_size).await?;

        let session = UploadSession::new(
            Uuid::new_v4().to_string(),
            user_id,
            file_name,
            file_size,
            self.chunk_size,
            folder_id,
        );
        self.sessions.create(&session).await?;
        info!(
            user_id,
            upload_id = %session.upload_id,
            file_size,
            total_chunks = session.total_chunks,
            "opened upload session"
        );

        Ok(UploadPlan {
            expires_at: self.expires_at(&session),
            upload_id: session.upload_id,
            file_name: session.file_name,
            file_size: session.file_size,
            chunk_size: session.chunk_size,
            total_chunks: session.total_chunks,
            folder_id: session.folder_id,
        })
    }

    /// Drop a session and its staged chunks.
    pub async fn abort_session(&self, user_id: &str, upload_id: &str) -> ServiceResult<()> {
        self.owned_session(user_id, upload_id).await?;
        self.sessions.delete(upload_id).await?;
        if let Err(err) = self.staging.remove_session(upload_id).await {
            warn!(upload_id, error = %err, "failed to remove staged chunks");
        }
        info!(user_id, upload_id, "aborted upload session");
        Ok(())
    }
}
