//! Upload completion: assembly, deduplication and the committing transaction.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    accountant,
    chunk_staging::{ChunkStaging, MergedPayload},
    content_registry::{self, ContentClaim},
    error::{ServiceError, ServiceResult, is_unique_violation},
    offload::OffloadJob,
    session_store::SessionStore,
    upload_service::UploadService,
};
use crate::models::{
    file::{FILE_COLUMNS, FileRecord},
    session::{UploadSession, split_file_name},
};

/// The file a completed upload produced.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedUpload {
    pub file: FileRecord,
    /// Whether this completion scheduled a blob-store upload.
    pub need_upload: bool,
}

enum Persisted {
    Created { file: FileRecord, claim: ContentClaim },
    AlreadyCompleted,
}

impl UploadService {
    /// Turn a fully received session into a file.
    ///
    /// The file row, quota and folder sizes are committed before this
    /// returns. Pushing new content to the blob store and dropping the
    /// session happen afterwards in the background. Completing the same
    /// session again returns the file it already produced.
    pub async fn complete(&self, user_id: &str, upload_id: &str) -> ServiceResult<CompletedUpload> {
        if let Some(file) = self.completed_file(user_id, upload_id).await? {
            return Ok(CompletedUpload {
                file,
                need_upload: false,
            });
        }

        let session = self.owned_session(user_id, upload_id).await?;
        if !session.is_complete() {
            return Err(ServiceError::IncompleteUpload {
                uploaded: session.uploaded_count(),
                total: session.total_chunks,
            });
        }

        let (stem, extension) = split_file_name(&session.file_name);
        let merged = self.staging.merge(&session, &extension).await?;
        let persisted = match self.persist(&session, &merged, &stem, &extension).await {
            Ok(persisted) => persisted,
            Err(err) => {
                self.staging.discard(&merged.path).await;
                return Err(err);
            }
        };

        match persisted {
            Persisted::AlreadyCompleted => {
                self.staging.discard(&merged.path).await;
                let file = self.completed_file(user_id, upload_id).await?.ok_or_else(|| {
                    ServiceError::Internal(format!("completion of {} has no file", upload_id))
                })?;
                Ok(CompletedUpload {
                    file,
                    need_upload: false,
                })
            }
            Persisted::Created { file, claim } => {
                if claim.need_upload {
                    self.schedule_offload(&claim, &merged, &extension).await;
                } else {
                    debug!(fingerprint = %merged.fingerprint, "content already stored, skipping upload");
                    self.staging.discard(&merged.path).await;
                }
                spawn_cleanup(self.sessions.clone(), self.staging.clone(), upload_id.to_string());
                info!(
                    user_id,
                    upload_id,
                    file_id = %file.id,
                    size = file.size,
                    need_upload = claim.need_upload,
                    "completed upload"
                );
                Ok(CompletedUpload {
                    file,
                    need_upload: claim.need_upload,
                })
            }
        }
    }

    /// One transaction: completion marker, quota, content claim, file row
    /// and folder sizes. Any failure rolls all of it back.
    async fn persist(
        &self,
        session: &UploadSession,
        merged: &MergedPayload,
        stem: &str,
        extension: &str,
    ) -> ServiceResult<Persisted> {
        let user_id = session.user_id.as_str();
        let now = Utc::now();
        let file_id = Uuid::new_v4().to_string();

        let mut tx = self.db.begin().await?;
        let marked = sqlx::query(
            "INSERT INTO upload_completions (upload_id, user_id, file_id, completed_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&session.upload_id)
        .bind(user_id)
        .bind(&file_id)
        .bind(now)
        .execute(&mut *tx)
        .await;
        match marked {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => return Ok(Persisted::AlreadyCompleted),
            Err(err) => return Err(err.into()),
        }

        let folder = accountant::owned_folder(&mut tx, user_id, &session.folder_id).await?;
        accountant::reserve(&mut tx, user_id, merged.size).await?;
        let claim =
            content_registry::claim(&mut tx, &merged.fingerprint, user_id, extension, merged.size)
                .await?;

        let file = sqlx::query_as::<_, FileRecord>(&format!(
            "INSERT INTO files (id, owner_id, file_name, extension, fingerprint, storage_path,
                                parent_folder_id, size, created_at, deleted_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL) RETURNING {}",
            FILE_COLUMNS
        ))
        .bind(&file_id)
        .bind(user_id)
        .bind(stem)
        .bind(extension)
        .bind(&merged.fingerprint)
        .bind(&claim.storage_path)
        .bind(&folder.id)
        .bind(merged.size)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        accountant::apply_delta(&mut tx, &folder.id, merged.size).await?;
        tx.commit().await?;
        Ok(Persisted::Created { file, claim })
    }

    async fn schedule_offload(&self, claim: &ContentClaim, merged: &MergedPayload, extension: &str) {
        let job = OffloadJob {
            fingerprint: merged.fingerprint.clone(),
            blob_key: claim.blob_key(&merged.fingerprint, extension),
            payload: merged.path.clone(),
            resumed: false,
        };
        if let Err(err) = self.offload.enqueue(job) {
            // Park it so the maintenance loop can retry once a worker runs.
            error!(fingerprint = %merged.fingerprint, error = %err, "failed to schedule offload");
            if let Err(err) = self
                .staging
                .park_dead_letter(&merged.path, &merged.fingerprint)
                .await
            {
                warn!(fingerprint = %merged.fingerprint, error = %err, "failed to park payload");
            }
            if let Err(err) = content_registry::mark_dead_letter(
                &self.db,
                &merged.fingerprint,
                0,
                "offload queue unavailable",
            )
            .await
            {
                warn!(fingerprint = %merged.fingerprint, error = %err, "failed to record dead letter");
            }
        }
    }

    /// The file produced by an earlier completion of `upload_id`, if any.
    async fn completed_file(
        &self,
        user_id: &str,
        upload_id: &str,
    ) -> ServiceResult<Option<FileRecord>> {
        let marker = sqlx::query_as::<_, (String, String)>(
            "SELECT user_id, file_id FROM upload_completions WHERE upload_id = ?",
        )
        .bind(upload_id)
        .fetch_optional(&*self.db)
        .await?;
        let Some((owner, file_id)) = marker else {
            return Ok(None);
        };
        if owner != user_id {
            return Err(ServiceError::Forbidden);
        }

        sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {} FROM files WHERE id = ?",
            FILE_COLUMNS
        ))
        .bind(&file_id)
        .fetch_optional(&*self.db)
        .await?
        .map(Some)
        .ok_or_else(|| ServiceError::NotFound(format!("file `{}`", file_id)))
    }
}

impl UploadService {
    /// Forget completion markers recorded before `before`.
    ///
    /// A marker only matters while its session could still be completed
    /// again, so anything older than the session TTL can go.
    pub async fn prune_completions(&self, before: DateTime<Utc>) -> ServiceResult<u64> {
        let pruned = sqlx::query("DELETE FROM upload_completions WHERE completed_at < ?")
            .bind(before)
            .execute(&*self.db)
            .await?
            .rows_affected();
        if pruned > 0 {
            debug!(pruned, "pruned upload completion markers");
        }
        Ok(pruned)
    }
}

/// Drop the session record and its staged chunks without blocking the caller.
fn spawn_cleanup(sessions: Arc<dyn SessionStore>, staging: ChunkStaging, upload_id: String) {
    tokio::spawn(async move {
        if let Err(err) = sessions.delete(&upload_id).await {
            warn!(upload_id = %upload_id, error = %err, "failed to delete completed session");
        }
        if let Err(err) = staging.remove_session(&upload_id).await {
            warn!(upload_id = %upload_id, error = %err, "failed to remove staged chunks");
        }
    });
}
