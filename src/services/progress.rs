//! Read-only view of an upload session's progress.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{error::ServiceResult, upload_service::UploadService};
use crate::models::session::UploadSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    NotStarted,
    Uploading,
    ReadyToComplete,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressReport {
    pub upload_id: String,
    pub file_name: String,
    pub file_size: i64,
    pub chunk_size: i64,
    pub total_chunks: u32,
    pub folder_id: String,
    pub uploaded_chunks: Vec<u32>,
    pub uploaded_count: u32,
    pub missing_chunks: Vec<u32>,
    pub missing_count: u32,
    /// Share of chunks received, 0.0 to 100.0.
    pub progress: f64,
    pub status: UploadStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ProgressReport {
    pub fn from_session(session: &UploadSession, expires_at: DateTime<Utc>) -> Self {
        let uploaded_count = session.uploaded_count();
        let missing_chunks = session.missing_chunks();
        let progress = if session.total_chunks == 0 {
            0.0
        } else {
            f64::from(uploaded_count) * 100.0 / f64::from(session.total_chunks)
        };
        let status = if uploaded_count == 0 {
            UploadStatus::NotStarted
        } else if session.is_complete() {
            UploadStatus::ReadyToComplete
        } else {
            UploadStatus::Uploading
        };

        Self {
            upload_id: session.upload_id.clone(),
            file_name: session.file_name.clone(),
            file_size: session.file_size,
            chunk_size: session.chunk_size,
            total_chunks: session.total_chunks,
            folder_id: session.folder_id.clone(),
            uploaded_chunks: session.received.iter().copied().collect(),
            uploaded_count,
            missing_count: missing_chunks.len() as u32,
            missing_chunks,
            progress,
            status,
            created_at: session.created_at,
            expires_at,
        }
    }
}

impl UploadService {
    pub async fn inspect(&self, user_id: &str, upload_id: &str) -> ServiceResult<ProgressReport> {
        let session = self.owned_session(user_id, upload_id).await?;
        Ok(ProgressReport::from_session(
            &session,
            self.expires_at(&session),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{chunk_staging::byte_stream, error::ServiceError};
    use crate::test_support::TestEnv;

    #[test]
    fn status_follows_received_set() {
        let mut session = UploadSession::new("u", "alice", "a.bin", 20, 8, "f");
        let report = ProgressReport::from_session(&session, Utc::now());
        assert_eq!(report.status, UploadStatus::NotStarted);
        assert_eq!(report.missing_chunks, vec![0, 1, 2]);
        assert_eq!(report.progress, 0.0);

        session.received.insert(1);
        let report = ProgressReport::from_session(&session, Utc::now());
        assert_eq!(report.status, UploadStatus::Uploading);
        assert_eq!(report.missing_chunks, vec![0, 2]);
        assert_eq!(report.uploaded_chunks, vec![1]);

        session.received.extend([0, 2]);
        let report = ProgressReport::from_session(&session, Utc::now());
        assert_eq!(report.status, UploadStatus::ReadyToComplete);
        assert_eq!(report.missing_count, 0);
        assert_eq!(report.progress, 100.0);
    }

    #[tokio::test]
    async fn inspect_is_owner_only() {
        let env = TestEnv::new().await;
        let root = env.user("alice").await;
        let plan = env
            .uploads
            .open_session("alice", "a.bin", 10, &root)
            .await
            .unwrap();
        env.uploads
            .submit_chunk("alice", &plan.upload_id, 1, None, byte_stream(vec![1, 2]))
            .await
            .unwrap();

        let report = env.uploads.inspect("alice", &plan.upload_id).await.unwrap();
        assert_eq!(report.uploaded_count, 1);
        assert_eq!(report.progress, 50.0);
        assert_eq!(report.missing_chunks, vec![0]);

        assert!(matches!(
            env.uploads.inspect("bob", &plan.upload_id).await,
            Err(ServiceError::Forbidden)
        ));
    }
}
