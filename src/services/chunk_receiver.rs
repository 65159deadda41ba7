//! Accepting chunk payloads into an open session.

use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use std::io;
use tracing::debug;

use super::{
    error::{ServiceError, ServiceResult},
    upload_service::UploadService,
};

/// Acknowledgement for one accepted chunk.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkAck {
    pub upload_id: String,
    pub chunk_index: u32,
    pub chunk_md5: String,
    pub uploaded_count: u32,
    pub total_chunks: u32,
}

impl UploadService {
    /// Validate and stage one chunk, then record it in the session.
    ///
    /// Checks run in a fixed order: session exists, caller owns it, index is
    /// in range, then (while streaming) the byte length and optional MD5.
    /// Re-sending an index replaces the staged bytes without double-counting.
    pub async fn submit_chunk<S>(
        &self,
        user_id: &str,
        upload_id: &str,
        index: u32,
        content_md5: Option<[u8; 16]>,
        body: S,
    ) -> ServiceResult<ChunkAck>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let session = self.owned_session(user_id, upload_id).await?;
        let expected = session
            .expected_chunk_size(index)
            .ok_or(ServiceError::InvalidChunkIndex {
                index,
                total: session.total_chunks,
            })?;

        let staged = self
            .staging
            .write_chunk(upload_id, index, expected, content_md5, body)
            .await?;

        // `None` means it expired between the lookup and the write; the
        // staged bytes are left for the orphan sweep.
        let uploaded_count = self
            .sessions
            .record_chunk(upload_id, index)
            .await?
            .ok_or_else(|| ServiceError::SessionNotFound(upload_id.to_string()))?;
        debug!(upload_id, index, size = staged.size, uploaded_count, "accepted chunk");

        Ok(ChunkAck {
            upload_id: session.upload_id,
            chunk_index: index,
            chunk_md5: staged.md5_hex,
            uploaded_count,
            total_chunks: session.total_chunks,
        })
    }
}
