//! Represents an in-progress chunked upload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A chunked-upload session, created when a client declares a file of known
/// size and consumed when the upload completes.
///
/// Chunk indices are zero-based: a session accepts indices in
/// `[0, total_chunks)`. Everything except `received` is fixed at creation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UploadSession {
    /// Opaque session token returned to the client.
    pub upload_id: String,

    /// Declared file name, including extension.
    pub file_name: String,

    /// Declared total size in bytes.
    pub file_size: i64,

    /// Server-chosen size of every chunk except possibly the last.
    pub chunk_size: i64,

    /// `ceil(file_size / chunk_size)`.
    pub total_chunks: u32,

    /// Folder the completed file lands in.
    pub folder_id: String,

    /// Owning user.
    pub user_id: String,

    /// When the session was opened.
    pub created_at: DateTime<Utc>,

    /// Chunk indices received so far.
    pub received: BTreeSet<u32>,
}

impl UploadSession {
    pub fn new(
        upload_id: impl Into<String>,
        user_id: impl Into<String>,
        file_name: impl Into<String>,
        file_size: i64,
        chunk_size: i64,
        folder_id: impl Into<String>,
    ) -> Self {
        Self {
            upload_id: upload_id.into(),
            file_name: file_name.into(),
            file_size,
            chunk_size,
            total_chunks: total_chunks_for(file_size, chunk_size),
            folder_id: folder_id.into(),
            user_id: user_id.into(),
            created_at: Utc::now(),
            received: BTreeSet::new(),
        }
    }

    /// Byte length a chunk at `index` must have.
    ///
    /// Returns `None` when the index is outside `[0, total_chunks)`.
    pub fn expected_chunk_size(&self, index: u32) -> Option<i64> {
        if index >= self.total_chunks {
            return None;
        }
        if index + 1 == self.total_chunks {
            Some(self.file_size - self.chunk_size * (i64::from(self.total_chunks) - 1))
        } else {
            Some(self.chunk_size)
        }
    }

    pub fn uploaded_count(&self) -> u32 {
        self.received.len() as u32
    }

    /// Sorted indices that have not been received yet.
    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.received.contains(i))
            .collect()
    }

    /// True when the received set is exactly `{0, .., total_chunks - 1}`.
    pub fn is_complete(&self) -> bool {
        self.received.len() == self.total_chunks as usize
            && self.received.iter().copied().eq(0..self.total_chunks)
    }
}

/// Number of chunks needed to carry `file_size` bytes.
pub fn total_chunks_for(file_size: i64, chunk_size: i64) -> u32 {
    if file_size <= 0 || chunk_size <= 0 {
        return 0;
    }
    ((file_size + chunk_size - 1) / chunk_size) as u32
}

/// Split a declared file name into stem and extension at the last dot.
///
/// `"report.tar.gz"` gives `("report.tar", "gz")`; a name without a dot has
/// an empty extension. A leading dot (`".env"`) yields an empty stem.
pub fn split_file_name(name: &str) -> (String, String) {
    let base_start = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    match name[base_start..].rfind('.') {
        Some(pos) => {
            let dot = base_start + pos;
            (name[..dot].to_string(), name[dot + 1..].to_string())
        }
        None => (name.to_string(), String::new()),
    }
}
