//! Deduplicated, content-addressed payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Offload progress of a stored content blob.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ContentState {
    /// Claimed by a completed upload, not yet confirmed in the blob store.
    Pending,
    /// Present in the blob store.
    Stored,
    /// Every offload attempt failed; payload parked for retry.
    DeadLetter,
}

/// One physical blob, referenced by any number of `FileRecord`s.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StoredContent {
    /// MD5 over `"." + extension` followed by the bytes, lowercase hex.
    pub fingerprint: String,

    /// Namespace (the first uploader's user id).
    pub storage_path: String,

    pub extension: String,
    pub size: i64,
    pub state: ContentState,

    /// Offload attempts made so far.
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredContent {
    pub fn blob_key(&self) -> String {
        blob_key(&self.storage_path, &self.fingerprint, &self.extension)
    }
}

/// Object key for a blob: `{namespace}/{fingerprint}[.{extension}]`.
pub fn blob_key(storage_path: &str, fingerprint: &str, extension: &str) -> String {
    if extension.is_empty() {
        format!("{}/{}", storage_path, fingerprint)
    } else {
        format!("{}/{}.{}", storage_path, fingerprint, extension)
    }
}

pub(crate) const CONTENT_COLUMNS: &str = "fingerprint, storage_path, extension, size, state, \
     attempts, last_error, created_at, updated_at";
