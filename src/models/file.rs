//! Represents a user-visible file record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A file in a user's folder tree.
///
/// The payload itself is a `StoredContent` keyed by `fingerprint`; many file
/// rows may share one. `owner_id` is empty while the file sits in the
/// recycle bin.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FileRecord {
    pub id: String,

    /// Owning user, or empty if logically deleted.
    pub owner_id: String,

    /// Display name without extension.
    pub file_name: String,

    /// Extension without the leading dot; may be empty.
    pub extension: String,

    /// Content fingerprint, the key into `stored_contents`.
    pub fingerprint: String,

    /// Blob-store namespace the content was first uploaded under.
    pub storage_path: String,

    pub parent_folder_id: String,

    /// Size in bytes; always equal to the referenced content's size.
    pub size: i64,

    pub created_at: DateTime<Utc>,

    /// Set while the file is in the recycle bin.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl FileRecord {
    /// Name with extension re-attached, as the user uploaded it.
    pub fn display_name(&self) -> String {
        if self.extension.is_empty() {
            self.file_name.clone()
        } else {
            format!("{}.{}", self.file_name, self.extension)
        }
    }
}

pub(crate) const FILE_COLUMNS: &str = "id, owner_id, file_name, extension, fingerprint, \
     storage_path, parent_folder_id, size, created_at, deleted_at";
