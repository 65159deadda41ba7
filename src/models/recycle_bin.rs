//! Recycle bin entries and per-user retention settings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A logically deleted file awaiting restore or reclamation.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct RecycleBinEntry {
    pub id: String,
    pub user_id: String,
    pub file_id: String,

    /// Name with extension at the time of deletion.
    pub original_name: String,

    /// Folder the file lived in when it was deleted.
    pub original_folder_id: String,

    pub size: i64,
    pub deleted_at: DateTime<Utc>,

    /// Restore is refused at or after this instant.
    pub expire_at: DateTime<Utc>,

    /// Only ever flips from false to true.
    pub is_restored: bool,
}

impl RecycleBinEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expire_at
    }
}

pub(crate) const ENTRY_COLUMNS: &str = "id, user_id, file_id, original_name, original_folder_id, \
     size, deleted_at, expire_at, is_restored";

pub const DEFAULT_AUTO_CLEAN_DAYS: i64 = 30;
pub const DEFAULT_MAX_CAPACITY_MB: i64 = 1024;

/// Per-user recycle bin policy.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct RecycleBinConfig {
    pub user_id: String,

    /// Retention window in days.
    pub auto_clean_days: i64,

    /// Cap on the bytes held in the bin, in MiB.
    pub max_capacity_mb: i64,

    pub enable_auto_clean: bool,
    pub enable_capacity_clean: bool,
}

impl RecycleBinConfig {
    pub fn default_for(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            auto_clean_days: DEFAULT_AUTO_CLEAN_DAYS,
            max_capacity_mb: DEFAULT_MAX_CAPACITY_MB,
            enable_auto_clean: true,
            enable_capacity_clean: true,
        }
    }

    pub fn max_capacity_bytes(&self) -> i64 {
        self.max_capacity_mb * 1024 * 1024
    }
}
