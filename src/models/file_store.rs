//! Per-user storage quota.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One row per user. `current_size <= max_size` holds after every commit.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FileStore {
    pub id: String,
    pub owner_id: String,

    /// Bytes consumed by the user's live files.
    pub current_size: i64,

    /// Capacity limit in bytes.
    pub max_size: i64,
}

impl FileStore {
    /// Would adding `additional` bytes exceed the limit?
    pub fn exceeds(&self, additional: i64) -> bool {
        self.current_size + additional > self.max_size
    }
}
