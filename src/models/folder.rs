//! Represents a node in a user's folder tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// `parent_id` of a top-level folder.
pub const ROOT_PARENT: &str = "root";

/// Name given to the folder created when a store is provisioned.
pub const ROOT_FOLDER_NAME: &str = "main";

/// A folder. `size` is the cumulative size of every live file beneath it.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FileFolder {
    pub id: String,
    pub name: String,

    /// Parent folder id, or [`ROOT_PARENT`] for a top-level folder.
    pub parent_id: String,

    pub file_store_id: String,
    pub owner_id: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
}

impl FileFolder {
    pub fn is_top_level(&self) -> bool {
        self.parent_id == ROOT_PARENT || self.parent_id.is_empty()
    }
}

pub(crate) const FOLDER_COLUMNS: &str =
    "id, name, parent_id, file_store_id, owner_id, size, created_at";
