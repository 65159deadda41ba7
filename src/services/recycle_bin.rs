//! Recycle bin lifecycle: logical delete, restore and reclamation.
//!
//! A deleted file keeps its row with an empty owner and a `recycle_bin`
//! entry pointing at it. Restoring flips the entry's `is_restored` flag and
//! gives the row back to its owner. Reclaiming (on expiry, capacity pressure
//! or an explicit empty) removes the entry and the file row, and drops the
//! content once no file row references it any more.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    accountant,
    content_registry::{self, ContentReaper},
    error::{ServiceError, ServiceResult},
};
use crate::models::{
    file::{FILE_COLUMNS, FileRecord},
    recycle_bin::{ENTRY_COLUMNS, RecycleBinConfig, RecycleBinEntry},
};

pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 100;

const CONFIG_COLUMNS: &str =
    "user_id, auto_clean_days, max_capacity_mb, enable_auto_clean, enable_capacity_clean";

#[derive(Debug, Clone, Serialize)]
pub struct RecycleBinPage {
    pub entries: Vec<RecycleBinEntry>,
    pub total: i64,
    pub total_size: i64,
    pub page: i64,
    pub page_size: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoredFile {
    pub file: FileRecord,
    pub entry: RecycleBinEntry,
    /// False when the original folder was gone and the file went to root.
    pub restored_to_original: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub entries: usize,
    pub bytes: i64,
    pub blobs_reclaimed: usize,
}

impl EvictionReport {
    fn add(&mut self, reclaimed: &Reclaimed) {
        self.entries += 1;
        self.bytes += reclaimed.size;
        if reclaimed.content_released {
            self.blobs_reclaimed += 1;
        }
    }
}

/// Partial settings update; absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecycleBinConfigUpdate {
    pub auto_clean_days: Option<i64>,
    pub max_capacity_mb: Option<i64>,
    pub enable_auto_clean: Option<bool>,
    pub enable_capacity_clean: Option<bool>,
}

struct Reclaimed {
    size: i64,
    content_released: bool,
}

#[derive(Clone)]
pub struct RecycleBinService {
    db: Arc<SqlitePool>,
    reaper: ContentReaper,
}

async fn load_config(conn: &mut SqliteConnection, user_id: &str) -> ServiceResult<RecycleBinConfig> {
    let config = sqlx::query_as::<_, RecycleBinConfig>(&format!(
        "SELECT {} FROM recycle_bin_configs WHERE user_id = ?",
        CONFIG_COLUMNS
    ))
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(config.unwrap_or_else(|| RecycleBinConfig::default_for(user_id)))
}

impl RecycleBinService {
    pub fn new(db: Arc<SqlitePool>, reaper: ContentReaper) -> Self {
        Self { db, reaper }
    }

    /// Move a live file into the recycle bin.
    pub async fn logical_delete(&self, user_id: &str, file_id: &str) -> ServiceResult<RecycleBinEntry> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        let detached = sqlx::query_as::<_, FileRecord>(&format!(
            "UPDATE files SET owner_id = '', deleted_at = ? WHERE id = ? AND owner_id = ?
             RETURNING {}",
            FILE_COLUMNS
        ))
        .bind(now)
        .bind(file_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let file = match detached {
            Some(file) => file,
            None => {
                drop(tx);
                let mut conn = self.db.acquire().await?;
                accountant::owned_file(&mut conn, user_id, file_id).await?;
                return Err(ServiceError::Conflict("file changed concurrently, retry".into()));
            }
        };

        let config = load_config(&mut tx, user_id).await?;
        let entry = sqlx::query_as::<_, RecycleBinEntry>(&format!(
            "INSERT INTO recycle_bin (id, user_id, file_id, original_name, original_folder_id,
                                      size, deleted_at, expire_at, is_restored)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0) RETURNING {}",
            ENTRY_COLUMNS
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(&file.id)
        .bind(file.display_name())
        .bind(&file.parent_folder_id)
        .bind(file.size)
        .bind(now)
        .bind(now + Duration::days(config.auto_clean_days))
        .fetch_one(&mut *tx)
        .await?;

        accountant::apply_delta(&mut tx, &file.parent_folder_id, -file.size).await?;
        accountant::release(&mut tx, user_id, file.size).await?;
        tx.commit().await?;

        info!(user_id, file_id, entry = %entry.id, size = file.size, "moved file to recycle bin");
        Ok(entry)
    }

    /// Give a recycled file back to its owner.
    ///
    /// The file returns to its original folder if the caller still owns it,
    /// otherwise to the caller's root folder. Refused once the entry has
    /// expired or was already restored, and when the quota has no room.
    pub async fn restore(&self, user_id: &str, entry_id: &str) -> ServiceResult<RestoredFile> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        let flagged = sqlx::query_as::<_, RecycleBinEntry>(&format!(
            "UPDATE recycle_bin SET is_restored = 1
             WHERE id = ? AND user_id = ? AND is_restored = 0
             RETURNING {}",
            ENTRY_COLUMNS
        ))
        .bind(entry_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let entry = match flagged {
            Some(entry) => entry,
            None => {
                drop(tx);
                return Err(self.restore_refusal(user_id, entry_id).await?);
            }
        };
        if entry.is_expired(now) {
            return Err(ServiceError::Conflict(format!(
                "recycle bin entry expired at {}",
                entry.expire_at
            )));
        }

        let original = accountant::fetch_folder(&mut tx, &entry.original_folder_id)
            .await?
            .filter(|folder| folder.owner_id == user_id);
        let restored_to_original = original.is_some();
        let target = match original {
            Some(folder) => folder,
            None => accountant::root_folder(&mut tx, user_id).await?,
        };

        accountant::reserve(&mut tx, user_id, entry.size).await?;
        let file = sqlx::query_as::<_, FileRecord>(&format!(
            "UPDATE files SET owner_id = ?, deleted_at = NULL, parent_folder_id = ?
             WHERE id = ? AND owner_id = ''
             RETURNING {}",
            FILE_COLUMNS
        ))
        .bind(user_id)
        .bind(&target.id)
        .bind(&entry.file_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("file `{}`", entry.file_id)))?;
        accountant::apply_delta(&mut tx, &target.id, file.size).await?;
        tx.commit().await?;

        info!(user_id, entry = %entry.id, file_id = %file.id, folder = %target.id, "restored file");
        Ok(RestoredFile {
            file,
            entry,
            restored_to_original,
        })
    }

    async fn restore_refusal(&self, user_id: &str, entry_id: &str) -> ServiceResult<ServiceError> {
        let entry = sqlx::query_as::<_, RecycleBinEntry>(&format!(
            "SELECT {} FROM recycle_bin WHERE id = ?",
            ENTRY_COLUMNS
        ))
        .bind(entry_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(match entry {
            Some(entry) if entry.user_id == user_id && entry.is_restored => {
                ServiceError::Conflict("recycle bin entry already restored".into())
            }
            Some(entry) if entry.user_id == user_id => {
                ServiceError::Conflict("recycle bin entry changed concurrently, retry".into())
            }
            _ => ServiceError::NotFound(format!("recycle bin entry `{}`", entry_id)),
        })
    }

    /// Non-restored entries, newest first.
    pub async fn list(&self, user_id: &str, page: i64, page_size: i64) -> ServiceResult<RecycleBinPage> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);

        let (total, total_size) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM recycle_bin
             WHERE user_id = ? AND is_restored = 0",
        )
        .bind(user_id)
        .fetch_one(&*self.db)
        .await?;
        let entries = sqlx::query_as::<_, RecycleBinEntry>(&format!(
            "SELECT {} FROM recycle_bin WHERE user_id = ? AND is_restored = 0
             ORDER BY deleted_at DESC LIMIT ? OFFSET ?",
            ENTRY_COLUMNS
        ))
        .bind(user_id)
        .bind(page_size)
        .bind((page - 1) * page_size)
        .fetch_all(&*self.db)
        .await?;

        Ok(RecycleBinPage {
            entries,
            total,
            total_size,
            page,
            page_size,
        })
    }

    /// Reclaim every non-restored entry of the caller.
    pub async fn empty(&self, user_id: &str) -> ServiceResult<EvictionReport> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM recycle_bin WHERE user_id = ? AND is_restored = 0",
        )
        .bind(user_id)
        .fetch_all(&*self.db)
        .await?;
        let report = self.reclaim_all(&ids).await?;
        info!(user_id, entries = report.entries, bytes = report.bytes, "emptied recycle bin");
        Ok(report)
    }

    pub async fn get_config(&self, user_id: &str) -> ServiceResult<RecycleBinConfig> {
        sqlx::query("INSERT INTO recycle_bin_configs (user_id) VALUES (?) ON CONFLICT(user_id) DO NOTHING")
            .bind(user_id)
            .execute(&*self.db)
            .await?;
        let mut conn = self.db.acquire().await?;
        load_config(&mut conn, user_id).await
    }

    pub async fn update_config(
        &self,
        user_id: &str,
        update: RecycleBinConfigUpdate,
    ) -> ServiceResult<RecycleBinConfig> {
        let current = self.get_config(user_id).await?;
        let config = RecycleBinConfig {
            user_id: user_id.to_string(),
            auto_clean_days: update.auto_clean_days.unwrap_or(current.auto_clean_days),
            max_capacity_mb: update.max_capacity_mb.unwrap_or(current.max_capacity_mb),
            enable_auto_clean: update.enable_auto_clean.unwrap_or(current.enable_auto_clean),
            enable_capacity_clean: update
                .enable_capacity_clean
                .unwrap_or(current.enable_capacity_clean),
        };
        if !(1..=365).contains(&config.auto_clean_days) {
            return Err(ServiceError::InvalidInput(
                "auto_clean_days must be between 1 and 365".into(),
            ));
        }
        if config.max_capacity_mb < 1 {
            return Err(ServiceError::InvalidInput(
                "max_capacity_mb must be at least 1".into(),
            ));
        }

        sqlx::query(
            "UPDATE recycle_bin_configs SET auto_clean_days = ?, max_capacity_mb = ?,
                    enable_auto_clean = ?, enable_capacity_clean = ?
             WHERE user_id = ?",
        )
        .bind(config.auto_clean_days)
        .bind(config.max_capacity_mb)
        .bind(config.enable_auto_clean)
        .bind(config.enable_capacity_clean)
        .bind(user_id)
        .execute(&*self.db)
        .await?;
        info!(user_id, ?config, "updated recycle bin config");
        Ok(config)
    }

    /// Reclaim entries past their expiry or their owner's retention window.
    pub async fn evict_expired(&self, now: DateTime<Utc>) -> ServiceResult<EvictionReport> {
        let mut report = EvictionReport::default();
        for user_id in self.users_with_entries().await? {
            let config = {
                let mut conn = self.db.acquire().await?;
                load_config(&mut conn, &user_id).await?
            };
            if !config.enable_auto_clean {
                continue;
            }
            let retention_cutoff = now - Duration::days(config.auto_clean_days);
            let ids = sqlx::query_scalar::<_, String>(
                "SELECT id FROM recycle_bin
                 WHERE user_id = ? AND is_restored = 0 AND (expire_at <= ? OR deleted_at <= ?)
                 ORDER BY deleted_at ASC",
            )
            .bind(&user_id)
            .bind(now)
            .bind(retention_cutoff)
            .fetch_all(&*self.db)
            .await?;
            let evicted = self.reclaim_all(&ids).await?;
            if evicted.entries > 0 {
                info!(user_id = %user_id, entries = evicted.entries, bytes = evicted.bytes, "evicted expired recycle bin entries");
            }
            report.entries += evicted.entries;
            report.bytes += evicted.bytes;
            report.blobs_reclaimed += evicted.blobs_reclaimed;
        }
        Ok(report)
    }

    /// Reclaim the oldest entries of every user whose bin is over its cap.
    pub async fn evict_by_capacity(&self) -> ServiceResult<EvictionReport> {
        let mut report = EvictionReport::default();
        for user_id in self.users_with_entries().await? {
            let config = {
                let mut conn = self.db.acquire().await?;
                load_config(&mut conn, &user_id).await?
            };
            if !config.enable_capacity_clean {
                continue;
            }
            let cap = config.max_capacity_bytes();
            let entries = sqlx::query_as::<_, (String, i64)>(
                "SELECT id, size FROM recycle_bin WHERE user_id = ? AND is_restored = 0
                 ORDER BY deleted_at ASC",
            )
            .bind(&user_id)
            .fetch_all(&*self.db)
            .await?;
            let mut held: i64 = entries.iter().map(|(_, size)| size).sum();
            if held <= cap {
                continue;
            }

            let mut evicted = 0;
            for (id, _) in entries {
                if held <= cap {
                    break;
                }
                if let Some(reclaimed) = self.reclaim(&id).await? {
                    held -= reclaimed.size;
                    report.add(&reclaimed);
                    evicted += 1;
                }
            }
            info!(user_id = %user_id, evicted, held, cap, "evicted recycle bin entries over capacity");
        }
        Ok(report)
    }

    async fn users_with_entries(&self) -> ServiceResult<Vec<String>> {
        Ok(sqlx::query_scalar(
            "SELECT DISTINCT user_id FROM recycle_bin WHERE is_restored = 0",
        )
        .fetch_all(&*self.db)
        .await?)
    }

    async fn reclaim_all(&self, ids: &[String]) -> ServiceResult<EvictionReport> {
        let mut report = EvictionReport::default();
        for id in ids {
            if let Some(reclaimed) = self.reclaim(id).await? {
                report.add(&reclaimed);
            }
        }
        Ok(report)
    }

    /// Physically delete one entry and its file row.
    ///
    /// Returns `None` if the entry was restored or reclaimed in the meantime.
    async fn reclaim(&self, entry_id: &str) -> ServiceResult<Option<Reclaimed>> {
        let mut tx = self.db.begin().await?;
        let entry = sqlx::query_as::<_, RecycleBinEntry>(&format!(
            "DELETE FROM recycle_bin WHERE id = ? AND is_restored = 0 RETURNING {}",
            ENTRY_COLUMNS
        ))
        .bind(entry_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(entry) = entry else {
            return Ok(None);
        };

        let fingerprint = sqlx::query_scalar::<_, String>(
            "DELETE FROM files WHERE id = ? AND owner_id = '' RETURNING fingerprint",
        )
        .bind(&entry.file_id)
        .fetch_optional(&mut *tx)
        .await?;
        let released = match &fingerprint {
            Some(fingerprint) => content_registry::release_if_unreferenced(&mut tx, fingerprint).await?,
            None => None,
        };
        tx.commit().await?;

        if let Some(released) = &released {
            self.reaper.purge(std::slice::from_ref(released)).await;
        }
        debug!(entry = %entry.id, file_id = %entry.file_id, content_released = released.is_some(), "reclaimed recycle bin entry");
        Ok(Some(Reclaimed {
            size: entry.size,
            content_released: released.is_some(),
        }))
    }
}
