//! Fingerprint registry for deduplicated content.
//!
//! `stored_contents` maps a fingerprint to the namespace its blob lives
//! under. Claims happen inside the transaction that creates the file row,
//! and reference counts are derived from `files` rather than stored.

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::{blob_store::BlobStore, chunk_staging::ChunkStaging, error::ServiceResult};
use crate::models::content::{CONTENT_COLUMNS, ContentState, StoredContent, blob_key};

const LOCK_STRIPES: usize = 64;

/// Outcome of registering a fingerprint for a freshly assembled file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentClaim {
    /// Namespace the file row should point at.
    pub storage_path: String,

    /// True when this caller must push the payload to the blob store.
    pub need_upload: bool,
}

impl ContentClaim {
    pub fn blob_key(&self, fingerprint: &str, extension: &str) -> String {
        blob_key(&self.storage_path, fingerprint, extension)
    }
}

/// Register `fingerprint`, or reuse the existing registration.
///
/// The first claimant wins the insert and gets `need_upload = true` with its
/// own namespace. Later claimants reuse the stored namespace and skip the
/// upload, unless the earlier offload was dead-lettered, in which case the
/// claim is taken over and the upload retried.
pub async fn claim(
    conn: &mut SqliteConnection,
    fingerprint: &str,
    namespace: &str,
    extension: &str,
    size: i64,
) -> ServiceResult<ContentClaim> {
    let now = Utc::now();
    let inserted = sqlx::query(
        "INSERT INTO stored_contents (fingerprint, storage_path, extension, size, state,
                                      attempts, last_error, created_at, updated_at)
         VALUES (?, ?, ?, ?, 'pending', 0, NULL, ?, ?)
         ON CONFLICT(fingerprint) DO NOTHING",
    )
    .bind(fingerprint)
    .bind(namespace)
    .bind(extension)
    .bind(size)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    if inserted.rows_affected() == 1 {
        return Ok(ContentClaim {
            storage_path: namespace.to_string(),
            need_upload: true,
        });
    }

    let revived = sqlx::query_scalar::<_, String>(
        "UPDATE stored_contents SET state = 'pending', updated_at = ?
         WHERE fingerprint = ? AND state = 'dead_letter'
         RETURNING storage_path",
    )
    .bind(now)
    .bind(fingerprint)
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(storage_path) = revived {
        debug!(fingerprint, "reclaiming dead-lettered content");
        return Ok(ContentClaim {
            storage_path,
            need_upload: true,
        });
    }

    let storage_path = sqlx::query_scalar::<_, String>(
        "SELECT storage_path FROM stored_contents WHERE fingerprint = ?",
    )
    .bind(fingerprint)
    .fetch_one(&mut *conn)
    .await?;
    Ok(ContentClaim {
        storage_path,
        need_upload: false,
    })
}

/// Number of file rows, live or recycled, referencing `fingerprint`.
pub async fn reference_count(conn: &mut SqliteConnection, fingerprint: &str) -> ServiceResult<i64> {
    Ok(
        sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE fingerprint = ?")
            .bind(fingerprint)
            .fetch_one(&mut *conn)
            .await?,
    )
}

/// Content whose registry row a committed transaction removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedContent {
    pub fingerprint: String,
    pub blob_key: String,
}

/// Drop the registry row once nothing references `fingerprint`.
///
/// Call after the referencing file row is deleted in the same transaction.
/// Returns what to hand to [`ContentReaper::purge`] after commit, or `None`
/// if the content is still referenced.
pub async fn release_if_unreferenced(
    conn: &mut SqliteConnection,
    fingerprint: &str,
) -> ServiceResult<Option<ReleasedContent>> {
    if reference_count(conn, fingerprint).await? > 0 {
        return Ok(None);
    }
    let row = sqlx::query_as::<_, (String, String)>(
        "DELETE FROM stored_contents WHERE fingerprint = ? RETURNING storage_path, extension",
    )
    .bind(fingerprint)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(|(storage_path, extension)| ReleasedContent {
        fingerprint: fingerprint.to_string(),
        blob_key: blob_key(&storage_path, fingerprint, &extension),
    }))
}

pub async fn fetch(db: &SqlitePool, fingerprint: &str) -> ServiceResult<Option<StoredContent>> {
    Ok(sqlx::query_as::<_, StoredContent>(&format!(
        "SELECT {} FROM stored_contents WHERE fingerprint = ?",
        CONTENT_COLUMNS
    ))
    .bind(fingerprint)
    .fetch_optional(db)
    .await?)
}

/// Record a successful offload. Returns false if the content was reclaimed
/// while the upload was in flight.
pub async fn mark_stored(db: &SqlitePool, fingerprint: &str, attempts: u32) -> ServiceResult<bool> {
    let result = sqlx::query(
        "UPDATE stored_contents SET state = 'stored', attempts = attempts + ?, last_error = NULL,
                updated_at = ?
         WHERE fingerprint = ?",
    )
    .bind(i64::from(attempts))
    .bind(Utc::now())
    .bind(fingerprint)
    .execute(db)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_dead_letter(
    db: &SqlitePool,
    fingerprint: &str,
    attempts: u32,
    error: &str,
) -> ServiceResult<()> {
    sqlx::query(
        "UPDATE stored_contents SET state = 'dead_letter', attempts = attempts + ?, last_error = ?,
                updated_at = ?
         WHERE fingerprint = ?",
    )
    .bind(i64::from(attempts))
    .bind(error)
    .bind(Utc::now())
    .bind(fingerprint)
    .execute(db)
    .await?;
    Ok(())
}

/// Flip one dead-lettered row back to pending. Returns it if this caller won.
pub async fn revive_dead_letter(
    db: &SqlitePool,
    fingerprint: &str,
) -> ServiceResult<Option<StoredContent>> {
    Ok(sqlx::query_as::<_, StoredContent>(&format!(
        "UPDATE stored_contents SET state = 'pending', updated_at = ?
         WHERE fingerprint = ? AND state = 'dead_letter'
         RETURNING {}",
        CONTENT_COLUMNS
    ))
    .bind(Utc::now())
    .bind(fingerprint)
    .fetch_optional(db)
    .await?)
}

pub async fn list_by_state(db: &SqlitePool, state: ContentState) -> ServiceResult<Vec<StoredContent>> {
    Ok(sqlx::query_as::<_, StoredContent>(&format!(
        "SELECT {} FROM stored_contents WHERE state = ? ORDER BY updated_at ASC",
        CONTENT_COLUMNS
    ))
    .bind(state)
    .fetch_all(db)
    .await?)
}

/// Physical side of content reclamation.
///
/// Blob deletes and offload puts of the same key are serialized through a
/// striped lock, and a delete only goes ahead if the registry still has no
/// row for that key once the lock is held. A re-upload that lands between
/// commit and purge therefore keeps its blob.
#[derive(Clone)]
pub struct ContentReaper {
    db: Arc<SqlitePool>,
    blobs: Arc<dyn BlobStore>,
    staging: ChunkStaging,
    stripes: Arc<Vec<Mutex<()>>>,
}

impl ContentReaper {
    pub fn new(db: Arc<SqlitePool>, blobs: Arc<dyn BlobStore>, staging: ChunkStaging) -> Self {
        Self {
            db,
            blobs,
            staging,
            stripes: Arc::new((0..LOCK_STRIPES).map(|_| Mutex::new(())).collect()),
        }
    }

    pub fn blobs(&self) -> &dyn BlobStore {
        self.blobs.as_ref()
    }

    /// Exclusive access to `key` against other puts and deletes.
    pub async fn lock_key(&self, key: &str) -> MutexGuard<'_, ()> {
        let stripe = md5::compute(key.as_bytes()).0[0] as usize % self.stripes.len();
        self.stripes[stripe].lock().await
    }

    /// Delete the blobs of released content, skipping any key the registry
    /// has claimed again since. Failures are logged only. Returns the number
    /// of blobs deleted.
    pub async fn purge(&self, released: &[ReleasedContent]) -> usize {
        let mut deleted = 0;
        for content in released {
            let _guard = self.lock_key(&content.blob_key).await;
            let current = match fetch(&self.db, &content.fingerprint).await {
                Ok(current) => current,
                Err(err) => {
                    warn!(key = %content.blob_key, error = %err, "registry lookup failed, keeping blob");
                    continue;
                }
            };
            match &current {
                Some(row) if row.blob_key() == content.blob_key => {
                    debug!(key = %content.blob_key, "content claimed again, keeping blob");
                    continue;
                }
                Some(_) => {}
                None => {
                    self.staging
                        .discard(&self.staging.dead_letter_path(&content.fingerprint))
                        .await;
                }
            }
            match self.blobs.delete(&content.blob_key).await {
                Ok(()) => {
                    debug!(key = %content.blob_key, "reclaimed blob");
                    deleted += 1;
                }
                Err(err) => warn!(key = %content.blob_key, error = %err, "failed to delete unreferenced blob"),
            }
        }
        deleted
    }
}
