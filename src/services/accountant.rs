//! Quota and folder-size bookkeeping.
//!
//! Two aggregates are kept in step with the live file set:
//! `file_stores.current_size` per user, and `file_folders.size` for every
//! folder on the path from a file up to the root. The free functions here
//! take a connection so callers can run them inside their own transaction;
//! [`Accountant`] owns the folder-level operations.

use chrono::Utc;
use serde::Serialize;
use sqlx::{QueryBuilder, SqliteConnection, SqlitePool, sqlite::Sqlite};
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    content_registry::{self, ContentReaper},
    error::{ServiceError, ServiceResult},
};
use crate::models::{
    file::{FILE_COLUMNS, FileRecord},
    file_store::FileStore,
    folder::{FOLDER_COLUMNS, FileFolder, ROOT_FOLDER_NAME, ROOT_PARENT},
};

/// Longest parent chain walked before the tree is declared corrupt.
pub const MAX_FOLDER_DEPTH: usize = 256;

pub async fn fetch_store(conn: &mut SqliteConnection, owner_id: &str) -> ServiceResult<FileStore> {
    sqlx::query_as::<_, FileStore>(
        "SELECT id, owner_id, current_size, max_size FROM file_stores WHERE owner_id = ?",
    )
    .bind(owner_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| ServiceError::NotFound("file store".into()))
}

pub async fn fetch_folder(
    conn: &mut SqliteConnection,
    folder_id: &str,
) -> ServiceResult<Option<FileFolder>> {
    Ok(sqlx::query_as::<_, FileFolder>(&format!(
        "SELECT {} FROM file_folders WHERE id = ?",
        FOLDER_COLUMNS
    ))
    .bind(folder_id)
    .fetch_optional(&mut *conn)
    .await?)
}

/// Load a folder and check that `owner_id` owns it.
pub async fn owned_folder(
    conn: &mut SqliteConnection,
    owner_id: &str,
    folder_id: &str,
) -> ServiceResult<FileFolder> {
    let folder = fetch_folder(conn, folder_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("folder `{}`", folder_id)))?;
    if folder.owner_id != owner_id {
        return Err(ServiceError::Forbidden);
    }
    Ok(folder)
}

/// The user's top-level folder.
pub async fn root_folder(conn: &mut SqliteConnection, owner_id: &str) -> ServiceResult<FileFolder> {
    sqlx::query_as::<_, FileFolder>(&format!(
        "SELECT {} FROM file_folders WHERE owner_id = ? AND parent_id = ?
         ORDER BY created_at ASC LIMIT 1",
        FOLDER_COLUMNS
    ))
    .bind(owner_id)
    .bind(ROOT_PARENT)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| ServiceError::NotFound("root folder".into()))
}

/// Read-only pre-check: would `additional` bytes push the user over quota?
pub async fn check_capacity(db: &SqlitePool, owner_id: &str, additional: i64) -> ServiceResult<()> {
    let mut conn = db.acquire().await?;
    let store = fetch_store(&mut conn, owner_id).await?;
    if store.exceeds(additional) {
        return Err(ServiceError::QuotaExceeded {
            requested: additional,
            available: (store.max_size - store.current_size).max(0),
        });
    }
    Ok(())
}

/// Grow the user's usage by `bytes`, refusing to cross `max_size`.
///
/// The limit is checked by the same statement that applies the increase, so
/// concurrent reservations can never jointly exceed the quota.
pub async fn reserve(conn: &mut SqliteConnection, owner_id: &str, bytes: i64) -> ServiceResult<()> {
    let updated = sqlx::query(
        "UPDATE file_stores SET current_size = current_size + ?
         WHERE owner_id = ? AND current_size + ? <= max_size",
    )
    .bind(bytes)
    .bind(owner_id)
    .bind(bytes)
    .execute(&mut *conn)
    .await?;
    if updated.rows_affected() == 1 {
        return Ok(());
    }

    let store = fetch_store(conn, owner_id).await?;
    Err(ServiceError::QuotaExceeded {
        requested: bytes,
        available: (store.max_size - store.current_size).max(0),
    })
}

/// Shrink the user's usage by `bytes`, never below zero.
pub async fn release(conn: &mut SqliteConnection, owner_id: &str, bytes: i64) -> ServiceResult<()> {
    let updated = sqlx::query(
        "UPDATE file_stores SET current_size = MAX(current_size - ?, 0) WHERE owner_id = ?",
    )
    .bind(bytes)
    .bind(owner_id)
    .execute(&mut *conn)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(ServiceError::NotFound("file store".into()));
    }
    Ok(())
}

/// Add `delta` to `folder_id` and every ancestor.
///
/// The walk stops at the root sentinel or at a parent that no longer exists.
/// Sizes are clamped at zero. Returns the number of folders touched.
pub async fn apply_delta(
    conn: &mut SqliteConnection,
    folder_id: &str,
    delta: i64,
) -> ServiceResult<usize> {
    let mut current = folder_id.to_string();
    let mut touched = 0;
    while current != ROOT_PARENT && !current.is_empty() {
        if touched >= MAX_FOLDER_DEPTH {
            return Err(ServiceError::FolderCycle(MAX_FOLDER_DEPTH));
        }
        let parent = sqlx::query_scalar::<_, String>(
            "UPDATE file_folders SET size = MAX(size + ?, 0) WHERE id = ? RETURNING parent_id",
        )
        .bind(delta)
        .bind(&current)
        .fetch_optional(&mut *conn)
        .await?;
        match parent {
            Some(parent) => {
                touched += 1;
                current = parent;
            }
            None => break,
        }
    }
    Ok(touched)
}

/// Outcome of [`Accountant::delete_folder`].
#[derive(Debug, Clone, Serialize)]
pub struct FolderDeletion {
    pub folder_id: String,
    pub folders_removed: usize,
    pub files_removed: usize,
    pub bytes_freed: i64,
    pub blobs_reclaimed: usize,
}

/// Folder tree and quota operations for a user's store.
#[derive(Clone)]
pub struct Accountant {
    db: Arc<SqlitePool>,
    reaper: ContentReaper,
    default_quota: i64,
}

impl Accountant {
    pub fn new(db: Arc<SqlitePool>, reaper: ContentReaper, default_quota: i64) -> Self {
        Self {
            db,
            reaper,
            default_quota,
        }
    }

    /// Create the user's store and root folder if they do not exist yet.
    pub async fn provision(
        &self,
        owner_id: &str,
        max_size: Option<i64>,
    ) -> ServiceResult<(FileStore, FileFolder)> {
        if owner_id.is_empty() {
            return Err(ServiceError::InvalidInput("user id must not be empty".into()));
        }
        let max_size = max_size.unwrap_or(self.default_quota);
        if max_size <= 0 {
            return Err(ServiceError::InvalidInput("max_size must be positive".into()));
        }

        let mut tx = self.db.begin().await?;
        let created = sqlx::query(
            "INSERT INTO file_stores (id, owner_id, current_size, max_size) VALUES (?, ?, 0, ?)
             ON CONFLICT(owner_id) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(owner_id)
        .bind(max_size)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;
        let store = fetch_store(&mut tx, owner_id).await?;

        let root = match root_folder(&mut tx, owner_id).await {
            Ok(root) => root,
            Err(ServiceError::NotFound(_)) => {
                sqlx::query_as::<_, FileFolder>(&format!(
                    "INSERT INTO file_folders (id, name, parent_id, file_store_id, owner_id, size, created_at)
                     VALUES (?, ?, ?, ?, ?, 0, ?) RETURNING {}",
                    FOLDER_COLUMNS
                ))
                .bind(Uuid::new_v4().to_string())
                .bind(ROOT_FOLDER_NAME)
                .bind(ROOT_PARENT)
                .bind(&store.id)
                .bind(owner_id)
                .bind(Utc::now())
                .fetch_one(&mut *tx)
                .await?
            }
            Err(err) => return Err(err),
        };
        tx.commit().await?;

        if created {
            info!(owner_id, max_size, root_folder = %root.id, "provisioned file store");
        }
        Ok((store, root))
    }

    pub async fn store_info(&self, owner_id: &str) -> ServiceResult<FileStore> {
        let mut conn = self.db.acquire().await?;
        fetch_store(&mut conn, owner_id).await
    }

    pub async fn create_folder(
        &self,
        owner_id: &str,
        name: &str,
        parent_id: &str,
    ) -> ServiceResult<FileFolder> {
        let name = name.trim();
        if name.is_empty() || name.contains('/') {
            return Err(ServiceError::InvalidInput(
                "folder name must be non-empty and contain no `/`".into(),
            ));
        }

        let mut conn = self.db.acquire().await?;
        let parent = owned_folder(&mut conn, owner_id, parent_id).await?;
        let folder = sqlx::query_as::<_, FileFolder>(&format!(
            "INSERT INTO file_folders (id, name, parent_id, file_store_id, owner_id, size, created_at)
             VALUES (?, ?, ?, ?, ?, 0, ?) RETURNING {}",
            FOLDER_COLUMNS
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(name)
        .bind(&parent.id)
        .bind(&parent.file_store_id)
        .bind(owner_id)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await?;
        debug!(owner_id, folder = %folder.id, parent = %parent.id, "created folder");
        Ok(folder)
    }

    /// A folder with its direct children, both folders and live files.
    pub async fn folder_listing(
        &self,
        owner_id: &str,
        folder_id: &str,
    ) -> ServiceResult<(FileFolder, Vec<FileFolder>, Vec<FileRecord>)> {
        let mut conn = self.db.acquire().await?;
        let folder = owned_folder(&mut conn, owner_id, folder_id).await?;
        let folders = sqlx::query_as::<_, FileFolder>(&format!(
            "SELECT {} FROM file_folders WHERE parent_id = ? AND owner_id = ? ORDER BY name ASC",
            FOLDER_COLUMNS
        ))
        .bind(&folder.id)
        .bind(owner_id)
        .fetch_all(&mut *conn)
        .await?;
        let files = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {} FROM files WHERE parent_folder_id = ? AND owner_id = ?
             ORDER BY file_name ASC",
            FILE_COLUMNS
        ))
        .bind(&folder.id)
        .bind(owner_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok((folder, folders, files))
    }

    /// Hard-delete a folder, its subfolders and every live file beneath it.
    ///
    /// Recycled files that originally lived here are left alone; a later
    /// restore falls back to the root folder. Content no longer referenced
    /// by any file row is dropped and its blob deleted after commit.
    pub async fn delete_folder(
        &self,
        owner_id: &str,
        folder_id: &str,
    ) -> ServiceResult<FolderDeletion> {
        let mut tx = self.db.begin().await?;
        let removed = sqlx::query_as::<_, FileFolder>(&format!(
            "DELETE FROM file_folders WHERE id = ? AND owner_id = ? RETURNING {}",
            FOLDER_COLUMNS
        ))
        .bind(folder_id)
        .bind(owner_id)
        .fetch_optional(&mut *tx)
        .await?;
        let folder = match removed {
            Some(folder) => folder,
            None => {
                drop(tx);
                let mut conn = self.db.acquire().await?;
                owned_folder(&mut conn, owner_id, folder_id).await?;
                return Err(ServiceError::NotFound(format!("folder `{}`", folder_id)));
            }
        };
        if folder.is_top_level() {
            return Err(ServiceError::InvalidInput(
                "the root folder cannot be deleted".into(),
            ));
        }

        // Breadth-first over the subtree; `seen` keeps a corrupt cycle finite.
        let mut subtree = vec![folder.id.clone()];
        let mut seen: HashSet<String> = subtree.iter().cloned().collect();
        let mut frontier = subtree.clone();
        let mut depth = 0;
        while !frontier.is_empty() {
            depth += 1;
            if depth > MAX_FOLDER_DEPTH {
                return Err(ServiceError::FolderCycle(MAX_FOLDER_DEPTH));
            }
            let mut query = QueryBuilder::<Sqlite>::new("SELECT id FROM file_folders WHERE parent_id IN (");
            let mut ids = query.separated(", ");
            for id in &frontier {
                ids.push_bind(id.clone());
            }
            query.push(")");
            let children: Vec<String> = query.build_query_scalar().fetch_all(&mut *tx).await?;
            frontier = children
                .into_iter()
                .filter(|id| seen.insert(id.clone()))
                .collect();
            subtree.extend(frontier.iter().cloned());
        }

        let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM files WHERE owner_id = ");
        query.push_bind(owner_id);
        query.push(" AND parent_folder_id IN (");
        let mut ids = query.separated(", ");
        for id in &subtree {
            ids.push_bind(id.clone());
        }
        query.push(") RETURNING fingerprint");
        let fingerprints: Vec<String> = query.build_query_scalar().fetch_all(&mut *tx).await?;
        let files_removed = fingerprints.len();

        let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM file_folders WHERE id IN (");
        let mut ids = query.separated(", ");
        for id in subtree.iter().skip(1) {
            ids.push_bind(id.clone());
        }
        query.push(")");
        if subtree.len() > 1 {
            query.build().execute(&mut *tx).await?;
        }

        let distinct: HashSet<String> = fingerprints.into_iter().collect();
        let mut reclaimed = Vec::new();
        for fingerprint in &distinct {
            if let Some(released) = content_registry::release_if_unreferenced(&mut tx, fingerprint).await? {
                reclaimed.push(released);
            }
        }

        apply_delta(&mut tx, &folder.parent_id, -folder.size).await?;
        release(&mut tx, owner_id, folder.size).await?;
        tx.commit().await?;

        self.reaper.purge(&reclaimed).await;
        info!(
            owner_id,
            folder = %folder.id,
            folders = subtree.len(),
            files = files_removed,
            bytes = folder.size,
            "deleted folder"
        );
        Ok(FolderDeletion {
            folder_id: folder.id,
            folders_removed: subtree.len(),
            files_removed,
            bytes_freed: folder.size,
            blobs_reclaimed: reclaimed.len(),
        })
    }

    /// Rename a live file and/or move it to another folder.
    ///
    /// Moving subtracts the size along the old ancestor chain and adds it
    /// along the new one. The store total is unchanged.
    pub async fn move_file(
        &self,
        owner_id: &str,
        file_id: &str,
        target_folder_id: Option<&str>,
        new_name: Option<&str>,
    ) -> ServiceResult<FileRecord> {
        if let Some(name) = new_name {
            if name.trim().is_empty() || name.contains('/') {
                return Err(ServiceError::InvalidInput(
                    "file name must be non-empty and contain no `/`".into(),
                ));
            }
        }

        // Validate outside the write transaction, then apply guarded by the
        // values read so a concurrent change surfaces as a conflict.
        let (file, target) = {
            let mut conn = self.db.acquire().await?;
            let file = owned_file(&mut conn, owner_id, file_id).await?;
            let target = match target_folder_id {
                Some(id) => owned_folder(&mut conn, owner_id, id).await?,
                None => owned_folder(&mut conn, owner_id, &file.parent_folder_id).await?,
            };
            (file, target)
        };
        let file_name = new_name.map(str::trim).unwrap_or(&file.file_name);

        let mut tx = self.db.begin().await?;
        let moved = sqlx::query_as::<_, FileRecord>(&format!(
            "UPDATE files SET file_name = ?, parent_folder_id = ?
             WHERE id = ? AND owner_id = ? AND parent_folder_id = ?
             RETURNING {}",
            FILE_COLUMNS
        ))
        .bind(file_name)
        .bind(&target.id)
        .bind(&file.id)
        .bind(owner_id)
        .bind(&file.parent_folder_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ServiceError::Conflict("file changed concurrently, retry".into()))?;

        if file.parent_folder_id != target.id {
            apply_delta(&mut tx, &file.parent_folder_id, -file.size).await?;
            apply_delta(&mut tx, &target.id, file.size).await?;
        }
        tx.commit().await?;
        debug!(owner_id, file = %moved.id, from = %file.parent_folder_id, to = %target.id, "moved file");
        Ok(moved)
    }

    /// Rename a folder and/or re-parent it with its whole subtree.
    ///
    /// The folder's size leaves the old ancestor chain and joins the new
    /// one in the same transaction. The root folder cannot move, and a
    /// folder cannot become its own descendant.
    pub async fn move_folder(
        &self,
        owner_id: &str,
        folder_id: &str,
        new_parent_id: Option<&str>,
        new_name: Option<&str>,
    ) -> ServiceResult<FileFolder> {
        if let Some(name) = new_name {
            if name.trim().is_empty() || name.contains('/') {
                return Err(ServiceError::InvalidInput(
                    "folder name must be non-empty and contain no `/`".into(),
                ));
            }
        }

        let (folder, target) = {
            let mut conn = self.db.acquire().await?;
            let folder = owned_folder(&mut conn, owner_id, folder_id).await?;
            if folder.is_top_level() {
                return Err(ServiceError::InvalidInput(
                    "the root folder cannot be moved".into(),
                ));
            }
            let target = match new_parent_id {
                Some(id) => owned_folder(&mut conn, owner_id, id).await?,
                None => owned_folder(&mut conn, owner_id, &folder.parent_id).await?,
            };
            ensure_not_within(&mut conn, &folder.id, &target).await?;
            (folder, target)
        };
        let name = new_name.map(str::trim).unwrap_or(&folder.name);

        let mut tx = self.db.begin().await?;
        let moved = sqlx::query_as::<_, FileFolder>(&format!(
            "UPDATE file_folders SET name = ?, parent_id = ?
             WHERE id = ? AND owner_id = ? AND parent_id = ?
             RETURNING {}",
            FOLDER_COLUMNS
        ))
        .bind(name)
        .bind(&target.id)
        .bind(&folder.id)
        .bind(owner_id)
        .bind(&folder.parent_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ServiceError::Conflict("folder changed concurrently, retry".into()))?;

        if folder.parent_id != target.id {
            // Re-check inside the write transaction: a concurrent move may
            // have placed the target under this folder since validation.
            ensure_not_within(&mut tx, &folder.id, &target).await?;
            apply_delta(&mut tx, &folder.parent_id, -folder.size).await?;
            apply_delta(&mut tx, &target.id, folder.size).await?;
        }
        tx.commit().await?;
        debug!(owner_id, folder = %moved.id, from = %folder.parent_id, to = %target.id, "moved folder");
        Ok(moved)
    }
}

/// Fail if `target` is `folder_id` itself or lies anywhere beneath it.
async fn ensure_not_within(
    conn: &mut SqliteConnection,
    folder_id: &str,
    target: &FileFolder,
) -> ServiceResult<()> {
    let mut current = target.id.clone();
    for _ in 0..MAX_FOLDER_DEPTH {
        if current == folder_id {
            return Err(ServiceError::InvalidInput(
                "a folder cannot be moved into itself or its descendants".into(),
            ));
        }
        if current == ROOT_PARENT || current.is_empty() {
            return Ok(());
        }
        match fetch_folder(conn, &current).await? {
            Some(next) => current = next.parent_id,
            None => return Ok(()),
        }
    }
    Err(ServiceError::FolderCycle(MAX_FOLDER_DEPTH))
}

/// Load a live file owned by `owner_id`. Recycled files read as missing.
pub async fn owned_file(
    conn: &mut SqliteConnection,
    owner_id: &str,
    file_id: &str,
) -> ServiceResult<FileRecord> {
    let file = sqlx::query_as::<_, FileRecord>(&format!(
        "SELECT {} FROM files WHERE id = ?",
        FILE_COLUMNS
    ))
    .bind(file_id)
    .fetch_optional(&mut *conn)
    .await?
    .filter(|file| !file.owner_id.is_empty())
    .ok_or_else(|| ServiceError::NotFound(format!("file `{}`", file_id)))?;
    if file.owner_id != owner_id {
        return Err(ServiceError::Forbidden);
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{blob_store::testing::FakeBlobStore, chunk_staging::ChunkStaging};
    use crate::test_support::{insert_content, insert_file};

    async fn accountant(quota: i64) -> (Accountant, Arc<SqlitePool>, Arc<FakeBlobStore>) {
        let db = Arc::new(crate::db::test_pool().await);
        let blobs = Arc::new(FakeBlobStore::default());
        // never created; purges only ever discard from it
        let staging = ChunkStaging::new(std::env::temp_dir().join(Uuid::new_v4().to_string()));
        let reaper = ContentReaper::new(db.clone(), blobs.clone(), staging);
        (Accountant::new(db.clone(), reaper, quota), db, blobs)
    }

    async fn folder_size(db: &SqlitePool, id: &str) -> i64 {
        sqlx::query_scalar("SELECT size FROM file_folders WHERE id = ?")
            .bind(id)
            .fetch_one(db)
            .await
            .unwrap()
    }

    async fn used(db: &SqlitePool, owner: &str) -> i64 {
        sqlx::query_scalar("SELECT current_size FROM file_stores WHERE owner_id = ?")
            .bind(owner)
            .fetch_one(db)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn provision_is_idempotent() {
        let (acct, _db, _) = accountant(1000).await;
        let (store, root) = acct.provision("alice", None).await.unwrap();
        let (again, root_again) = acct.provision("alice", Some(5)).await.unwrap();
        assert_eq!(store.id, again.id);
        assert_eq!(again.max_size, 1000);
        assert_eq!(root.id, root_again.id);
        assert_eq!(root.name, ROOT_FOLDER_NAME);
        assert!(root.is_top_level());
    }

    #[tokio::test]
    async fn reserve_refuses_to_cross_quota() {
        let (acct, db, _) = accountant(100).await;
        acct.provision("alice", None).await.unwrap();
        let mut conn = db.acquire().await.unwrap();

        reserve(&mut conn, "alice", 60).await.unwrap();
        reserve(&mut conn, "alice", 40).await.unwrap();
        let err = reserve(&mut conn, "alice", 1).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::QuotaExceeded {
                requested: 1,
                available: 0
            }
        ));
        drop(conn);
        assert_eq!(used(&db, "alice").await, 100);
    }

    #[tokio::test]
    async fn reserve_without_store_is_not_found() {
        let (_acct, db, _) = accountant(100).await;
        let mut conn = db.acquire().await.unwrap();
        assert!(matches!(
            reserve(&mut conn, "ghost", 1).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delta_walks_to_root_and_clamps() {
        let (acct, db, _) = accountant(1000).await;
        let (_, root) = acct.provision("alice", None).await.unwrap();
        let a = acct.create_folder("alice", "a", &root.id).await.unwrap();
        let b = acct.create_folder("alice", "b", &a.id).await.unwrap();

        let mut conn = db.acquire().await.unwrap();
        assert_eq!(apply_delta(&mut conn, &b.id, 30).await.unwrap(), 3);
        apply_delta(&mut conn, &a.id, -50).await.unwrap();
        drop(conn);

        assert_eq!(folder_size(&db, &b.id).await, 30);
        assert_eq!(folder_size(&db, &a.id).await, 0);
        assert_eq!(folder_size(&db, &root.id).await, 0);
    }

    #[tokio::test]
    async fn delta_stops_at_missing_parent() {
        let (acct, db, _) = accountant(1000).await;
        let (_, root) = acct.provision("alice", None).await.unwrap();
        let a = acct.create_folder("alice", "a", &root.id).await.unwrap();
        sqlx::query("UPDATE file_folders SET parent_id = 'vanished' WHERE id = ?")
            .bind(&a.id)
            .execute(&*db)
            .await
            .unwrap();

        let mut conn = db.acquire().await.unwrap();
        assert_eq!(apply_delta(&mut conn, &a.id, 10).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delta_detects_cycles() {
        let (acct, db, _) = accountant(1000).await;
        let (_, root) = acct.provision("alice", None).await.unwrap();
        let a = acct.create_folder("alice", "a", &root.id).await.unwrap();
        let b = acct.create_folder("alice", "b", &a.id).await.unwrap();
        sqlx::query("UPDATE file_folders SET parent_id = ? WHERE id = ?")
            .bind(&b.id)
            .bind(&a.id)
            .execute(&*db)
            .await
            .unwrap();

        let mut conn = db.acquire().await.unwrap();
        let err = apply_delta(&mut conn, &b.id, 1).await.unwrap_err();
        assert!(matches!(err, ServiceError::FolderCycle(MAX_FOLDER_DEPTH)));
    }

    #[tokio::test]
    async fn create_folder_checks_parent_owner() {
        let (acct, _db, _) = accountant(1000).await;
        let (_, alice_root) = acct.provision("alice", None).await.unwrap();
        acct.provision("bob", None).await.unwrap();

        assert!(matches!(
            acct.create_folder("bob", "x", &alice_root.id).await,
            Err(ServiceError::Forbidden)
        ));
        assert!(matches!(
            acct.create_folder("alice", "x", "nope").await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            acct.create_folder("alice", "a/b", &alice_root.id).await,
            Err(ServiceError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn move_shifts_size_between_chains() {
        let (acct, db, _) = accountant(1000).await;
        let (_, root) = acct.provision("alice", None).await.unwrap();
        let a = acct.create_folder("alice", "a", &root.id).await.unwrap();
        let b = acct.create_folder("alice", "b", &root.id).await.unwrap();
        insert_content(&db, "fp1", "alice", "txt", 40).await;
        let file = insert_file(&db, "alice", &a.id, "fp1", "txt", 40).await;

        let moved = acct
            .move_file("alice", &file.id, Some(&b.id), Some("renamed"))
            .await
            .unwrap();
        assert_eq!(moved.parent_folder_id, b.id);
        assert_eq!(moved.display_name(), "renamed.txt");
        assert_eq!(folder_size(&db, &a.id).await, 0);
        assert_eq!(folder_size(&db, &b.id).await, 40);
        assert_eq!(folder_size(&db, &root.id).await, 40);
        assert_eq!(used(&db, "alice").await, 40);

        assert!(matches!(
            acct.move_file("bob", &file.id, None, Some("x")).await,
            Err(ServiceError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn move_folder_shifts_subtree_size_between_chains() {
        let (acct, db, _) = accountant(1000).await;
        let (_, root) = acct.provision("alice", None).await.unwrap();
        let src = acct.create_folder("alice", "src", &root.id).await.unwrap();
        let dst = acct.create_folder("alice", "dst", &root.id).await.unwrap();
        let deep = acct.create_folder("alice", "deep", &dst.id).await.unwrap();
        let moving = acct.create_folder("alice", "moving", &src.id).await.unwrap();
        let inner = acct.create_folder("alice", "inner", &moving.id).await.unwrap();
        insert_content(&db, "fp1", "alice", "bin", 25).await;
        insert_content(&db, "fp2", "alice", "bin", 15).await;
        insert_file(&db, "alice", &moving.id, "fp1", "bin", 25).await;
        insert_file(&db, "alice", &inner.id, "fp2", "bin", 15).await;
        assert_eq!(folder_size(&db, &src.id).await, 40);

        let moved = acct
            .move_folder("alice", &moving.id, Some(&deep.id), Some("renamed"))
            .await
            .unwrap();
        assert_eq!(moved.parent_id, deep.id);
        assert_eq!(moved.name, "renamed");
        assert_eq!(moved.size, 40);

        assert_eq!(folder_size(&db, &src.id).await, 0);
        assert_eq!(folder_size(&db, &deep.id).await, 40);
        assert_eq!(folder_size(&db, &dst.id).await, 40);
        assert_eq!(folder_size(&db, &root.id).await, 40);
        assert_eq!(folder_size(&db, &inner.id).await, 15);
        assert_eq!(used(&db, "alice").await, 40);
    }

    #[tokio::test]
    async fn move_folder_rename_in_place_keeps_sizes() {
        let (acct, db, _) = accountant(1000).await;
        let (_, root) = acct.provision("alice", None).await.unwrap();
        let a = acct.create_folder("alice", "a", &root.id).await.unwrap();
        insert_content(&db, "fp1", "alice", "bin", 10).await;
        insert_file(&db, "alice", &a.id, "fp1", "bin", 10).await;

        let renamed = acct.move_folder("alice", &a.id, None, Some("b")).await.unwrap();
        assert_eq!(renamed.name, "b");
        assert_eq!(renamed.parent_id, root.id);
        assert_eq!(folder_size(&db, &a.id).await, 10);
        assert_eq!(folder_size(&db, &root.id).await, 10);
    }

    #[tokio::test]
    async fn move_folder_rejects_self_descendant_and_root() {
        let (acct, db, _) = accountant(1000).await;
        let (_, root) = acct.provision("alice", None).await.unwrap();
        let a = acct.create_folder("alice", "a", &root.id).await.unwrap();
        let b = acct.create_folder("alice", "b", &a.id).await.unwrap();
        let c = acct.create_folder("alice", "c", &b.id).await.unwrap();

        for target in [&a.id, &b.id, &c.id] {
            assert!(matches!(
                acct.move_folder("alice", &a.id, Some(target), None).await,
                Err(ServiceError::InvalidInput(_))
            ));
        }
        assert!(matches!(
            acct.move_folder("alice", &root.id, Some(&a.id), None).await,
            Err(ServiceError::InvalidInput(_))
        ));
        assert!(matches!(
            acct.move_folder("alice", &a.id, None, Some("x/y")).await,
            Err(ServiceError::InvalidInput(_))
        ));
        assert!(matches!(
            acct.move_folder("bob", &a.id, Some(&root.id), None).await,
            Err(ServiceError::Forbidden)
        ));

        let mut conn = db.acquire().await.unwrap();
        let a_now = fetch_folder(&mut conn, &a.id).await.unwrap().unwrap();
        assert_eq!(a_now.parent_id, root.id);
        assert_eq!(a_now.name, "a");
    }

    #[tokio::test]
    async fn delete_folder_removes_subtree_and_reclaims() {
        let (acct, db, blobs) = accountant(1000).await;
        let (_, root) = acct.provision("alice", None).await.unwrap();
        let a = acct.create_folder("alice", "a", &root.id).await.unwrap();
        let b = acct.create_folder("alice", "b", &a.id).await.unwrap();
        let keep = acct.create_folder("alice", "keep", &root.id).await.unwrap();

        insert_content(&db, "only", "alice", "bin", 10).await;
        insert_content(&db, "shared", "alice", "bin", 20).await;
        insert_file(&db, "alice", &b.id, "only", "bin", 10).await;
        insert_file(&db, "alice", &a.id, "shared", "bin", 20).await;
        insert_file(&db, "alice", &keep.id, "shared", "bin", 20).await;
        blobs
            .objects
            .lock()
            .unwrap()
            .insert("alice/only.bin".into(), b"x".to_vec());

        let report = acct.delete_folder("alice", &a.id).await.unwrap();
        assert_eq!(report.folders_removed, 2);
        assert_eq!(report.files_removed, 2);
        assert_eq!(report.bytes_freed, 30);
        assert_eq!(report.blobs_reclaimed, 1);

        assert_eq!(folder_size(&db, &root.id).await, 20);
        assert_eq!(used(&db, "alice").await, 20);
        assert!(blobs.get("alice/only.bin").is_none());
        let shared: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM stored_contents WHERE fingerprint = 'shared'")
                .fetch_one(&*db)
                .await
                .unwrap();
        assert_eq!(shared, 1);
    }

    #[tokio::test]
    async fn root_folder_cannot_be_deleted() {
        let (acct, db, _) = accountant(1000).await;
        let (_, root) = acct.provision("alice", None).await.unwrap();
        assert!(matches!(
            acct.delete_folder("alice", &root.id).await,
            Err(ServiceError::InvalidInput(_))
        ));
        assert!(fetch_folder(&mut db.acquire().await.unwrap(), &root.id)
            .await
            .unwrap()
            .is_some());
        assert!(matches!(
            acct.delete_folder("bob", &root.id).await,
            Err(ServiceError::Forbidden)
        ));
    }
}
