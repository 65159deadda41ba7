//! Fixtures shared by service and router tests.

use chrono::Utc;
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;
use uuid::Uuid;

use crate::{
    models::{
        content::blob_key,
        file::{FILE_COLUMNS, FileRecord},
    },
    services::{
        accountant::{self, Accountant},
        blob_store::testing::FakeBlobStore,
        chunk_staging::ChunkStaging,
        content_registry::ContentReaper,
        offload::{OffloadPolicy, OffloadQueue},
        recycle_bin::RecycleBinService,
        session_store::{MemorySessionStore, SessionStore},
        upload_service::UploadService,
    },
    state::AppState,
};

pub const TEST_CHUNK_SIZE: i64 = 8;

/// Register a content row as already offloaded.
pub async fn insert_content(db: &SqlitePool, fingerprint: &str, namespace: &str, ext: &str, size: i64) {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO stored_contents (fingerprint, storage_path, extension, size, state,
                                      attempts, last_error, created_at, updated_at)
         VALUES (?, ?, ?, ?, 'stored', 1, NULL, ?, ?)",
    )
    .bind(fingerprint)
    .bind(namespace)
    .bind(ext)
    .bind(size)
    .bind(now)
    .bind(now)
    .execute(db)
    .await
    .unwrap();
}

/// Insert a live file and account for it the way a completed upload would.
pub async fn insert_file(
    db: &SqlitePool,
    owner: &str,
    folder_id: &str,
    fingerprint: &str,
    ext: &str,
    size: i64,
) -> FileRecord {
    let mut tx = db.begin().await.unwrap();
    let file = sqlx::query_as::<_, FileRecord>(&format!(
        "INSERT INTO files (id, owner_id, file_name, extension, fingerprint, storage_path,
                            parent_folder_id, size, created_at, deleted_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL) RETURNING {}",
        FILE_COLUMNS
    ))
    .bind(Uuid::new_v4().to_string())
    .bind(owner)
    .bind(format!("file-{}", &fingerprint))
    .bind(ext)
    .bind(fingerprint)
    .bind(owner)
    .bind(folder_id)
    .bind(size)
    .bind(Utc::now())
    .fetch_one(&mut *tx)
    .await
    .unwrap();
    accountant::reserve(&mut tx, owner, size).await.unwrap();
    accountant::apply_delta(&mut tx, folder_id, size).await.unwrap();
    tx.commit().await.unwrap();
    file
}

pub fn file_blob_key(file: &FileRecord) -> String {
    blob_key(&file.storage_path, &file.fingerprint, &file.extension)
}

/// Every service wired over an in-memory database and a fake blob store.
pub struct TestEnv {
    pub dir: TempDir,
    pub db: Arc<SqlitePool>,
    pub blobs: Arc<FakeBlobStore>,
    pub sessions: Arc<MemorySessionStore>,
    pub staging: ChunkStaging,
    pub reaper: ContentReaper,
    pub offload: OffloadQueue,
    pub accountant: Accountant,
    pub uploads: UploadService,
    pub recycle: RecycleBinService,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_blobs(FakeBlobStore::default(), 3).await
    }

    pub async fn with_blobs(blobs: FakeBlobStore, max_attempts: u32) -> Self {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(crate::db::test_pool().await);
        let blobs = Arc::new(blobs);
        let sessions = Arc::new(MemorySessionStore::new(Duration::from_secs(3600)));
        let staging = ChunkStaging::new(dir.path().join("staging"));
        staging.ensure_dirs().await.unwrap();
        let reaper = ContentReaper::new(db.clone(), blobs.clone(), staging.clone());
        let (offload, _worker) = OffloadQueue::spawn(
            db.clone(),
            reaper.clone(),
            staging.clone(),
            OffloadPolicy {
                max_attempts,
                base_backoff: Duration::from_millis(1),
            },
        );
        let accountant = Accountant::new(db.clone(), reaper.clone(), 1024 * 1024);
        let uploads = UploadService::new(
            db.clone(),
            sessions.clone() as Arc<dyn SessionStore>,
            staging.clone(),
            offload.clone(),
            TEST_CHUNK_SIZE,
        );
        let recycle = RecycleBinService::new(db.clone(), reaper.clone());
        Self {
            dir,
            db,
            blobs,
            sessions,
            staging,
            reaper,
            offload,
            accountant,
            uploads,
            recycle,
        }
    }

    pub fn state(&self) -> AppState {
        AppState {
            db: self.db.clone(),
            sessions: self.sessions.clone(),
            staging: self.staging.clone(),
            accountant: self.accountant.clone(),
            uploads: self.uploads.clone(),
            recycle: self.recycle.clone(),
        }
    }

    /// Provision `user` and return their root folder id.
    pub async fn user(&self, user: &str) -> String {
        self.accountant.provision(user, None).await.unwrap().1.id
    }
}
