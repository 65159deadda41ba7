//! Content-addressed blob storage.
//!
//! `BlobStore` is the seam to the object store that holds deduplicated
//! payloads. `LocalBlobStore` keeps objects on local disk sharded beneath
//! `base_path/{shard}/{shard}/{key}`, where the shards come from MD5(key).

use async_trait::async_trait;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MAX_BLOB_KEY_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("invalid blob key `{0}`")]
    InvalidKey(String),
    #[error("blob backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Object store keyed by `{namespace}/{fingerprint}[.{ext}]`.
///
/// Puts are atomic per key: readers see either no object or the whole one.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Copy the file at `source` into the store under `key`. Returns bytes written.
    async fn put(&self, key: &str, source: &Path) -> BlobResult<u64>;

    async fn exists(&self, key: &str) -> BlobResult<bool>;

    /// Remove `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> BlobResult<()>;
}

/// Disk-backed blob store.
#[derive(Clone, Debug)]
pub struct LocalBlobStore {
    base_path: PathBuf,
}

impl LocalBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Rejects keys that could escape `base_path`.
    fn ensure_key_safe(key: &str) -> BlobResult<()> {
        let bad = key.is_empty()
            || key.len() > MAX_BLOB_KEY_LEN
            || key.starts_with('/')
            || key.contains("..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if bad {
            return Err(BlobError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    /// First two bytes of MD5(key) as lowercase hex; keeps directories small.
    fn shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Remove empty directories from `start` upward, stopping at the store root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, key: &str, source: &Path) -> BlobResult<u64> {
        Self::ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| BlobError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let result = async {
            let mut src = File::open(source).await?;
            let mut dst = File::create(&tmp_path).await?;
            let written = tokio::io::copy(&mut src, &mut dst).await?;
            dst.flush().await?;
            dst.sync_all().await?;
            Ok::<u64, io::Error>(written)
        }
        .await;

        let written = match result {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(BlobError::Io(err));
            }
        };

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(BlobError::Io(err));
            }
        }

        debug!(key, bytes = written, "stored blob {}", file_path.display());
        Ok(written)
    }

    async fn exists(&self, key: &str) -> BlobResult<bool> {
        Self::ensure_key_safe(key)?;
        Ok(fs::try_exists(self.object_path(key)).await?)
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        Self::ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed blob {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("blob {} already missing", file_path.display());
            }
            Err(err) => return Err(BlobError::Io(err)),
        }
        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Blob store doubles for service tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory blob store that can be told to fail its next puts.
    #[derive(Default)]
    pub struct FakeBlobStore {
        pub objects: Mutex<HashMap<String, Vec<u8>>>,
        pub put_calls: AtomicUsize,
        pub failures_left: AtomicUsize,
    }

    impl FakeBlobStore {
        pub fn failing(times: usize) -> Self {
            let store = Self::default();
            store.failures_left.store(times, Ordering::SeqCst);
            store
        }

        pub fn object_count(&self) -> usize {
            self.objects.lock().unwrap().len()
        }

        pub fn get(&self, key: &str) -> Option<Vec<u8>> {
            self.objects.lock().unwrap().get(key).cloned()
        }
    }

    #[async_trait]
    impl BlobStore for FakeBlobStore {
        async fn put(&self, key: &str, source: &Path) -> BlobResult<u64> {
            self.put_calls.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(BlobError::Backend("injected failure".into()));
            }
            let bytes = fs::read(source).await?;
            let len = bytes.len() as u64;
            self.objects.lock().unwrap().insert(key.to_string(), bytes);
            Ok(len)
        }

        async fn exists(&self, key: &str) -> BlobResult<bool> {
            Ok(self.objects.lock().unwrap().contains_key(key))
        }

        async fn delete(&self, key: &str) -> BlobResult<()> {
            self.objects.lock().unwrap().remove(key);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn put_exists_delete() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path().join("blobs"));
        let source = dir.path().join("payload");
        fs::write(&source, b"hello blob").await.unwrap();

        let written = store.put("alice/abc.txt", &source).await.unwrap();
        assert_eq!(written, 10);
        assert!(store.exists("alice/abc.txt").await.unwrap());
        assert_eq!(
            fs::read(store.object_path("alice/abc.txt")).await.unwrap(),
            b"hello blob"
        );

        store.delete("alice/abc.txt").await.unwrap();
        assert!(!store.exists("alice/abc.txt").await.unwrap());
        // second delete is a no-op
        store.delete("alice/abc.txt").await.unwrap();
    }

    #[tokio::test]
    async fn rejects_traversal_keys() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path());
        for key in ["", "/etc/passwd", "../up", "a\\b"] {
            assert!(matches!(
                store.exists(key).await,
                Err(BlobError::InvalidKey(_))
            ));
        }
    }
}
