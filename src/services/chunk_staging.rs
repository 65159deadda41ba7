//! On-disk staging area for chunk payloads and assembled files.
//!
//! Layout beneath the staging root:
//! - `chunks/{upload_id}/chunk_{index}` received chunk bytes
//! - `merged/{upload_id}-{nonce}` assembled payload waiting for offload
//! - `dead_letter/{fingerprint}` payloads whose offload gave up

use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::{ServiceError, ServiceResult};
use crate::models::session::UploadSession;

const COPY_BUF_LEN: usize = 64 * 1024;

/// Result of persisting one chunk.
#[derive(Debug, Clone)]
pub struct StagedChunk {
    pub size: i64,
    pub md5_hex: String,
}

/// An assembled payload and its fingerprint.
#[derive(Debug, Clone)]
pub struct MergedPayload {
    pub path: PathBuf,
    pub fingerprint: String,
    pub size: i64,
}

#[derive(Clone, Debug)]
pub struct ChunkStaging {
    root: PathBuf,
}

impl ChunkStaging {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_dirs(&self) -> io::Result<()> {
        for dir in ["chunks", "merged", "dead_letter"] {
            fs::create_dir_all(self.root.join(dir)).await?;
        }
        Ok(())
    }

    fn session_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join("chunks").join(upload_id)
    }

    fn chunk_path(&self, upload_id: &str, index: u32) -> PathBuf {
        self.session_dir(upload_id).join(format!("chunk_{}", index))
    }

    pub fn dead_letter_path(&self, fingerprint: &str) -> PathBuf {
        self.root.join("dead_letter").join(fingerprint)
    }

    /// Stream one chunk to disk.
    ///
    /// Bytes go to a temp file first; the chunk only becomes visible under
    /// its final name once its length equals `expected_len` and, when given,
    /// its MD5 equals `expected_md5`. Re-writing an index replaces it.
    pub async fn write_chunk<S>(
        &self,
        upload_id: &str,
        index: u32,
        expected_len: i64,
        expected_md5: Option<[u8; 16]>,
        stream: S,
    ) -> ServiceResult<StagedChunk>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let dir = self.session_dir(upload_id);
        fs::create_dir_all(&dir).await?;
        let tmp_path = dir.join(format!(".tmp-{}-{}", index, Uuid::new_v4()));
        let final_path = self.chunk_path(upload_id, index);

        let written = Self::drain_into(&tmp_path, expected_len, index, stream).await;
        let (size, digest) = match written {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };

        if size != expected_len {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ServiceError::InvalidChunkSize {
                index,
                expected: expected_len,
                actual: size,
            });
        }
        if let Some(expected) = expected_md5 {
            if expected != digest {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(ServiceError::ChunkDigestMismatch { index });
            }
        }

        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ServiceError::Io(err));
        }

        Ok(StagedChunk {
            size,
            md5_hex: hex(&digest),
        })
    }

    async fn drain_into<S>(
        path: &Path,
        expected_len: i64,
        index: u32,
        stream: S,
    ) -> ServiceResult<(i64, [u8; 16])>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let mut file = File::create(path).await?;
        let mut size: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            size += chunk.len() as i64;
            if size > expected_len {
                return Err(ServiceError::InvalidChunkSize {
                    index,
                    expected: expected_len,
                    actual: size,
                });
            }
            digest.consume(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok((size, digest.compute().0))
    }

    /// Concatenate every chunk in index order into one file and fingerprint it.
    ///
    /// The fingerprint is MD5 over `"." + extension` (skipped when the
    /// extension is empty) followed by the content, so identical bytes under
    /// different extensions never collide.
    pub async fn merge(
        &self,
        session: &UploadSession,
        extension: &str,
    ) -> ServiceResult<MergedPayload> {
        let merged_dir = self.root.join("merged");
        fs::create_dir_all(&merged_dir).await?;
        let path = merged_dir.join(format!("{}-{}", session.upload_id, Uuid::new_v4()));

        match self.merge_into(&path, session, extension).await {
            Ok((fingerprint, size)) => Ok(MergedPayload {
                path,
                fingerprint,
                size,
            }),
            Err(err) => {
                let _ = fs::remove_file(&path).await;
                Err(err)
            }
        }
    }

    async fn merge_into(
        &self,
        path: &Path,
        session: &UploadSession,
        extension: &str,
    ) -> ServiceResult<(String, i64)> {
        let mut merged = File::create(path).await?;
        let mut digest = Context::new();
        if !extension.is_empty() {
            digest.consume(format!(".{}", extension).as_bytes());
        }

        let mut size: i64 = 0;
        let mut buf = vec![0u8; COPY_BUF_LEN];
        for index in 0..session.total_chunks {
            let chunk_path = self.chunk_path(&session.upload_id, index);
            let mut chunk = File::open(&chunk_path).await.map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    ServiceError::Internal(format!(
                        "chunk {} of upload {} is recorded but missing on disk",
                        index, session.upload_id
                    ))
                } else {
                    ServiceError::Io(err)
                }
            })?;
            loop {
                let n = chunk.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                digest.consume(&buf[..n]);
                merged.write_all(&buf[..n]).await?;
                size += n as i64;
            }
        }
        merged.flush().await?;
        merged.sync_all().await?;

        if size != session.file_size {
            return Err(ServiceError::Internal(format!(
                "assembled {} bytes for upload {}, declared {}",
                size, session.upload_id, session.file_size
            )));
        }
        Ok((hex(&digest.compute().0), size))
    }

    /// Drop every staged chunk of a session.
    pub async fn remove_session(&self, upload_id: &str) -> io::Result<()> {
        match fs::remove_dir_all(self.session_dir(upload_id)).await {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    /// Remove a staged file, ignoring one that is already gone.
    pub async fn discard(&self, path: &Path) {
        if let Err(err) = fs::remove_file(path).await {
            if err.kind() != ErrorKind::NotFound {
                warn!(path = %path.display(), error = %err, "failed to remove staged file");
            }
        }
    }

    /// Move a payload whose offload gave up into `dead_letter/`.
    pub async fn park_dead_letter(&self, path: &Path, fingerprint: &str) -> io::Result<PathBuf> {
        let target = self.dead_letter_path(fingerprint);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(path, &target).await?;
        Ok(target)
    }

    /// Fingerprints with a payload parked under `dead_letter/`.
    pub async fn parked_fingerprints(&self) -> io::Result<Vec<String>> {
        let mut entries = match fs::read_dir(self.root.join("dead_letter")).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut parked = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                parked.push(name.to_string());
            }
        }
        Ok(parked)
    }

    /// Delete chunk directories and merged files untouched for `max_age`.
    ///
    /// Sessions never outlive their TTL, so anything older than it is
    /// garbage left by an abandoned or crashed upload. Returns entries removed.
    pub async fn sweep_orphans(&self, max_age: Duration) -> io::Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;

        for sub in ["chunks", "merged"] {
            let dir = self.root.join(sub);
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                if modified > cutoff {
                    continue;
                }
                let path = entry.path();
                let result = if meta.is_dir() {
                    fs::remove_dir_all(&path).await
                } else {
                    fs::remove_file(&path).await
                };
                match result {
                    Ok(_) => {
                        debug!(path = %path.display(), "swept orphaned staging entry");
                        removed += 1;
                    }
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => warn!(path = %path.display(), error = %err, "sweep failed"),
                }
            }
        }
        Ok(removed)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
pub(crate) fn byte_stream(data: Vec<u8>) -> impl Stream<Item = io::Result<Bytes>> + Send {
    futures::stream::iter(
        data.chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect::<Vec<_>>(),
    )
}
