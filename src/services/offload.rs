//! Background transfer of assembled payloads to the blob store.
//!
//! Completion commits metadata first and hands the payload here. Each job
//! is retried with exponential backoff; a job that exhausts its attempts is
//! parked under `dead_letter/` and its content row marked `dead_letter` so
//! the maintenance loop (or the next uploader of the same bytes) can retry.

use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use super::{
    blob_store::BlobResult,
    chunk_staging::ChunkStaging,
    content_registry::{self, ContentReaper},
    error::{ServiceError, ServiceResult},
};
use crate::models::content::ContentState;

const OUTCOME_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct OffloadJob {
    pub fingerprint: String,
    pub blob_key: String,
    pub payload: PathBuf,
    /// Retry of a dead-lettered payload. Only these may find their blob
    /// already written by an earlier attempt.
    pub resumed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OffloadOutcome {
    Stored { fingerprint: String, attempts: u32 },
    /// The content was reclaimed while the upload ran; the blob was removed.
    Discarded { fingerprint: String },
    DeadLettered {
        fingerprint: String,
        attempts: u32,
        error: String,
    },
}

impl OffloadOutcome {
    pub fn fingerprint(&self) -> &str {
        match self {
            OffloadOutcome::Stored { fingerprint, .. }
            | OffloadOutcome::Discarded { fingerprint }
            | OffloadOutcome::DeadLettered { fingerprint, .. } => fingerprint,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OffloadPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for OffloadPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
        }
    }
}

/// Handle for submitting offload jobs.
#[derive(Clone)]
pub struct OffloadQueue {
    tx: mpsc::UnboundedSender<OffloadJob>,
    outcomes: broadcast::Sender<OffloadOutcome>,
    db: Arc<SqlitePool>,
    staging: ChunkStaging,
}

struct OffloadWorker {
    db: Arc<SqlitePool>,
    reaper: ContentReaper,
    staging: ChunkStaging,
    policy: OffloadPolicy,
    outcomes: broadcast::Sender<OffloadOutcome>,
}

impl OffloadQueue {
    /// Start the dispatcher. It runs until every queue handle is dropped.
    pub fn spawn(
        db: Arc<SqlitePool>,
        reaper: ContentReaper,
        staging: ChunkStaging,
        policy: OffloadPolicy,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<OffloadJob>();
        let (outcomes, _) = broadcast::channel(OUTCOME_CAPACITY);
        let worker = Arc::new(OffloadWorker {
            db: db.clone(),
            reaper,
            staging: staging.clone(),
            policy,
            outcomes: outcomes.clone(),
        });

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let worker = worker.clone();
                tokio::spawn(async move {
                    let outcome = worker.process(job).await;
                    // No subscribers is fine.
                    let _ = worker.outcomes.send(outcome);
                });
            }
        });

        (
            Self {
                tx,
                outcomes,
                db,
                staging,
            },
            handle,
        )
    }

    pub fn enqueue(&self, job: OffloadJob) -> ServiceResult<()> {
        self.tx
            .send(job)
            .map_err(|_| ServiceError::Internal("offload queue is shut down".into()))
    }

    /// Receive the outcome of every job processed after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<OffloadOutcome> {
        self.outcomes.subscribe()
    }

    /// Retry every dead-lettered content whose parked payload is still on disk.
    pub async fn requeue_dead_letters(&self) -> ServiceResult<usize> {
        let parked = content_registry::list_by_state(&self.db, ContentState::DeadLetter).await?;
        let mut requeued = 0;
        for content in parked {
            let payload = self.staging.dead_letter_path(&content.fingerprint);
            if !tokio::fs::try_exists(&payload).await.unwrap_or(false) {
                warn!(fingerprint = %content.fingerprint, "dead-lettered payload missing, cannot retry");
                continue;
            }
            let Some(content) =
                content_registry::revive_dead_letter(&self.db, &content.fingerprint).await?
            else {
                continue;
            };
            self.enqueue(OffloadJob {
                blob_key: content.blob_key(),
                fingerprint: content.fingerprint,
                payload,
                resumed: true,
            })?;
            requeued += 1;
        }
        if requeued > 0 {
            info!(requeued, "requeued dead-lettered offloads");
        }
        Ok(requeued)
    }

    /// Remove parked payloads nothing will retry: the content was reclaimed,
    /// or a later upload of the same bytes already stored it.
    pub async fn sweep_parked(&self) -> ServiceResult<usize> {
        let mut removed = 0;
        for fingerprint in self.staging.parked_fingerprints().await? {
            let obsolete = match content_registry::fetch(&self.db, &fingerprint).await? {
                None => true,
                Some(content) => content.state == ContentState::Stored,
            };
            if obsolete {
                self.staging
                    .discard(&self.staging.dead_letter_path(&fingerprint))
                    .await;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "swept obsolete dead-lettered payloads");
        }
        Ok(removed)
    }
}

impl OffloadWorker {
    async fn process(&self, job: OffloadJob) -> OffloadOutcome {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            {
                // Held through `finish` so a purge of this key waits for the
                // registry to say whether the blob is wanted.
                let _guard = self.reaper.lock_key(&job.blob_key).await;
                match self.upload(&job).await {
                    Ok(bytes) => return self.finish(&job, attempt, bytes).await,
                    Err(err) => {
                        warn!(
                            fingerprint = %job.fingerprint,
                            key = %job.blob_key,
                            attempt,
                            error = %err,
                            "offload attempt failed"
                        );
                        last_error = err.to_string();
                    }
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }
        self.dead_letter(&job, last_error).await
    }

    async fn upload(&self, job: &OffloadJob) -> BlobResult<u64> {
        if job.resumed && self.reaper.blobs().exists(&job.blob_key).await? {
            debug!(key = %job.blob_key, "blob landed on an earlier attempt");
            return Ok(0);
        }
        self.reaper.blobs().put(&job.blob_key, &job.payload).await
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.policy
            .base_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    async fn finish(&self, job: &OffloadJob, attempts: u32, bytes: u64) -> OffloadOutcome {
        let parked = self.staging.dead_letter_path(&job.fingerprint);
        match content_registry::mark_stored(&self.db, &job.fingerprint, attempts).await {
            Ok(true) => {
                info!(fingerprint = %job.fingerprint, key = %job.blob_key, bytes, attempts, "offloaded content");
                self.staging.discard(&job.payload).await;
                self.staging.discard(&parked).await;
                OffloadOutcome::Stored {
                    fingerprint: job.fingerprint.clone(),
                    attempts,
                }
            }
            Ok(false) => {
                info!(fingerprint = %job.fingerprint, "content reclaimed during offload, dropping blob");
                if let Err(err) = self.reaper.blobs().delete(&job.blob_key).await {
                    warn!(key = %job.blob_key, error = %err, "failed to delete unreferenced blob");
                }
                self.staging.discard(&job.payload).await;
                self.staging.discard(&parked).await;
                OffloadOutcome::Discarded {
                    fingerprint: job.fingerprint.clone(),
                }
            }
            Err(err) => {
                // Blob is in place; only the state column is stale.
                error!(fingerprint = %job.fingerprint, error = %err, "failed to record offload");
                self.staging.discard(&job.payload).await;
                OffloadOutcome::Stored {
                    fingerprint: job.fingerprint.clone(),
                    attempts,
                }
            }
        }
    }

    async fn dead_letter(&self, job: &OffloadJob, last_error: String) -> OffloadOutcome {
        let attempts = self.policy.max_attempts.max(1);
        if let Err(err) = self.staging.park_dead_letter(&job.payload, &job.fingerprint).await {
            error!(fingerprint = %job.fingerprint, error = %err, "failed to park dead-lettered payload");
        }
        if let Err(err) =
            content_registry::mark_dead_letter(&self.db, &job.fingerprint, attempts, &last_error).await
        {
            error!(fingerprint = %job.fingerprint, error = %err, "failed to record dead letter");
        }
        error!(fingerprint = %job.fingerprint, attempts, error = %last_error, "offload dead-lettered");
        OffloadOutcome::DeadLettered {
            fingerprint: job.fingerprint.clone(),
            attempts,
            error: last_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::blob_store::testing::FakeBlobStore;
    use crate::test_support::TestEnv;
    use std::sync::atomic::Ordering;

    async fn pending_content(env: &TestEnv, fingerprint: &str, data: &[u8]) -> OffloadJob {
        let mut conn = env.db.acquire().await.unwrap();
        let claim = content_registry::claim(&mut conn, fingerprint, "alice", "txt", data.len() as i64)
            .await
            .unwrap();
        assert!(claim.need_upload);
        drop(conn);
        let payload = env.staging.root().join("merged").join(fingerprint);
        tokio::fs::write(&payload, data).await.unwrap();
        OffloadJob {
            fingerprint: fingerprint.into(),
            blob_key: claim.blob_key(fingerprint, "txt"),
            payload,
            resumed: false,
        }
    }

    async fn state_of(env: &TestEnv, fingerprint: &str) -> Option<ContentState> {
        content_registry::fetch(&env.db, fingerprint)
            .await
            .unwrap()
            .map(|c| c.state)
    }

    #[tokio::test]
    async fn stores_and_removes_payload() {
        let env = TestEnv::new().await;
        let mut outcomes = env.offload.subscribe();
        let job = pending_content(&env, "fp", b"hello").await;
        let payload = job.payload.clone();

        env.offload.enqueue(job).unwrap();
        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(
            outcome,
            OffloadOutcome::Stored {
                fingerprint: "fp".into(),
                attempts: 1
            }
        );
        assert_eq!(env.blobs.get("alice/fp.txt").unwrap(), b"hello");
        assert_eq!(state_of(&env, "fp").await, Some(ContentState::Stored));
        assert!(!payload.exists());
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let env = TestEnv::with_blobs(FakeBlobStore::failing(2), 3).await;
        let mut outcomes = env.offload.subscribe();
        env.offload
            .enqueue(pending_content(&env, "fp", b"data").await)
            .unwrap();

        assert_eq!(
            outcomes.recv().await.unwrap(),
            OffloadOutcome::Stored {
                fingerprint: "fp".into(),
                attempts: 3
            }
        );
        assert_eq!(env.blobs.put_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn dead_letters_then_requeues() {
        let env = TestEnv::with_blobs(FakeBlobStore::failing(2), 2).await;
        let mut outcomes = env.offload.subscribe();
        env.offload
            .enqueue(pending_content(&env, "fp", b"data").await)
            .unwrap();

        let outcome = outcomes.recv().await.unwrap();
        assert!(matches!(
            outcome,
            OffloadOutcome::DeadLettered { attempts: 2, .. }
        ));
        assert_eq!(state_of(&env, "fp").await, Some(ContentState::DeadLetter));
        let parked = env.staging.dead_letter_path("fp");
        assert!(parked.exists());
        assert_eq!(env.blobs.object_count(), 0);

        assert_eq!(env.offload.requeue_dead_letters().await.unwrap(), 1);
        assert!(matches!(
            outcomes.recv().await.unwrap(),
            OffloadOutcome::Stored { .. }
        ));
        assert_eq!(state_of(&env, "fp").await, Some(ContentState::Stored));
        assert!(!parked.exists());
        assert_eq!(env.blobs.get("alice/fp.txt").unwrap(), b"data");
    }

    #[tokio::test]
    async fn resumed_job_skips_blob_already_written() {
        let env = TestEnv::new().await;
        let mut outcomes = env.offload.subscribe();
        let mut job = pending_content(&env, "fp", b"data").await;
        job.resumed = true;
        env.blobs
            .objects
            .lock()
            .unwrap()
            .insert(job.blob_key.clone(), b"data".to_vec());

        env.offload.enqueue(job).unwrap();
        assert_eq!(
            outcomes.recv().await.unwrap(),
            OffloadOutcome::Stored {
                fingerprint: "fp".into(),
                attempts: 1
            }
        );
        assert_eq!(env.blobs.put_calls.load(Ordering::SeqCst), 0);
        assert_eq!(state_of(&env, "fp").await, Some(ContentState::Stored));
    }

    #[tokio::test]
    async fn fresh_job_uploads_even_if_stale_blob_exists() {
        let env = TestEnv::new().await;
        let mut outcomes = env.offload.subscribe();
        let job = pending_content(&env, "fp", b"data").await;
        env.blobs
            .objects
            .lock()
            .unwrap()
            .insert(job.blob_key.clone(), b"stale".to_vec());

        env.offload.enqueue(job).unwrap();
        assert!(matches!(
            outcomes.recv().await.unwrap(),
            OffloadOutcome::Stored { attempts: 1, .. }
        ));
        assert_eq!(env.blobs.put_calls.load(Ordering::SeqCst), 1);
        assert_eq!(env.blobs.get("alice/fp.txt").unwrap(), b"data");
    }

    #[tokio::test]
    async fn takeover_of_dead_letter_removes_parked_payload() {
        let env = TestEnv::with_blobs(FakeBlobStore::failing(1), 1).await;
        let mut outcomes = env.offload.subscribe();
        env.offload
            .enqueue(pending_content(&env, "fp", b"data").await)
            .unwrap();
        assert!(matches!(
            outcomes.recv().await.unwrap(),
            OffloadOutcome::DeadLettered { .. }
        ));
        let parked = env.staging.dead_letter_path("fp");
        assert!(parked.exists());

        // the same bytes are completed again and take the claim over
        let job = pending_content(&env, "fp", b"data").await;
        env.offload.enqueue(job).unwrap();
        assert!(matches!(
            outcomes.recv().await.unwrap(),
            OffloadOutcome::Stored { .. }
        ));
        assert_eq!(state_of(&env, "fp").await, Some(ContentState::Stored));
        assert!(!parked.exists());
    }

    #[tokio::test]
    async fn sweep_removes_only_obsolete_parked_payloads() {
        let env = TestEnv::new().await;
        for fingerprint in ["reclaimed", "stored", "waiting"] {
            tokio::fs::write(env.staging.dead_letter_path(fingerprint), b"x")
                .await
                .unwrap();
        }
        crate::test_support::insert_content(&env.db, "stored", "alice", "txt", 1).await;
        crate::test_support::insert_content(&env.db, "waiting", "alice", "txt", 1).await;
        content_registry::mark_dead_letter(&env.db, "waiting", 1, "boom")
            .await
            .unwrap();

        assert_eq!(env.offload.sweep_parked().await.unwrap(), 2);
        assert!(!env.staging.dead_letter_path("reclaimed").exists());
        assert!(!env.staging.dead_letter_path("stored").exists());
        assert!(env.staging.dead_letter_path("waiting").exists());
    }

    #[tokio::test]
    async fn backoff_saturates_for_large_attempt_counts() {
        let env = TestEnv::new().await;
        let worker = OffloadWorker {
            db: env.db.clone(),
            reaper: env.reaper.clone(),
            staging: env.staging.clone(),
            policy: OffloadPolicy {
                max_attempts: 100,
                base_backoff: Duration::from_millis(500),
            },
            outcomes: broadcast::channel(1).0,
        };
        assert_eq!(worker.backoff(1), Duration::from_millis(500));
        assert_eq!(worker.backoff(3), Duration::from_millis(2000));
        // 2^39 would overflow u32
        assert_eq!(worker.backoff(40), worker.backoff(u32::MAX));
        assert!(worker.backoff(40) >= worker.backoff(33));
    }

    #[tokio::test]
    async fn reclaimed_content_is_discarded() {
        let env = TestEnv::new().await;
        let mut outcomes = env.offload.subscribe();
        let job = pending_content(&env, "fp", b"gone").await;
        sqlx::query("DELETE FROM stored_contents WHERE fingerprint = 'fp'")
            .execute(&*env.db)
            .await
            .unwrap();

        env.offload.enqueue(job).unwrap();
        assert_eq!(
            outcomes.recv().await.unwrap(),
            OffloadOutcome::Discarded {
                fingerprint: "fp".into()
            }
        );
        assert_eq!(env.blobs.object_count(), 0);
    }
}
