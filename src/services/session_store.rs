//! TTL-bound storage for upload sessions.
//!
//! Expiry is owned by the store: a session past its TTL is simply absent,
//! and recording chunks never extends the deadline.

use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use super::error::ServiceResult;
use crate::models::session::UploadSession;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a new session with every field written at once and the TTL set.
    async fn create(&self, session: &UploadSession) -> ServiceResult<()>;

    /// Fetch a live session, `None` if missing or expired.
    async fn get(&self, upload_id: &str) -> ServiceResult<Option<UploadSession>>;

    /// Add `index` to the received set.
    ///
    /// Idempotent and safe under concurrent callers for the same session.
    /// Returns the size of the received set after the write, or `None` if
    /// the session no longer exists.
    async fn record_chunk(&self, upload_id: &str, index: u32) -> ServiceResult<Option<u32>>;

    async fn delete(&self, upload_id: &str) -> ServiceResult<()>;

    /// Connectivity check used by readiness.
    async fn ping(&self) -> ServiceResult<()>;

    /// How long a session lives after creation.
    fn ttl(&self) -> Duration;
}

struct Slot {
    session: UploadSession,
    deadline: Instant,
}

/// Process-local session store for single-node deployments and tests.
pub struct MemorySessionStore {
    ttl: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn with_slots<T>(&self, f: impl FnOnce(&mut HashMap<String, Slot>) -> T) -> T {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        slots.retain(|_, slot| slot.deadline > now);
        f(&mut slots)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: &UploadSession) -> ServiceResult<()> {
        let deadline = Instant::now() + self.ttl;
        self.with_slots(|slots| {
            slots.insert(
                session.upload_id.clone(),
                Slot {
                    session: session.clone(),
                    deadline,
                },
            );
        });
        Ok(())
    }

    async fn get(&self, upload_id: &str) -> ServiceResult<Option<UploadSession>> {
        Ok(self.with_slots(|slots| slots.get(upload_id).map(|slot| slot.session.clone())))
    }

    async fn record_chunk(&self, upload_id: &str, index: u32) -> ServiceResult<Option<u32>> {
        Ok(self.with_slots(|slots| {
            slots.get_mut(upload_id).map(|slot| {
                slot.session.received.insert(index);
                slot.session.uploaded_count()
            })
        }))
    }

    async fn delete(&self, upload_id: &str) -> ServiceResult<()> {
        self.with_slots(|slots| slots.remove(upload_id));
        Ok(())
    }

    async fn ping(&self) -> ServiceResult<()> {
        Ok(())
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn session(id: &str) -> UploadSession {
        UploadSession::new(id, "alice", "a.bin", 15, 5, "folder")
    }

    #[tokio::test]
    async fn record_chunk_is_idempotent() {
        let store = MemorySessionStore::new(Duration::from_secs(60));
        store.create(&session("s1")).await.unwrap();

        assert_eq!(store.record_chunk("s1", 1).await.unwrap(), Some(1));
        assert_eq!(store.record_chunk("s1", 1).await.unwrap(), Some(1));
        assert_eq!(store.record_chunk("s1", 0).await.unwrap(), Some(2));
        let got = store.get("s1").await.unwrap().unwrap();
        assert_eq!(got.uploaded_count(), 2);
    }

    #[tokio::test]
    async fn unknown_session_is_not_recorded() {
        let store = MemorySessionStore::new(Duration::from_secs(60));
        assert_eq!(store.record_chunk("nope", 0).await.unwrap(), None);
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn chunk_writes_do_not_extend_ttl() {
        let store = MemorySessionStore::new(Duration::from_millis(80));
        store.create(&session("s1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.record_chunk("s1", 0).await.unwrap(), Some(1));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(store.get("s1").await.unwrap().is_none());
        assert_eq!(store.record_chunk("s1", 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_records_are_not_lost() {
        let store = Arc::new(MemorySessionStore::new(Duration::from_secs(60)));
        let mut big = session("s1");
        big.file_size = 100;
        big.total_chunks = 20;
        store.create(&big).await.unwrap();

        let handles: Vec<_> = (0..20u32)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.record_chunk("s1", i).await.unwrap() })
            })
            .collect();
        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.unwrap().unwrap());
        }
        counts.sort();
        assert_eq!(counts, (1..=20).collect::<Vec<u32>>());

        let got = store.get("s1").await.unwrap().unwrap();
        assert!(got.is_complete());
    }

    #[tokio::test]
    async fn delete_removes_session() {
        let store = MemorySessionStore::new(Duration::from_secs(60));
        store.create(&session("s1")).await.unwrap();
        store.delete("s1").await.unwrap();
        assert!(store.get("s1").await.unwrap().is_none());
    }
}
