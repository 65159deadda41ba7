//! Periodic housekeeping.

use chrono::Utc;
use serde::Serialize;
use std::time::Duration;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{
    chunk_staging::ChunkStaging,
    offload::OffloadQueue,
    recycle_bin::{EvictionReport, RecycleBinService},
    upload_service::UploadService,
};

#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub expired: EvictionReport,
    pub over_capacity: EvictionReport,
    pub requeued: usize,
    pub swept: usize,
    pub parked_swept: usize,
    pub completions_pruned: u64,
}

#[derive(Clone)]
pub struct Maintenance {
    recycle: RecycleBinService,
    offload: OffloadQueue,
    uploads: UploadService,
    staging: ChunkStaging,
    /// Staged entries older than this belong to no live session.
    orphan_age: Duration,
}

impl Maintenance {
    pub fn new(
        recycle: RecycleBinService,
        offload: OffloadQueue,
        uploads: UploadService,
        staging: ChunkStaging,
        orphan_age: Duration,
    ) -> Self {
        Self {
            recycle,
            offload,
            uploads,
            staging,
            orphan_age,
        }
    }

    /// One pass of every task. A failing task is logged and the rest still run.
    pub async fn run_once(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        match self.recycle.evict_expired(Utc::now()).await {
            Ok(evicted) => report.expired = evicted,
            Err(err) => warn!(error = %err, "age-based eviction failed"),
        }
        match self.recycle.evict_by_capacity().await {
            Ok(evicted) => report.over_capacity = evicted,
            Err(err) => warn!(error = %err, "capacity-based eviction failed"),
        }
        // Before the requeue, so a retry that finishes quickly is not
        // counted here as well.
        match self.offload.sweep_parked().await {
            Ok(swept) => report.parked_swept = swept,
            Err(err) => warn!(error = %err, "dead-letter sweep failed"),
        }
        match self.offload.requeue_dead_letters().await {
            Ok(requeued) => report.requeued = requeued,
            Err(err) => warn!(error = %err, "dead-letter requeue failed"),
        }
        match self.staging.sweep_orphans(self.orphan_age).await {
            Ok(swept) => report.swept = swept,
            Err(err) => warn!(error = %err, "staging sweep failed"),
        }

        let horizon = chrono::Duration::from_std(self.orphan_age).unwrap_or(chrono::Duration::MAX);
        let before = Utc::now()
            .checked_sub_signed(horizon)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        match self.uploads.prune_completions(before).await {
            Ok(pruned) => report.completions_pruned = pruned,
            Err(err) => warn!(error = %err, "completion marker pruning failed"),
        }

        debug!(?report, "maintenance pass finished");
        report
    }

    pub fn spawn(self, every: Duration) -> JoinHandle<()> {
        info!(interval_secs = every.as_secs(), "starting maintenance loop");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::offload::OffloadOutcome;
    use crate::test_support::{TestEnv, insert_content, insert_file};

    #[tokio::test]
    async fn pass_evicts_requeues_and_sweeps() {
        let env = TestEnv::new().await;
        let root = env.user("alice").await;
        insert_content(&env.db, "old", "alice", "bin", 10).await;
        let file = insert_file(&env.db, "alice", &root, "old", "bin", 10).await;
        let entry = env.recycle.logical_delete("alice", &file.id).await.unwrap();
        sqlx::query("UPDATE recycle_bin SET expire_at = ? WHERE id = ?")
            .bind(Utc::now() - chrono::Duration::minutes(1))
            .bind(&entry.id)
            .execute(&*env.db)
            .await
            .unwrap();

        insert_content(&env.db, "parked", "alice", "bin", 3).await;
        sqlx::query("UPDATE stored_contents SET state = 'dead_letter' WHERE fingerprint = 'parked'")
            .execute(&*env.db)
            .await
            .unwrap();
        tokio::fs::write(env.staging.dead_letter_path("parked"), b"abc")
            .await
            .unwrap();
        tokio::fs::create_dir_all(env.staging.root().join("chunks").join("abandoned"))
            .await
            .unwrap();

        tokio::fs::write(env.staging.dead_letter_path("forgotten"), b"zz")
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO upload_completions (upload_id, user_id, file_id, completed_at)
             VALUES ('u-old', 'alice', 'f', ?)",
        )
        .bind(Utc::now() - chrono::Duration::minutes(1))
        .execute(&*env.db)
        .await
        .unwrap();

        let mut outcomes = env.offload.subscribe();
        let maintenance = Maintenance::new(
            env.recycle.clone(),
            env.offload.clone(),
            env.uploads.clone(),
            env.staging.clone(),
            Duration::ZERO,
        );
        let report = maintenance.run_once().await;

        assert_eq!(report.expired.entries, 1);
        assert_eq!(report.over_capacity.entries, 0);
        assert_eq!(report.parked_swept, 1);
        assert_eq!(report.requeued, 1);
        assert_eq!(report.swept, 1);
        assert_eq!(report.completions_pruned, 1);
        assert!(!env.staging.dead_letter_path("forgotten").exists());
        assert!(matches!(
            outcomes.recv().await.unwrap(),
            OffloadOutcome::Stored { .. }
        ));
        assert_eq!(env.blobs.get("alice/parked.bin").unwrap(), b"abc");
    }
}
