//! Stalled-job and orphaned-page recovery.
//!
//! Two failure shapes leave the pipeline stuck without this service. A
//! worker that dies mid-job leaves the row claimed forever, and a timed-out
//! job stays claimed on purpose; both surface as processing jobs older than
//! the stalled cutoff. Separately, a page can sit waiting on a stage job
//! that was never enqueued or has vanished. Recovery releases the former
//! and requeues the latter.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use super::job::Job;
use super::queue::JobQueue;
use crate::domains::sources::jobs::{stage_job_spec, JobOrigin};
use crate::domains::sources::models::Page;

/// Processing jobs older than this are considered stalled.
pub const STALLED_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Pages waiting on a missing stage job for longer than this are orphaned.
pub const ORPHANED_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Reason recorded on every job released by stalled recovery.
pub const STALLED_RECOVERY_REASON: &str = "Auto-recovered from stalled state";

/// Orphaned pages requeued per stage per pass.
const ORPHAN_SCAN_LIMIT: i64 = 100;

/// What one recovery pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Stalled jobs observed this pass.
    pub stalled_jobs: usize,
    /// Jobs released back to pending.
    pub recovered_jobs: usize,
    /// Jobs created for orphaned pages.
    pub orphaned_jobs: usize,
    pub total_processing_time_ms: u64,
}

/// Background repair service for stuck jobs and pages.
pub struct JobRecoveryService {
    pool: PgPool,
    queue: Arc<dyn JobQueue>,
    last_run: RwLock<Option<DateTime<Utc>>>,
}

impl JobRecoveryService {
    pub fn new(pool: PgPool, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            pool,
            queue,
            last_run: RwLock::new(None),
        }
    }

    /// Release every job stuck in processing past the stalled cutoff.
    /// Attempts are untouched: a stall is not the handler's failure.
    pub async fn recover_stalled_jobs(&self) -> Result<Vec<Job>> {
        let cutoff = Utc::now() - chrono::Duration::seconds(STALLED_TIMEOUT.as_secs() as i64);
        let released = self
            .queue
            .release_stalled(cutoff, STALLED_RECOVERY_REASON)
            .await?;

        if !released.is_empty() {
            warn!(count = released.len(), "released stalled jobs");
        }
        Ok(released)
    }

    /// Requeue the stage job for every page orphaned past the orphan
    /// cutoff. A duplicate key here means a concurrent enqueue won the
    /// race, which is exactly the outcome we wanted anyway.
    pub async fn recover_orphaned_pages(&self) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::seconds(ORPHANED_TIMEOUT.as_secs() as i64);

        let waiting_crawl =
            Page::find_orphaned_for_crawl(cutoff, ORPHAN_SCAN_LIMIT, &self.pool).await?;
        let waiting_train =
            Page::find_orphaned_for_train(cutoff, ORPHAN_SCAN_LIMIT, &self.pool).await?;

        let mut created = 0;
        for page in waiting_crawl.iter().chain(waiting_train.iter()) {
            let Some(spec) = stage_job_spec(page, JobOrigin::Recovery)? else {
                continue;
            };
            if self.queue.enqueue(spec).await?.is_created() {
                created += 1;
            }
        }

        if created > 0 {
            info!(created, "requeued jobs for orphaned pages");
        }
        Ok(created)
    }

    /// One full recovery pass: stalled jobs first, then orphaned pages.
    pub async fn run_recovery(&self) -> Result<RecoveryReport> {
        let started = std::time::Instant::now();

        let released = self.recover_stalled_jobs().await?;
        let orphaned = self.recover_orphaned_pages().await?;

        *self
            .last_run
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());

        let report = RecoveryReport {
            stalled_jobs: released.len(),
            recovered_jobs: released.len(),
            orphaned_jobs: orphaned,
            total_processing_time_ms: started.elapsed().as_millis() as u64,
        };
        debug!(
            recovered = report.recovered_jobs,
            orphaned = report.orphaned_jobs,
            elapsed_ms = report.total_processing_time_ms,
            "recovery pass finished"
        );
        Ok(report)
    }

    /// When the last full pass finished, for health reporting.
    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        *self.last_run.read().unwrap_or_else(|e| e.into_inner())
    }
}
