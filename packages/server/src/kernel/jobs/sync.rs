//! Periodic pipeline synchronization.
//!
//! The workflow enqueues jobs as transitions happen, and recovery releases
//! the stuck ones. Synchronization is the third safety net: it walks the
//! store for pages whose stage job is missing entirely (failed for good,
//! or lost before it was created) and requeues them. Sync jobs run at
//! medium priority and carry an origin marker so operators can tell them
//! apart in the queue.

use std::sync::{Arc, RwLock};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::{debug, info};

use super::queue::{JobQueue, PipelineCommand};
use crate::common::SourceId;
use crate::domains::sources::jobs::{stage_job_spec, CrawlSourceJob, JobOrigin};
use crate::domains::sources::models::{Page, Source};
use crate::domains::sources::status::WorkflowStatus;

/// Pages examined per synchronization pass.
pub const MAX_PAGES_PER_SYNC: i64 = 100;

/// What one synchronization pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Pages found waiting on a missing stage job.
    pub pages_examined: usize,
    /// Jobs actually created; duplicates held by active jobs are excluded.
    pub jobs_created: usize,
    pub total_processing_time_ms: u64,
}

/// Store-driven requeue service for pages the workflow lost track of.
pub struct SynchronizationService {
    pool: PgPool,
    queue: Arc<dyn JobQueue>,
    last_run: RwLock<Option<DateTime<Utc>>>,
}

impl SynchronizationService {
    pub fn new(pool: PgPool, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            pool,
            queue,
            last_run: RwLock::new(None),
        }
    }

    /// Scheduled synchronization pass, capped at [`MAX_PAGES_PER_SYNC`]
    /// pages. Running it twice in a row creates nothing the second time:
    /// every page queued by the first pass then holds an active job.
    pub async fn run_synchronization(&self) -> Result<SyncReport> {
        let report = self.sync_pass().await?;
        *self
            .last_run
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        Ok(report)
    }

    /// Operator-triggered pass, same semantics as the scheduled one.
    pub async fn force_synchronization(&self) -> Result<SyncReport> {
        info!("forced synchronization requested");
        self.run_synchronization().await
    }

    /// Targeted repair for one source: requeue stage jobs for its stranded
    /// pages, and restart discovery when the source is crawling but has no
    /// pages at all (the discovery job died before reporting any).
    pub async fn emergency_recovery(&self, source_id: SourceId) -> Result<SyncReport> {
        let started = std::time::Instant::now();
        info!(source_id = %source_id, "emergency recovery requested");

        let source = Source::find_by_id(source_id, &self.pool).await?;

        let mut stranded =
            Page::find_needing_crawl_job_for_source(source_id, MAX_PAGES_PER_SYNC, &self.pool)
                .await?;
        stranded.extend(
            Page::find_needing_train_job_for_source(source_id, MAX_PAGES_PER_SYNC, &self.pool)
                .await?,
        );

        let mut created = self.requeue(&stranded, JobOrigin::Recovery).await?;

        if source.workflow_status == WorkflowStatus::Crawling
            && Page::count_for_source(source_id, &self.pool).await? == 0
        {
            let spec = CrawlSourceJob::new(source_id)
                .with_origin(JobOrigin::Recovery)
                .to_spec()?;
            if self.queue.enqueue(spec).await?.is_created() {
                created += 1;
            }
        }

        Ok(SyncReport {
            pages_examined: stranded.len(),
            jobs_created: created,
            total_processing_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// When the last pass finished, for health reporting.
    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        *self.last_run.read().unwrap_or_else(|e| e.into_inner())
    }

    async fn sync_pass(&self) -> Result<SyncReport> {
        let started = std::time::Instant::now();

        let mut stranded = Page::find_needing_crawl_job(MAX_PAGES_PER_SYNC, &self.pool).await?;
        let remaining = MAX_PAGES_PER_SYNC - stranded.len() as i64;
        if remaining > 0 {
            stranded.extend(Page::find_needing_train_job(remaining, &self.pool).await?);
        }

        let created = self.requeue(&stranded, JobOrigin::Sync).await?;

        let report = SyncReport {
            pages_examined: stranded.len(),
            jobs_created: created,
            total_processing_time_ms: started.elapsed().as_millis() as u64,
        };
        if report.jobs_created > 0 {
            info!(
                examined = report.pages_examined,
                created = report.jobs_created,
                "synchronization requeued stranded pages"
            );
        } else {
            debug!(examined = report.pages_examined, "synchronization found nothing to requeue");
        }
        Ok(report)
    }

    async fn requeue(&self, pages: &[Page], origin: JobOrigin) -> Result<usize> {
        let mut created = 0;
        for page in pages {
            let Some(spec) = stage_job_spec(page, origin)? else {
                continue;
            };
            // A duplicate means an active job beat us to the page
            if self.queue.enqueue(spec).await?.is_created() {
                created += 1;
            }
        }
        Ok(created)
    }
}
