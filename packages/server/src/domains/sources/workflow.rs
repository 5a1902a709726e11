//! Workflow engine for the ingestion pipeline.
//!
//! Every status change goes through here: the engine validates it against
//! the legal transition matrix, persists it atomically with its audit event,
//! and enqueues the follow-up jobs a stage entry requires. Pages may trail
//! their source through the pipeline but never lead it.

use std::sync::Arc;

use serde_json::json;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info};

use crate::common::{PageId, SourceId};
use crate::domains::sources::jobs::commands::{stage_job_spec, CrawlSourceJob, JobOrigin};
use crate::domains::sources::models::workflow_event::event_types;
use crate::domains::sources::models::{transition, Page, Source};
use crate::domains::sources::status::WorkflowStatus;
use crate::kernel::jobs::{JobQueue, PipelineCommand};

/// Pages handed to the queue per scan round during stage fan-out.
const FANOUT_BATCH: i64 = 100;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Source {0} not found")]
    SourceNotFound(SourceId),

    #[error("Page {0} not found")]
    PageNotFound(PageId),

    #[error("Illegal transition {from} -> {to} for source {id}")]
    IllegalSourceTransition {
        id: SourceId,
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    #[error("Illegal transition {from} -> {to} for page {id}")]
    IllegalPageTransition {
        id: PageId,
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    #[error("Page {page_id} cannot enter {target} while its source is {source_status}")]
    PageAheadOfSource {
        page_id: PageId,
        target: WorkflowStatus,
        source_status: WorkflowStatus,
    },

    #[error("Concurrent update lost: {0}")]
    Conflict(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Whether a page may enter `target` while its source sits at
/// `source_status`. Stages only constrain each other while both sides are on
/// the pipeline; error and removal parking are always reachable.
fn page_may_enter(target: WorkflowStatus, source_status: WorkflowStatus) -> bool {
    match (target.pipeline_stage(), source_status.pipeline_stage()) {
        (Some(page_stage), Some(source_stage)) => page_stage <= source_stage,
        _ => true,
    }
}

#[derive(Clone)]
pub struct WorkflowEngine {
    pool: PgPool,
    queue: Arc<dyn JobQueue>,
}

impl WorkflowEngine {
    pub fn new(pool: PgPool, queue: Arc<dyn JobQueue>) -> Self {
        Self { pool, queue }
    }

    // ------------------------------------------------------------------
    // Source lifecycle
    // ------------------------------------------------------------------

    /// Register a source, or return the existing one for the same URL.
    /// The boolean is true when a new source was created.
    pub async fn create_source(
        &self,
        name: &str,
        url: &str,
    ) -> Result<(Source, bool), WorkflowError> {
        let (source, created) = Source::find_or_create(name, url, &self.pool).await?;

        if created {
            transition::record_event(
                source.id,
                None,
                event_types::SOURCE_CREATED,
                None,
                WorkflowStatus::Created,
                json!({ "url": source.url }),
                &self.pool,
            )
            .await?;
            info!(source_id = %source.id, url = %source.url, "source created");
        }

        Ok((source, created))
    }

    /// Move a source into `crawling` and enqueue the discovery job.
    ///
    /// Legal from `created`, after a finished run (`completed`, `trained`)
    /// and from `error`, so re-crawls and recovery retries share one path.
    pub async fn start_crawl(&self, source_id: SourceId) -> Result<Source, WorkflowError> {
        let source = self.transition_source_checked(
            source_id,
            WorkflowStatus::Crawling,
            None,
            event_types::CRAWL_STARTED,
            json!({}),
        )
        .await?;

        let result = self
            .queue
            .enqueue(CrawlSourceJob::new(source_id).to_spec()?)
            .await?;
        info!(
            source_id = %source_id,
            job_id = %result.job_id(),
            "crawl started"
        );

        Ok(source)
    }

    /// Move a crawled source into `training` and enqueue a train job for
    /// every page that finished crawling. Returns the job count; a source
    /// with nothing to train completes immediately.
    pub async fn start_training(
        &self,
        source_id: SourceId,
    ) -> Result<(Source, usize), WorkflowError> {
        let source = self.transition_source_checked(
            source_id,
            WorkflowStatus::Training,
            None,
            event_types::TRAINING_STARTED,
            json!({}),
        )
        .await?;

        let enqueued = self.enqueue_missing_train_jobs(source_id).await?;
        info!(source_id = %source_id, jobs = enqueued, "training started");

        if enqueued == 0 {
            if let Some(trained) = self.maybe_complete_source_training(source_id).await? {
                return Ok((trained, 0));
            }
        }

        Ok((source, enqueued))
    }

    /// First deletion phase: park the source and its live pages in
    /// `pending_removal`. Outstanding jobs for the parked rows become
    /// no-ops and drain on their own.
    pub async fn request_removal(
        &self,
        source_id: SourceId,
    ) -> Result<(Source, Vec<Page>), WorkflowError> {
        let source = self.load_source(source_id).await?;

        if !source
            .workflow_status
            .can_transition_to(WorkflowStatus::PendingRemoval)
        {
            return Err(WorkflowError::IllegalSourceTransition {
                id: source_id,
                from: source.workflow_status,
                to: WorkflowStatus::PendingRemoval,
            });
        }

        transition::mark_source_pending_removal(source_id, source.workflow_status, &self.pool)
            .await?
            .ok_or_else(|| {
                WorkflowError::Conflict(format!(
                    "Source {source_id} left {} before removal was recorded",
                    source.workflow_status
                ))
            })
    }

    /// Undo a pending removal. Every parked row returns to the status it
    /// held when removal was requested.
    pub async fn restore(&self, source_id: SourceId) -> Result<(Source, Vec<Page>), WorkflowError> {
        let source = self.load_source(source_id).await?;

        if source.workflow_status != WorkflowStatus::PendingRemoval {
            return Err(WorkflowError::IllegalSourceTransition {
                id: source_id,
                from: source.workflow_status,
                to: source.previous_status.unwrap_or(WorkflowStatus::Created),
            });
        }

        transition::restore_source(source_id, &self.pool)
            .await?
            .ok_or_else(|| {
                WorkflowError::Conflict(format!("Source {source_id} has no status to restore"))
            })
    }

    /// Second deletion phase: settle a parked source into the terminal
    /// `removed` status, keeping the rows for audit.
    pub async fn finalize_removal(
        &self,
        source_id: SourceId,
    ) -> Result<(Source, Vec<Page>), WorkflowError> {
        let source = self.load_source(source_id).await?;

        if source.workflow_status != WorkflowStatus::PendingRemoval {
            return Err(WorkflowError::IllegalSourceTransition {
                id: source_id,
                from: source.workflow_status,
                to: WorkflowStatus::Removed,
            });
        }

        transition::finalize_source_removal(source_id, &self.pool)
            .await?
            .ok_or_else(|| {
                WorkflowError::Conflict(format!(
                    "Source {source_id} left pending_removal before it was finalized"
                ))
            })
    }

    /// Physically delete a parked, removed or errored source together with
    /// its pages and jobs. The audit trail survives.
    pub async fn delete_source(&self, source_id: SourceId) -> Result<Source, WorkflowError> {
        let source = self.load_source(source_id).await?;

        if !source.workflow_status.allows_deletion() {
            return Err(WorkflowError::IllegalSourceTransition {
                id: source_id,
                from: source.workflow_status,
                to: WorkflowStatus::Removed,
            });
        }

        transition::delete_source_hard(source_id, &self.pool)
            .await?
            .ok_or_else(|| {
                WorkflowError::Conflict(format!(
                    "Source {source_id} left {} before it was deleted",
                    source.workflow_status
                ))
            })
    }

    /// Drive a source to `error` after its pipeline job exhausted retries.
    /// Sources already in error or parked for removal are left alone.
    pub async fn fail_source(
        &self,
        source_id: SourceId,
        error: &str,
    ) -> Result<Option<Source>, WorkflowError> {
        let Some(source) = Source::find_by_id_optional(source_id, &self.pool).await? else {
            return Ok(None);
        };

        if !source
            .workflow_status
            .can_transition_to(WorkflowStatus::Error)
        {
            return Ok(None);
        }

        let updated = transition::apply_source_transition(
            source_id,
            source.workflow_status,
            WorkflowStatus::Error,
            Some(error),
            event_types::SOURCE_FAILED,
            json!({ "error": error }),
            &self.pool,
        )
        .await?;

        Ok(updated.map(|(source, _)| source))
    }

    // ------------------------------------------------------------------
    // Page lifecycle (called from job handlers)
    // ------------------------------------------------------------------

    /// Record the crawler's discovery results: insert the new pages, bump
    /// the source page count, and enqueue a crawl job for every page still
    /// waiting on one. Returns the newly inserted pages and the number of
    /// jobs enqueued.
    pub async fn record_discovered_pages(
        &self,
        source: &Source,
        discovered: &[crate::kernel::DiscoveredPage],
    ) -> Result<(Vec<Page>, usize), WorkflowError> {
        let new_pages = Page::create_many(source.id, discovered, &self.pool).await?;

        let total = Page::count_for_source(source.id, &self.pool).await?;
        Source::update_page_count(source.id, total as i32, &self.pool).await?;

        transition::record_event(
            source.id,
            None,
            event_types::PAGES_DISCOVERED,
            None,
            source.workflow_status,
            json!({ "discovered": discovered.len(), "new": new_pages.len() }),
            &self.pool,
        )
        .await?;

        let enqueued = self.enqueue_missing_crawl_jobs(source.id).await?;
        debug!(
            source_id = %source.id,
            new = new_pages.len(),
            jobs = enqueued,
            "discovery recorded"
        );

        Ok((new_pages, enqueued))
    }

    pub async fn start_page_crawl(&self, page_id: PageId) -> Result<Page, WorkflowError> {
        self.transition_page_checked(
            page_id,
            WorkflowStatus::Crawling,
            None,
            event_types::PAGE_CRAWL_STARTED,
            json!({}),
        )
        .await
    }

    /// Finish a page crawl and, when this was the last page in flight,
    /// complete the source crawl as well.
    pub async fn complete_page_crawl(
        &self,
        page_id: PageId,
        title: Option<&str>,
    ) -> Result<Page, WorkflowError> {
        if let Some(title) = title {
            Page::update_title(page_id, title, &self.pool).await?;
        }

        let page = self
            .transition_page_checked(
                page_id,
                WorkflowStatus::Completed,
                None,
                event_types::PAGE_CRAWLED,
                json!({}),
            )
            .await?;

        self.maybe_complete_source_crawl(page.parent_source_id)
            .await?;
        Ok(page)
    }

    pub async fn start_page_training(&self, page_id: PageId) -> Result<Page, WorkflowError> {
        self.transition_page_checked(
            page_id,
            WorkflowStatus::Training,
            None,
            event_types::PAGE_TRAIN_STARTED,
            json!({}),
        )
        .await
    }

    /// Finish training one page and, when this was the last page pending,
    /// complete the source training as well.
    pub async fn complete_page_training(
        &self,
        page_id: PageId,
        chunks_indexed: i64,
    ) -> Result<Page, WorkflowError> {
        let page = self
            .transition_page_checked(
                page_id,
                WorkflowStatus::Trained,
                None,
                event_types::PAGE_TRAINED,
                json!({ "chunks_indexed": chunks_indexed }),
            )
            .await?;

        self.maybe_complete_source_training(page.parent_source_id)
            .await?;
        Ok(page)
    }

    /// Drive a page to `error` after its job exhausted retries. Pages
    /// already in error or parked for removal are left alone, and the
    /// source aggregation runs so an errored last page cannot strand its
    /// source mid-stage.
    pub async fn fail_page(
        &self,
        page_id: PageId,
        error: &str,
        event_type: &str,
    ) -> Result<Option<Page>, WorkflowError> {
        let Some(page) = Page::find_by_id_optional(page_id, &self.pool).await? else {
            return Ok(None);
        };

        if !page.workflow_status.can_transition_to(WorkflowStatus::Error) {
            return Ok(None);
        }

        let updated = transition::apply_page_transition(
            page_id,
            page.workflow_status,
            WorkflowStatus::Error,
            Some(error),
            event_type,
            json!({ "error": error }),
            &self.pool,
        )
        .await?;

        if updated.is_some() {
            self.maybe_complete_source_crawl(page.parent_source_id)
                .await?;
            self.maybe_complete_source_training(page.parent_source_id)
                .await?;
        }

        Ok(updated.map(|(page, _)| page))
    }

    // ------------------------------------------------------------------
    // Aggregation
    // ------------------------------------------------------------------

    /// Complete the source crawl once no page is created or crawling.
    /// Errored pages do not block completion.
    pub async fn maybe_complete_source_crawl(
        &self,
        source_id: SourceId,
    ) -> Result<Option<Source>, WorkflowError> {
        let Some(source) = Source::find_by_id_optional(source_id, &self.pool).await? else {
            return Ok(None);
        };
        if source.workflow_status != WorkflowStatus::Crawling {
            return Ok(None);
        }

        let in_flight = Page::count_in_statuses(
            source_id,
            &[WorkflowStatus::Created, WorkflowStatus::Crawling],
            &self.pool,
        )
        .await?;
        if in_flight > 0 {
            return Ok(None);
        }

        let crawled = Page::count_in_statuses(
            source_id,
            &[
                WorkflowStatus::Completed,
                WorkflowStatus::Training,
                WorkflowStatus::Trained,
            ],
            &self.pool,
        )
        .await?;
        let errored =
            Page::count_in_statuses(source_id, &[WorkflowStatus::Error], &self.pool).await?;

        let updated = transition::apply_source_transition(
            source_id,
            WorkflowStatus::Crawling,
            WorkflowStatus::Completed,
            None,
            event_types::CRAWL_COMPLETED,
            json!({ "pages_crawled": crawled, "pages_errored": errored }),
            &self.pool,
        )
        .await?;

        if updated.is_some() {
            info!(source_id = %source_id, crawled, errored, "source crawl completed");
        }
        Ok(updated.map(|(source, _)| source))
    }

    /// Complete the source training once no page is completed or training.
    pub async fn maybe_complete_source_training(
        &self,
        source_id: SourceId,
    ) -> Result<Option<Source>, WorkflowError> {
        let Some(source) = Source::find_by_id_optional(source_id, &self.pool).await? else {
            return Ok(None);
        };
        if source.workflow_status != WorkflowStatus::Training {
            return Ok(None);
        }

        let pending = Page::count_in_statuses(
            source_id,
            &[WorkflowStatus::Completed, WorkflowStatus::Training],
            &self.pool,
        )
        .await?;
        if pending > 0 {
            return Ok(None);
        }

        let trained =
            Page::count_in_statuses(source_id, &[WorkflowStatus::Trained], &self.pool).await?;
        let errored =
            Page::count_in_statuses(source_id, &[WorkflowStatus::Error], &self.pool).await?;

        let updated = transition::apply_source_transition(
            source_id,
            WorkflowStatus::Training,
            WorkflowStatus::Trained,
            None,
            event_types::TRAINING_COMPLETED,
            json!({ "pages_trained": trained, "pages_errored": errored }),
            &self.pool,
        )
        .await?;

        if updated.is_some() {
            info!(source_id = %source_id, trained, errored, "source training completed");
        }
        Ok(updated.map(|(source, _)| source))
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn load_source(&self, source_id: SourceId) -> Result<Source, WorkflowError> {
        Source::find_by_id_optional(source_id, &self.pool)
            .await?
            .ok_or(WorkflowError::SourceNotFound(source_id))
    }

    async fn transition_source_checked(
        &self,
        source_id: SourceId,
        to: WorkflowStatus,
        error_message: Option<&str>,
        event_type: &str,
        metadata: serde_json::Value,
    ) -> Result<Source, WorkflowError> {
        let source = self.load_source(source_id).await?;

        if !source.workflow_status.can_transition_to(to) {
            return Err(WorkflowError::IllegalSourceTransition {
                id: source_id,
                from: source.workflow_status,
                to,
            });
        }

        transition::apply_source_transition(
            source_id,
            source.workflow_status,
            to,
            error_message,
            event_type,
            metadata,
            &self.pool,
        )
        .await?
        .map(|(source, _)| source)
        .ok_or_else(|| {
            WorkflowError::Conflict(format!(
                "Source {source_id} left {} before moving to {to}",
                source.workflow_status
            ))
        })
    }

    async fn transition_page_checked(
        &self,
        page_id: PageId,
        to: WorkflowStatus,
        error_message: Option<&str>,
        event_type: &str,
        metadata: serde_json::Value,
    ) -> Result<Page, WorkflowError> {
        let page = Page::find_by_id_optional(page_id, &self.pool)
            .await?
            .ok_or(WorkflowError::PageNotFound(page_id))?;
        let source = self.load_source(page.parent_source_id).await?;

        if !page.workflow_status.can_transition_to(to) {
            return Err(WorkflowError::IllegalPageTransition {
                id: page_id,
                from: page.workflow_status,
                to,
            });
        }
        if !page_may_enter(to, source.workflow_status) {
            return Err(WorkflowError::PageAheadOfSource {
                page_id,
                target: to,
                source_status: source.workflow_status,
            });
        }

        transition::apply_page_transition(
            page_id,
            page.workflow_status,
            to,
            error_message,
            event_type,
            metadata,
            &self.pool,
        )
        .await?
        .map(|(page, _)| page)
        .ok_or_else(|| {
            WorkflowError::Conflict(format!(
                "Page {page_id} left {} before moving to {to}",
                page.workflow_status
            ))
        })
    }

    /// Enqueue crawl jobs for every created page without an active one,
    /// scanning in rounds until the source is covered.
    async fn enqueue_missing_crawl_jobs(
        &self,
        source_id: SourceId,
    ) -> Result<usize, WorkflowError> {
        let mut enqueued = 0;
        loop {
            let batch =
                Page::find_needing_crawl_job_for_source(source_id, FANOUT_BATCH, &self.pool)
                    .await?;
            if batch.is_empty() {
                break;
            }
            for page in &batch {
                if let Some(spec) = stage_job_spec(page, JobOrigin::Workflow)? {
                    if self.queue.enqueue(spec).await?.is_created() {
                        enqueued += 1;
                    }
                }
            }
        }
        Ok(enqueued)
    }

    /// Train-stage analog of [`Self::enqueue_missing_crawl_jobs`].
    async fn enqueue_missing_train_jobs(
        &self,
        source_id: SourceId,
    ) -> Result<usize, WorkflowError> {
        let mut enqueued = 0;
        loop {
            let batch =
                Page::find_needing_train_job_for_source(source_id, FANOUT_BATCH, &self.pool)
                    .await?;
            if batch.is_empty() {
                break;
            }
            for page in &batch {
                if let Some(spec) = stage_job_spec(page, JobOrigin::Workflow)? {
                    if self.queue.enqueue(spec).await?.is_created() {
                        enqueued += 1;
                    }
                }
            }
        }
        Ok(enqueued)
    }
}
