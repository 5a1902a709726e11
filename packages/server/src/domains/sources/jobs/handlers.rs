//! Handlers for the pipeline job types.
//!
//! Handlers are written to be retried: each one re-reads the page or source
//! it operates on and skips work another run already finished, so a job
//! released by stalled recovery can safely execute twice. External calls go
//! through the per-service circuit breakers.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::domains::sources::jobs::commands::{CrawlPageJob, CrawlSourceJob, TrainPageJob};
use crate::domains::sources::models::workflow_event::event_types;
use crate::domains::sources::models::{Page, Source};
use crate::domains::sources::status::WorkflowStatus;
use crate::kernel::jobs::{Job, JobProcessor, JobRegistry, PipelineCommand, SharedJobRegistry};
use crate::kernel::ServerDeps;

/// Breaker name guarding calls to the crawl service.
pub const CRAWLER_SERVICE: &str = "crawler";

/// Breaker name guarding calls to the training service.
pub const TRAINER_SERVICE: &str = "trainer";

/// Discover the pages under a source and fan out crawl jobs for them.
pub async fn crawl_source(job: CrawlSourceJob, deps: &ServerDeps) -> Result<()> {
    let Some(source) = Source::find_by_id_optional(job.source_id, &deps.db_pool).await? else {
        warn!(source_id = %job.source_id, "crawl job for a missing source, skipping");
        return Ok(());
    };

    if source.workflow_status != WorkflowStatus::Crawling {
        info!(
            source_id = %source.id,
            status = %source.workflow_status,
            "source is not crawling, skipping discovery"
        );
        return Ok(());
    }

    let discovered = deps
        .breakers
        .execute(CRAWLER_SERVICE, || deps.crawler.discover(&source.url))
        .await?;

    let engine = deps.workflow();
    let (new_pages, enqueued) = engine.record_discovered_pages(&source, &discovered).await?;
    info!(
        source_id = %source.id,
        discovered = discovered.len(),
        new = new_pages.len(),
        jobs = enqueued,
        "discovery complete"
    );

    // A source with no pages to crawl is done right away
    engine.maybe_complete_source_crawl(source.id).await?;
    Ok(())
}

/// Fetch one page through the crawl service and record the result.
pub async fn crawl_page(job: CrawlPageJob, deps: &ServerDeps) -> Result<()> {
    let Some(page) = Page::find_by_id_optional(job.page_id, &deps.db_pool).await? else {
        warn!(page_id = %job.page_id, "crawl job for a missing page, skipping");
        return Ok(());
    };

    let engine = deps.workflow();
    let page = match page.workflow_status {
        WorkflowStatus::Created => engine.start_page_crawl(page.id).await?,
        // An earlier run stalled after starting; crawl again from here
        WorkflowStatus::Crawling => page,
        status => {
            info!(page_id = %page.id, %status, "page no longer waiting on a crawl, skipping");
            return Ok(());
        }
    };

    let report = deps
        .breakers
        .execute(CRAWLER_SERVICE, || deps.crawler.crawl_page(&page.url))
        .await?;

    engine
        .complete_page_crawl(page.id, report.title.as_deref())
        .await?;
    Ok(())
}

/// Index one crawled page into the knowledge base.
pub async fn train_page(job: TrainPageJob, deps: &ServerDeps) -> Result<()> {
    let Some(page) = Page::find_by_id_optional(job.page_id, &deps.db_pool).await? else {
        warn!(page_id = %job.page_id, "train job for a missing page, skipping");
        return Ok(());
    };

    let engine = deps.workflow();
    let page = match page.workflow_status {
        WorkflowStatus::Completed => engine.start_page_training(page.id).await?,
        WorkflowStatus::Training => page,
        status => {
            info!(page_id = %page.id, %status, "page no longer waiting on training, skipping");
            return Ok(());
        }
    };

    let report = deps
        .breakers
        .execute(TRAINER_SERVICE, || deps.trainer.train_page(&page.url))
        .await?;

    engine
        .complete_page_training(page.id, report.chunks_indexed)
        .await?;
    Ok(())
}

/// Register all pipeline job types with their handlers.
pub fn register_pipeline_jobs(registry: &mut JobRegistry) {
    registry.register::<CrawlSourceJob, _, _>(CrawlSourceJob::JOB_TYPE, |job, deps| async move {
        crawl_source(job, &deps).await
    });
    registry.register::<CrawlPageJob, _, _>(CrawlPageJob::JOB_TYPE, |job, deps| async move {
        crawl_page(job, &deps).await
    });
    registry.register::<TrainPageJob, _, _>(TrainPageJob::JOB_TYPE, |job, deps| async move {
        train_page(job, &deps).await
    });
}

/// Claim-side dispatcher for the batch processor.
///
/// Routes claimed jobs through the registry; when a job runs out of
/// attempts the escalation hook drives the owning page or source to
/// `error` so the workflow reflects the dead job.
pub struct PipelineJobProcessor {
    registry: SharedJobRegistry,
    deps: Arc<ServerDeps>,
}

impl PipelineJobProcessor {
    pub fn new(deps: Arc<ServerDeps>) -> Self {
        let mut registry = JobRegistry::new();
        register_pipeline_jobs(&mut registry);
        Self {
            registry: Arc::new(registry),
            deps,
        }
    }

    /// The job types this processor handles, for the runner's type filter.
    pub fn job_types(&self) -> Vec<String> {
        self.registry
            .registered_types()
            .into_iter()
            .map(str::to_string)
            .collect()
    }
}

#[async_trait]
impl JobProcessor for PipelineJobProcessor {
    async fn process(&self, job: &Job) -> Result<()> {
        self.registry.execute(job, self.deps.clone()).await
    }

    async fn on_exhausted(&self, job: &Job, error: &str) -> Result<()> {
        let engine = self.deps.workflow();

        match job.job_type.as_str() {
            CrawlSourceJob::JOB_TYPE => {
                engine.fail_source(job.source_id, error).await?;
            }
            CrawlPageJob::JOB_TYPE => {
                if let Some(page_id) = job.page_id {
                    engine
                        .fail_page(page_id, error, event_types::PAGE_CRAWL_FAILED)
                        .await?;
                }
            }
            TrainPageJob::JOB_TYPE => {
                if let Some(page_id) = job.page_id {
                    engine
                        .fail_page(page_id, error, event_types::PAGE_TRAIN_FAILED)
                        .await?;
                }
            }
            other => {
                warn!(job_type = other, job_id = %job.id, "no escalation for exhausted job");
            }
        }
        Ok(())
    }
}
