//! Typed payloads for the three pipeline job types.
//!
//! Call sites enqueue these structs instead of hand-assembled JSON; the job
//! key on each one guarantees at most one active job per source or page.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::common::{PageId, SourceId};
use crate::domains::sources::models::Page;
use crate::domains::sources::status::WorkflowStatus;
use crate::kernel::jobs::{JobPriority, JobSpec, PipelineCommand};

/// Where a job came from. Stored in the payload so operators can tell
/// scheduled synchronization and recovery work apart from the regular
/// workflow, and so sync jobs can run at their own priority band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOrigin {
    Workflow,
    Sync,
    Recovery,
}

/// Discover the pages under a source and fan out crawl jobs for them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSourceJob {
    pub source_id: SourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<JobOrigin>,
}

impl CrawlSourceJob {
    pub fn new(source_id: SourceId) -> Self {
        Self {
            source_id,
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: JobOrigin) -> Self {
        self.origin = Some(origin);
        self
    }
}

impl PipelineCommand for CrawlSourceJob {
    const JOB_TYPE: &'static str = "crawl_source";

    fn source_id(&self) -> SourceId {
        self.source_id
    }

    fn job_key(&self) -> Option<String> {
        Some(format!("crawl:{}", self.source_id))
    }

    fn priority(&self) -> JobPriority {
        match self.origin {
            Some(JobOrigin::Sync) => JobPriority::Medium,
            _ => JobPriority::Normal,
        }
    }
}

/// Fetch and store the content of one discovered page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlPageJob {
    pub source_id: SourceId,
    pub page_id: PageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<JobOrigin>,
}

impl CrawlPageJob {
    pub fn new(source_id: SourceId, page_id: PageId) -> Self {
        Self {
            source_id,
            page_id,
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: JobOrigin) -> Self {
        self.origin = Some(origin);
        self
    }
}

impl PipelineCommand for CrawlPageJob {
    const JOB_TYPE: &'static str = "crawl_page";

    fn source_id(&self) -> SourceId {
        self.source_id
    }

    fn page_id(&self) -> Option<PageId> {
        Some(self.page_id)
    }

    fn job_key(&self) -> Option<String> {
        Some(format!("crawl:{}", self.page_id))
    }

    fn priority(&self) -> JobPriority {
        match self.origin {
            Some(JobOrigin::Sync) => JobPriority::Medium,
            _ => JobPriority::High,
        }
    }
}

/// Index one crawled page into the assistant's knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainPageJob {
    pub source_id: SourceId,
    pub page_id: PageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<JobOrigin>,
}

impl TrainPageJob {
    pub fn new(source_id: SourceId, page_id: PageId) -> Self {
        Self {
            source_id,
            page_id,
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: JobOrigin) -> Self {
        self.origin = Some(origin);
        self
    }
}

impl PipelineCommand for TrainPageJob {
    const JOB_TYPE: &'static str = "train_page";

    fn source_id(&self) -> SourceId {
        self.source_id
    }

    fn page_id(&self) -> Option<PageId> {
        Some(self.page_id)
    }

    fn job_key(&self) -> Option<String> {
        Some(format!("train:{}", self.page_id))
    }

    fn priority(&self) -> JobPriority {
        match self.origin {
            Some(JobOrigin::Sync) => JobPriority::Medium,
            _ => JobPriority::Normal,
        }
    }
}

/// The job that would move a page out of its current status, if any.
///
/// Created pages need a crawl, completed pages need training; every other
/// status is either in flight or terminal. Synchronization and recovery use
/// this to requeue stranded pages, and the idempotency keys make a second
/// pass over the same page a no-op.
pub fn stage_job_spec(page: &Page, origin: JobOrigin) -> Result<Option<JobSpec>> {
    let spec = match page.workflow_status {
        WorkflowStatus::Created => Some(
            CrawlPageJob::new(page.parent_source_id, page.id)
                .with_origin(origin)
                .to_spec()?,
        ),
        WorkflowStatus::Completed => Some(
            TrainPageJob::new(page.parent_source_id, page.id)
                .with_origin(origin)
                .to_spec()?,
        ),
        _ => None,
    };
    Ok(spec)
}
