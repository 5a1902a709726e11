//! Job queue interface and its PostgreSQL implementation.
//!
//! The queue is the only way code outside this module touches job rows.
//! Every state change is a single conditional UPDATE in the store, which is
//! what makes claiming safe across uncoordinated worker processes.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::debug;
use typed_builder::TypedBuilder;

use super::job::{Job, JobPriority, JobStatus};
use crate::common::{JobId, PageId, SourceId};

/// Result type for enqueue operations that handles idempotency.
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    /// Job was enqueued, returns new job ID
    Created(JobId),
    /// An active job already holds this key, returns the existing job ID
    Duplicate(JobId),
}

impl EnqueueResult {
    /// Get the job ID regardless of whether it was created or duplicate
    pub fn job_id(&self) -> JobId {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => *id,
        }
    }

    /// Returns true if this was a newly created job
    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// What happened to a job after a failure was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Attempts remain; the job will run again
    WillRetry { attempts: i32 },
    /// Attempts exhausted; the job is failed for good
    Exhausted { attempts: i32 },
    /// The job was not processing (another transition won the race)
    NotProcessing,
}

impl JobOutcome {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, JobOutcome::Exhausted { .. })
    }

    fn from_updated(job: Option<Job>) -> Self {
        match job {
            Some(job) if job.status == JobStatus::Failed => JobOutcome::Exhausted {
                attempts: job.attempts,
            },
            Some(job) => JobOutcome::WillRetry {
                attempts: job.attempts,
            },
            None => JobOutcome::NotProcessing,
        }
    }
}

/// Everything needed to enqueue one job.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobSpec {
    pub job_type: String,
    pub source_id: SourceId,
    #[builder(default, setter(strip_option))]
    pub page_id: Option<PageId>,
    #[builder(default, setter(strip_option))]
    pub job_key: Option<String>,
    #[builder(default = serde_json::json!({}))]
    pub payload: serde_json::Value,
    #[builder(default)]
    pub priority: JobPriority,
    #[builder(default = 3)]
    pub max_attempts: i32,
    #[builder(default, setter(strip_option))]
    pub run_at: Option<DateTime<Utc>>,
}

/// Metadata for typed job payloads.
///
/// Each pipeline job type implements this so call sites enqueue the struct
/// instead of hand-assembling payload JSON.
pub trait PipelineCommand: Serialize {
    /// The job type name this payload belongs to.
    const JOB_TYPE: &'static str;

    /// The source this job operates on.
    fn source_id(&self) -> SourceId;

    /// The page this job operates on, when page-scoped.
    fn page_id(&self) -> Option<PageId> {
        None
    }

    /// Idempotency key: at most one pending/processing job per key.
    fn job_key(&self) -> Option<String> {
        None
    }

    /// Priority band for this job type.
    fn priority(&self) -> JobPriority {
        JobPriority::Normal
    }

    /// Maximum delivery attempts before the job is failed for good.
    fn max_attempts(&self) -> i32 {
        3
    }

    /// Serialize into a queue-ready spec.
    fn to_spec(&self) -> Result<JobSpec> {
        Ok(JobSpec {
            job_type: Self::JOB_TYPE.to_string(),
            source_id: self.source_id(),
            page_id: self.page_id(),
            job_key: self.job_key(),
            payload: serde_json::to_value(self)?,
            priority: self.priority(),
            max_attempts: self.max_attempts(),
            run_at: None,
        })
    }
}

/// Trait for job queue operations.
///
/// `PostgresJobQueue` is the production implementation;
/// `InMemoryJobQueue` (testing module) applies the same conditional-update
/// semantics under a lock so services can be exercised without a database.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job.
    ///
    /// If the spec carries a `job_key` and a pending/processing job already
    /// holds it, returns `EnqueueResult::Duplicate` with the existing ID.
    async fn enqueue(&self, spec: JobSpec) -> Result<EnqueueResult>;

    /// Read-only scan of claimable jobs (pending, due), most urgent first,
    /// oldest first within a band.
    async fn next_jobs(&self, limit: i64, job_types: Option<&[String]>) -> Result<Vec<Job>>;

    /// Claim one job via conditional update. False means another worker got
    /// there first (or the job is gone); that is contention, not an error.
    async fn claim(&self, job_id: JobId, worker_id: &str) -> Result<bool>;

    /// Return a processing job to pending with a reason. Not a failure:
    /// attempts are untouched.
    async fn release(&self, job_id: JobId, reason: &str) -> Result<bool>;

    /// Mark a processing job completed.
    async fn mark_completed(&self, job_id: JobId) -> Result<bool>;

    /// Record a handler failure; retries with backoff until attempts run out.
    async fn mark_failed(&self, job_id: JobId, error: &str) -> Result<JobOutcome>;

    /// Record a processing timeout. The row stays claimed while attempts
    /// remain; stalled-job recovery is the only path back to pending.
    async fn mark_timed_out(&self, job_id: JobId, timeout_ms: u64) -> Result<JobOutcome>;

    /// Fetch one job.
    async fn find_by_id(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Release every job processing since before `cutoff`; returns them.
    async fn release_stalled(&self, cutoff: DateTime<Utc>, reason: &str) -> Result<Vec<Job>>;
}

/// Build the row a spec describes. Shared by the queue implementations.
pub(crate) fn job_from_spec(spec: &JobSpec) -> Job {
    Job {
        id: JobId::new(),
        job_type: spec.job_type.clone(),
        source_id: spec.source_id,
        page_id: spec.page_id,
        job_key: spec.job_key.clone(),
        payload: spec.payload.clone(),
        status: JobStatus::Pending,
        priority: spec.priority.as_i32(),
        attempts: 0,
        max_attempts: spec.max_attempts,
        scheduled_at: spec.run_at.unwrap_or_else(Utc::now),
        started_at: None,
        completed_at: None,
        error_message: None,
        worker_id: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// PostgreSQL-backed job queue.
#[derive(Clone)]
pub struct PostgresJobQueue {
    pool: PgPool,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue(&self, spec: JobSpec) -> Result<EnqueueResult> {
        // Check idempotency first
        if let Some(key) = &spec.job_key {
            if let Some(existing) = Job::find_active_by_key(key, &self.pool).await? {
                debug!(job_key = %key, job_id = %existing.id, "enqueue deduplicated");
                return Ok(EnqueueResult::Duplicate(existing.id));
            }
        }

        let job = job_from_spec(&spec);

        // The partial unique index on job_key backs the check above; losing
        // that race surfaces here as a unique violation.
        match job.insert(&self.pool).await {
            Ok(inserted) => Ok(EnqueueResult::Created(inserted.id)),
            Err(err) => {
                let unique_violation = err
                    .downcast_ref::<sqlx::Error>()
                    .and_then(|e| e.as_database_error())
                    .map(|db| matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation))
                    .unwrap_or(false);

                if unique_violation {
                    if let Some(key) = &spec.job_key {
                        if let Some(existing) = Job::find_active_by_key(key, &self.pool).await? {
                            debug!(job_key = %key, job_id = %existing.id, "lost enqueue race");
                            return Ok(EnqueueResult::Duplicate(existing.id));
                        }
                    }
                }
                Err(err)
            }
        }
    }

    async fn next_jobs(&self, limit: i64, job_types: Option<&[String]>) -> Result<Vec<Job>> {
        Job::next_jobs(limit, job_types, &self.pool).await
    }

    async fn claim(&self, job_id: JobId, worker_id: &str) -> Result<bool> {
        Job::claim(job_id, worker_id, &self.pool).await
    }

    async fn release(&self, job_id: JobId, reason: &str) -> Result<bool> {
        Job::release(job_id, reason, &self.pool).await
    }

    async fn mark_completed(&self, job_id: JobId) -> Result<bool> {
        Job::mark_completed(job_id, &self.pool).await
    }

    async fn mark_failed(&self, job_id: JobId, error: &str) -> Result<JobOutcome> {
        let updated = Job::record_failure(job_id, error, &self.pool).await?;
        Ok(JobOutcome::from_updated(updated))
    }

    async fn mark_timed_out(&self, job_id: JobId, timeout_ms: u64) -> Result<JobOutcome> {
        let error = format!("Job processing timed out after {timeout_ms}ms");
        let updated = Job::record_timeout(job_id, &error, &self.pool).await?;
        Ok(JobOutcome::from_updated(updated))
    }

    async fn find_by_id(&self, job_id: JobId) -> Result<Option<Job>> {
        Job::find_by_id(job_id, &self.pool).await
    }

    async fn release_stalled(&self, cutoff: DateTime<Utc>, reason: &str) -> Result<Vec<Job>> {
        Job::release_stalled(cutoff, reason, &self.pool).await
    }
}
