//! Concurrent batch execution of claimed jobs.
//!
//! One pass of the processor:
//!
//! ```text
//! process_concurrent_jobs
//!     │
//!     ├─► Fetch up to batch_size ready jobs (one read)
//!     ├─► Split into chunks of max_concurrent_jobs
//!     └─► Per chunk: launch every job, settle all of them
//!             ├─► claim lost      ─► skipped
//!             ├─► handler Ok      ─► mark_completed
//!             ├─► handler Err     ─► mark_failed (retry or exhaust)
//!             └─► handler timeout ─► mark_timed_out
//! ```
//!
//! A timed-out job keeps its processing claim; stalled-job recovery is
//! the only path that returns it to pending. Chunking bounds how many
//! downstream crawl/train calls are in flight at once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::job::Job;
use super::queue::JobQueue;

/// Options for one processing pass.
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Maximum number of jobs fetched per pass
    pub batch_size: i64,
    /// Maximum number of jobs in flight at once
    pub max_concurrent_jobs: usize,
    /// Per-job processing timeout
    pub job_timeout: Duration,
    /// Only process these job types (None = all)
    pub job_types: Option<Vec<String>>,
    /// Worker ID used when claiming
    pub worker_id: String,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrent_jobs: 5,
            job_timeout: Duration::from_secs(300),
            job_types: None,
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl ProcessorOptions {
    /// Create options with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// Handler for claimed jobs.
///
/// Implementations must be idempotent per job: a job that times out here
/// can be released by recovery and handled again by another worker.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Execute one claimed job.
    async fn process(&self, job: &Job) -> Result<()>;

    /// Called once when a job runs out of attempts.
    ///
    /// The job row is already failed at this point; implementations use
    /// this to push the owning source or page into an error state.
    async fn on_exhausted(&self, _job: &Job, _error: &str) -> Result<()> {
        Ok(())
    }
}

/// Result of one processing pass.
///
/// `successful + failed + skipped == total_processed` always holds;
/// `total_processed` is the number of jobs the pass considered, not the
/// number of rows still pending in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    /// Jobs fetched into this pass
    pub total_processed: usize,
    /// Jobs claimed, handled, and marked completed
    pub successful: usize,
    /// Jobs claimed whose handler failed or timed out
    pub failed: usize,
    /// Jobs lost to another worker's claim
    pub skipped: usize,
    /// Wall-clock duration of the whole pass
    pub processing_time_ms: u64,
}

enum PassResult {
    Completed,
    Failed,
    Skipped,
}

/// Runs batches of ready jobs with bounded concurrency.
pub struct ConcurrentJobProcessor {
    queue: Arc<dyn JobQueue>,
    options: ProcessorOptions,
}

impl ConcurrentJobProcessor {
    pub fn new(queue: Arc<dyn JobQueue>, options: ProcessorOptions) -> Self {
        Self { queue, options }
    }

    pub fn options(&self) -> &ProcessorOptions {
        &self.options
    }

    /// Run one pass: fetch, claim, and execute ready jobs.
    ///
    /// Only the initial fetch can fail; per-job errors are recorded on the
    /// job rows and tallied into the outcome.
    pub async fn process_concurrent_jobs(
        &self,
        processor: Arc<dyn JobProcessor>,
    ) -> Result<BatchOutcome> {
        let pass_started = Instant::now();

        let mut jobs = self
            .queue
            .next_jobs(self.options.batch_size, self.options.job_types.as_deref())
            .await?;

        let mut outcome = BatchOutcome {
            total_processed: jobs.len(),
            ..Default::default()
        };

        if jobs.is_empty() {
            return Ok(outcome);
        }

        let concurrency = self.options.max_concurrent_jobs.max(1);

        while !jobs.is_empty() {
            let take = jobs.len().min(concurrency);
            let chunk: Vec<Job> = jobs.drain(..take).collect();

            let results = futures::future::join_all(
                chunk
                    .into_iter()
                    .map(|job| self.process_one(job, processor.clone())),
            )
            .await;

            for result in results {
                match result {
                    PassResult::Completed => outcome.successful += 1,
                    PassResult::Failed => outcome.failed += 1,
                    PassResult::Skipped => outcome.skipped += 1,
                }
            }
        }

        outcome.processing_time_ms = pass_started.elapsed().as_millis() as u64;

        debug!(
            total = outcome.total_processed,
            successful = outcome.successful,
            failed = outcome.failed,
            skipped = outcome.skipped,
            processing_time_ms = outcome.processing_time_ms,
            "processing pass complete"
        );

        Ok(outcome)
    }

    /// Claim and execute one job.
    async fn process_one(&self, job: Job, processor: Arc<dyn JobProcessor>) -> PassResult {
        let claimed = match self.queue.claim(job.id, &self.options.worker_id).await {
            Ok(claimed) => claimed,
            Err(e) => {
                // Unknown store outcome: leave the row alone for a later pass.
                warn!(job_id = %job.id, error = %e, "claim query failed");
                return PassResult::Skipped;
            }
        };

        if !claimed {
            debug!(job_id = %job.id, job_type = %job.job_type, "job claimed by another worker");
            return PassResult::Skipped;
        }

        let started = Instant::now();
        let run = tokio::time::timeout(self.options.job_timeout, processor.process(&job)).await;

        match run {
            Ok(Ok(())) => {
                debug!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job completed"
                );
                if let Err(e) = self.queue.mark_completed(job.id).await {
                    error!(job_id = %job.id, error = %e, "failed to mark job as completed");
                }
                PassResult::Completed
            }
            Ok(Err(e)) => {
                warn!(job_id = %job.id, job_type = %job.job_type, error = %e, "job failed");
                match self.queue.mark_failed(job.id, &e.to_string()).await {
                    Ok(job_outcome) if job_outcome.is_exhausted() => {
                        if let Err(esc) = processor.on_exhausted(&job, &e.to_string()).await {
                            error!(job_id = %job.id, error = %esc, "exhausted-job handler failed");
                        }
                    }
                    Ok(_) => {}
                    Err(mark_err) => {
                        error!(job_id = %job.id, error = %mark_err, "failed to mark job as failed");
                    }
                }
                PassResult::Failed
            }
            Err(_elapsed) => {
                let timeout_ms = self.options.job_timeout.as_millis() as u64;
                warn!(job_id = %job.id, job_type = %job.job_type, timeout_ms, "job timed out");
                match self.queue.mark_timed_out(job.id, timeout_ms).await {
                    Ok(job_outcome) if job_outcome.is_exhausted() => {
                        let error = format!("Job processing timed out after {timeout_ms}ms");
                        if let Err(esc) = processor.on_exhausted(&job, &error).await {
                            error!(job_id = %job.id, error = %esc, "exhausted-job handler failed");
                        }
                    }
                    Ok(_) => {}
                    Err(mark_err) => {
                        error!(job_id = %job.id, error = %mark_err, "failed to record job timeout");
                    }
                }
                PassResult::Failed
            }
        }
    }
}
