//! Job testing utilities.
//!
//! `InMemoryJobQueue` applies the same conditional-update semantics as the
//! PostgreSQL queue under a lock, so services built on `JobQueue` can be
//! exercised without a database. `RecordingProcessor` and `FlakyProcessor`
//! are `JobProcessor` doubles for driving the batch engine.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::job::{Job, JobStatus};
use super::processor::JobProcessor;
use super::queue::{job_from_spec, EnqueueResult, JobOutcome, JobQueue, JobSpec};
use crate::common::JobId;

/// In-memory job queue with store-equivalent claim semantics.
pub struct InMemoryJobQueue {
    jobs: RwLock<HashMap<JobId, Job>>,
    /// Claims to lose once, as if another worker won the row first
    denied_claims: RwLock<HashSet<JobId>>,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            denied_claims: RwLock::new(HashSet::new()),
        }
    }

    /// Make the next `claim` on this job return false, without touching the
    /// row. Simulates losing the claim race to another worker.
    pub fn deny_next_claim(&self, job_id: JobId) {
        self.denied_claims
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id);
    }

    /// All jobs, in no particular order.
    pub fn all_jobs(&self) -> Vec<Job> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Jobs of one type, in no particular order.
    pub fn jobs_of_type(&self, job_type: &str) -> Vec<Job> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|j| j.job_type == job_type)
            .cloned()
            .collect()
    }

    pub fn count_with_status(&self, status: JobStatus) -> usize {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|j| j.status == status)
            .count()
    }

    /// Backdate a processing job's `started_at`, for stall scenarios.
    pub fn backdate_started_at(&self, job_id: JobId, started_at: DateTime<Utc>) {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = jobs.get_mut(&job_id) {
            job.started_at = Some(started_at);
        }
    }

    /// Pull a pending job's `scheduled_at` back to now, collapsing backoff.
    pub fn make_due(&self, job_id: JobId) {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = jobs.get_mut(&job_id) {
            job.scheduled_at = Utc::now();
        }
    }

    pub fn clear(&self) {
        self.jobs.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.denied_claims
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, spec: JobSpec) -> Result<EnqueueResult> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());

        if let Some(key) = &spec.job_key {
            let existing = jobs
                .values()
                .find(|j| j.job_key.as_deref() == Some(key) && !j.status.is_terminal());
            if let Some(existing) = existing {
                return Ok(EnqueueResult::Duplicate(existing.id));
            }
        }

        let job = job_from_spec(&spec);
        let id = job.id;
        jobs.insert(id, job);
        Ok(EnqueueResult::Created(id))
    }

    async fn next_jobs(&self, limit: i64, job_types: Option<&[String]>) -> Result<Vec<Job>> {
        let now = Utc::now();
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());

        let mut ready: Vec<Job> = jobs
            .values()
            .filter(|j| j.is_ready(now))
            .filter(|j| {
                job_types
                    .map(|types| types.iter().any(|t| *t == j.job_type))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        ready.truncate(limit.max(0) as usize);
        Ok(ready)
    }

    async fn claim(&self, job_id: JobId, worker_id: &str) -> Result<bool> {
        {
            let mut denied = self.denied_claims.write().unwrap_or_else(|e| e.into_inner());
            if denied.remove(&job_id) {
                return Ok(false);
            }
        }

        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Processing;
                job.started_at = Some(Utc::now());
                job.worker_id = Some(worker_id.to_string());
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, job_id: JobId, reason: &str) -> Result<bool> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.status = JobStatus::Pending;
                job.started_at = None;
                job.worker_id = None;
                job.error_message = Some(reason.to_string());
                job.scheduled_at = Utc::now();
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_completed(&self, job_id: JobId) -> Result<bool> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.status = JobStatus::Completed;
                job.completed_at = Some(Utc::now());
                job.error_message = None;
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed(&self, job_id: JobId, error: &str) -> Result<JobOutcome> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Processing => {
                let backoff_secs = 2_i64.saturating_pow(job.attempts.max(0) as u32).min(3600);
                job.attempts += 1;
                job.error_message = Some(error.to_string());
                job.updated_at = Utc::now();

                if job.attempts >= job.max_attempts {
                    job.status = JobStatus::Failed;
                    job.completed_at = Some(Utc::now());
                    Ok(JobOutcome::Exhausted {
                        attempts: job.attempts,
                    })
                } else {
                    job.status = JobStatus::Pending;
                    job.started_at = None;
                    job.worker_id = None;
                    job.scheduled_at = Utc::now() + chrono::Duration::seconds(backoff_secs);
                    Ok(JobOutcome::WillRetry {
                        attempts: job.attempts,
                    })
                }
            }
            _ => Ok(JobOutcome::NotProcessing),
        }
    }

    async fn mark_timed_out(&self, job_id: JobId, timeout_ms: u64) -> Result<JobOutcome> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.attempts += 1;
                job.error_message = Some(format!("Job processing timed out after {timeout_ms}ms"));
                job.updated_at = Utc::now();

                if job.attempts >= job.max_attempts {
                    job.status = JobStatus::Failed;
                    job.completed_at = Some(Utc::now());
                    Ok(JobOutcome::Exhausted {
                        attempts: job.attempts,
                    })
                } else {
                    // Stays claimed: stalled recovery is the road back.
                    Ok(JobOutcome::WillRetry {
                        attempts: job.attempts,
                    })
                }
            }
            _ => Ok(JobOutcome::NotProcessing),
        }
    }

    async fn find_by_id(&self, job_id: JobId) -> Result<Option<Job>> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        Ok(jobs.get(&job_id).cloned())
    }

    async fn release_stalled(&self, cutoff: DateTime<Utc>, reason: &str) -> Result<Vec<Job>> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let mut released = Vec::new();

        for job in jobs.values_mut() {
            if job.is_stalled(cutoff) {
                job.status = JobStatus::Pending;
                job.started_at = None;
                job.worker_id = None;
                job.error_message = Some(reason.to_string());
                job.scheduled_at = Utc::now();
                job.updated_at = Utc::now();
                released.push(job.clone());
            }
        }

        Ok(released)
    }
}

/// Processor double that records every job it is handed and succeeds.
pub struct RecordingProcessor {
    processed: RwLock<Vec<Job>>,
}

impl Default for RecordingProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingProcessor {
    pub fn new() -> Self {
        Self {
            processed: RwLock::new(Vec::new()),
        }
    }

    pub fn processed(&self) -> Vec<Job> {
        self.processed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn processed_count(&self) -> usize {
        self.processed.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn was_processed(&self, job_id: JobId) -> bool {
        self.processed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|j| j.id == job_id)
    }
}

#[async_trait]
impl JobProcessor for RecordingProcessor {
    async fn process(&self, job: &Job) -> Result<()> {
        self.processed
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(job.clone());
        Ok(())
    }
}

enum FailureMode {
    /// Every call fails
    Always,
    /// Calls for this job type fail, others succeed
    JobType(String),
    /// The first n calls fail, later ones succeed
    FirstN(u32),
    /// Calls never return (for timeout scenarios)
    Hang,
}

/// Processor double with configurable failure behavior.
pub struct FlakyProcessor {
    mode: FailureMode,
    error: String,
    calls: AtomicU32,
    exhausted: RwLock<Vec<JobId>>,
}

impl FlakyProcessor {
    pub fn always_fail(error: &str) -> Self {
        Self::with_mode(FailureMode::Always, error)
    }

    pub fn fail_type(job_type: &str) -> Self {
        Self::with_mode(FailureMode::JobType(job_type.to_string()), "simulated failure")
    }

    pub fn fail_first(n: u32, error: &str) -> Self {
        Self::with_mode(FailureMode::FirstN(n), error)
    }

    pub fn hang() -> Self {
        Self::with_mode(FailureMode::Hang, "hung")
    }

    fn with_mode(mode: FailureMode, error: &str) -> Self {
        Self {
            mode,
            error: error.to_string(),
            calls: AtomicU32::new(0),
            exhausted: RwLock::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn exhausted_count(&self) -> usize {
        self.exhausted.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn exhausted_jobs(&self) -> Vec<JobId> {
        self.exhausted
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl JobProcessor for FlakyProcessor {
    async fn process(&self, job: &Job) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);

        match &self.mode {
            FailureMode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            FailureMode::Always => bail!("{}", self.error),
            FailureMode::JobType(job_type) if job.job_type == *job_type => {
                bail!("{}", self.error)
            }
            FailureMode::JobType(_) => Ok(()),
            FailureMode::FirstN(n) if call < *n => bail!("{}", self.error),
            FailureMode::FirstN(_) => Ok(()),
        }
    }

    async fn on_exhausted(&self, job: &Job, _error: &str) -> Result<()> {
        self.exhausted
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(job.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SourceId;
    use crate::kernel::jobs::job::JobPriority;

    fn spec(job_type: &str) -> JobSpec {
        JobSpec::builder()
            .job_type(job_type)
            .source_id(SourceId::new())
            .build()
    }

    #[tokio::test]
    async fn claim_is_single_winner() {
        let queue = InMemoryJobQueue::new();
        let job_id = queue.enqueue(spec("crawl_page")).await.unwrap().job_id();

        assert!(queue.claim(job_id, "worker-a").await.unwrap());
        assert!(!queue.claim(job_id, "worker-b").await.unwrap());

        let job = queue.find_by_id(job_id).await.unwrap().unwrap();
        assert_eq!(job.worker_id.as_deref(), Some("worker-a"));
    }

    #[tokio::test]
    async fn enqueue_deduplicates_on_active_key() {
        let queue = InMemoryJobQueue::new();
        let spec_with_key = || {
            JobSpec::builder()
                .job_type("crawl_page")
                .source_id(SourceId::new())
                .job_key("crawl:abc")
                .build()
        };

        let first = queue.enqueue(spec_with_key()).await.unwrap();
        assert!(first.is_created());

        let second = queue.enqueue(spec_with_key()).await.unwrap();
        assert!(!second.is_created());
        assert_eq!(second.job_id(), first.job_id());

        // A terminal job no longer holds the key.
        queue.claim(first.job_id(), "worker-a").await.unwrap();
        queue.mark_completed(first.job_id()).await.unwrap();

        let third = queue.enqueue(spec_with_key()).await.unwrap();
        assert!(third.is_created());
    }

    #[tokio::test]
    async fn next_jobs_orders_by_priority_then_age() {
        let queue = InMemoryJobQueue::new();
        let normal = queue.enqueue(spec("a")).await.unwrap().job_id();
        let high = queue
            .enqueue(
                JobSpec::builder()
                    .job_type("b")
                    .source_id(SourceId::new())
                    .priority(JobPriority::High)
                    .build(),
            )
            .await
            .unwrap()
            .job_id();

        let ready = queue.next_jobs(10, None).await.unwrap();
        assert_eq!(ready[0].id, high);
        assert_eq!(ready[1].id, normal);
    }

    #[tokio::test]
    async fn failure_backoff_hides_job_until_due() {
        let queue = InMemoryJobQueue::new();
        let job_id = queue.enqueue(spec("crawl_page")).await.unwrap().job_id();

        queue.claim(job_id, "worker-a").await.unwrap();
        let outcome = queue.mark_failed(job_id, "boom").await.unwrap();
        assert_eq!(outcome, JobOutcome::WillRetry { attempts: 1 });

        // Backoff pushed scheduled_at into the future.
        assert!(queue.next_jobs(10, None).await.unwrap().is_empty());

        queue.make_due(job_id);
        assert_eq!(queue.next_jobs(10, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stalled_release_returns_only_old_claims() {
        let queue = InMemoryJobQueue::new();
        let stalled = queue.enqueue(spec("a")).await.unwrap().job_id();
        let healthy = queue.enqueue(spec("b")).await.unwrap().job_id();

        queue.claim(stalled, "worker-a").await.unwrap();
        queue.claim(healthy, "worker-a").await.unwrap();
        queue.backdate_started_at(stalled, Utc::now() - chrono::Duration::minutes(10));

        let cutoff = Utc::now() - chrono::Duration::minutes(5);
        let released = queue.release_stalled(cutoff, "stalled").await.unwrap();

        assert_eq!(released.len(), 1);
        assert_eq!(released[0].id, stalled);
        assert_eq!(
            queue.find_by_id(healthy).await.unwrap().unwrap().status,
            JobStatus::Processing
        );
    }

    #[tokio::test]
    async fn flaky_processor_fails_then_recovers() {
        let processor = FlakyProcessor::fail_first(2, "transient");
        let job = Job::immediate("crawl_page", SourceId::new());

        assert!(processor.process(&job).await.is_err());
        assert!(processor.process(&job).await.is_err());
        assert!(processor.process(&job).await.is_ok());
        assert_eq!(processor.call_count(), 3);
    }
}
