//! Job model for background pipeline execution.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;

use crate::common::{JobId, PageId, SourceId};

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Whether this status is final (no further transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Priority bands for pipeline jobs. Stored as an integer column where a
/// higher value is more urgent, so claim scans can `ORDER BY priority DESC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    Medium,
    High,
    Critical,
}

impl JobPriority {
    /// Convert to integer for DB ordering (higher = more urgent)
    pub fn as_i32(&self) -> i32 {
        match self {
            JobPriority::Low => 0,
            JobPriority::Normal => 10,
            JobPriority::Medium => 20,
            JobPriority::High => 30,
            JobPriority::Critical => 40,
        }
    }
}

// ============================================================================
// Job Model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = JobId::new())]
    pub id: JobId,

    // Core identity
    pub job_type: String,
    pub source_id: SourceId,
    #[builder(default, setter(strip_option))]
    pub page_id: Option<PageId>,

    // Idempotency: at most one pending/processing job per key
    #[builder(default, setter(strip_option))]
    pub job_key: Option<String>,

    // Payload
    #[builder(default = serde_json::json!({}))]
    pub payload: serde_json::Value,

    // State
    #[builder(default)]
    pub status: JobStatus,
    #[builder(default = JobPriority::Normal.as_i32())]
    pub priority: i32,

    // Retry accounting
    #[builder(default = 0)]
    pub attempts: i32,
    #[builder(default = 3)]
    pub max_attempts: i32,

    // Timing
    #[builder(default = Utc::now())]
    pub scheduled_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,

    // Claim bookkeeping
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,

    // Timestamps
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create an immediate job for a source (convenience constructor)
    pub fn immediate(job_type: &str, source_id: SourceId) -> Self {
        Self::builder()
            .job_type(job_type.to_string())
            .source_id(source_id)
            .build()
    }

    /// Check if the job is ready to be claimed
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at <= now
    }

    /// Check if the job has been processing since before `cutoff`
    pub fn is_stalled(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing
            && self.started_at.map(|t| t < cutoff).unwrap_or(false)
    }
}

// =============================================================================
// SQL Queries
// =============================================================================

impl Job {
    /// Insert a new job row
    pub async fn insert(&self, pool: &PgPool) -> Result<Self> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO jobs (
                id, job_type, source_id, page_id, job_key, payload, status,
                priority, attempts, max_attempts, scheduled_at, started_at,
                completed_at, error_message, worker_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING *
            "#,
        )
        .bind(self.id)
        .bind(&self.job_type)
        .bind(self.source_id)
        .bind(self.page_id)
        .bind(&self.job_key)
        .bind(&self.payload)
        .bind(self.status)
        .bind(self.priority)
        .bind(self.attempts)
        .bind(self.max_attempts)
        .bind(self.scheduled_at)
        .bind(self.started_at)
        .bind(self.completed_at)
        .bind(&self.error_message)
        .bind(&self.worker_id)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(pool)
        .await?;
        Ok(job)
    }

    /// Find job by ID
    pub async fn find_by_id(id: JobId, pool: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(job)
    }

    /// Find the active (pending or processing) job holding an idempotency key
    pub async fn find_active_by_key(job_key: &str, pool: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM jobs
            WHERE job_key = $1 AND status IN ('pending', 'processing')
            LIMIT 1
            "#,
        )
        .bind(job_key)
        .fetch_optional(pool)
        .await?;
        Ok(job)
    }

    /// Read-only scan of claimable jobs: pending, due, most urgent first,
    /// oldest first within a priority band. Never returns jobs scheduled in
    /// the future.
    pub async fn next_jobs(
        limit: i64,
        job_types: Option<&[String]>,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM jobs
            WHERE status = 'pending'
              AND scheduled_at <= NOW()
              AND ($2::text[] IS NULL OR job_type = ANY($2))
            ORDER BY priority DESC, created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .bind(job_types)
        .fetch_all(pool)
        .await?;
        Ok(jobs)
    }

    /// Claim a job with a single conditional update. Returns false when the
    /// job was already claimed, completed, or deleted; the store row is the
    /// only arbiter, so two workers can never both see true.
    pub async fn claim(id: JobId, worker_id: &str, pool: &PgPool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'processing', started_at = NOW(), worker_id = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Return a processing job to pending, recording why. Does not count as
    /// a failure: attempts are left untouched.
    pub async fn release(id: JobId, reason: &str, pool: &PgPool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', started_at = NULL, worker_id = NULL,
                error_message = $2, scheduled_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Mark a processing job as completed
    pub async fn mark_completed(id: JobId, pool: &PgPool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', completed_at = NOW(), error_message = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Record a handler failure. Increments attempts; while attempts remain
    /// the job goes back to pending with exponential backoff (2^n seconds,
    /// capped at one hour), otherwise it is failed for good. Returns the
    /// updated row, or None if the job was not processing.
    pub async fn record_failure(id: JobId, error: &str, pool: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            UPDATE jobs
            SET attempts = attempts + 1,
                error_message = $2,
                status = CASE WHEN attempts + 1 >= max_attempts
                    THEN 'failed'::job_status ELSE 'pending'::job_status END,
                completed_at = CASE WHEN attempts + 1 >= max_attempts
                    THEN NOW() ELSE NULL END,
                started_at = CASE WHEN attempts + 1 >= max_attempts
                    THEN started_at ELSE NULL END,
                worker_id = CASE WHEN attempts + 1 >= max_attempts
                    THEN worker_id ELSE NULL END,
                scheduled_at = CASE WHEN attempts + 1 >= max_attempts
                    THEN scheduled_at
                    ELSE NOW() + make_interval(secs => LEAST(POWER(2, attempts), 3600)) END,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(error)
        .fetch_optional(pool)
        .await?;
        Ok(job)
    }

    /// Record a processing timeout. Increments attempts and stores the
    /// error, but while attempts remain the row stays claimed: the callback
    /// may still be running, and stalled-job recovery is the only path back
    /// to pending after a timeout. Exhausted attempts fail the job outright.
    pub async fn record_timeout(id: JobId, error: &str, pool: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            UPDATE jobs
            SET attempts = attempts + 1,
                error_message = $2,
                status = CASE WHEN attempts + 1 >= max_attempts
                    THEN 'failed'::job_status ELSE status END,
                completed_at = CASE WHEN attempts + 1 >= max_attempts
                    THEN NOW() ELSE completed_at END,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(error)
        .fetch_optional(pool)
        .await?;
        Ok(job)
    }

    /// Release every job that has been processing since before `cutoff`.
    /// One atomic sweep; returns the released rows.
    pub async fn release_stalled(
        cutoff: DateTime<Utc>,
        reason: &str,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(
            r#"
            UPDATE jobs
            SET status = 'pending', started_at = NULL, worker_id = NULL,
                error_message = $2, scheduled_at = NOW(), updated_at = NOW()
            WHERE status = 'processing' AND started_at IS NOT NULL AND started_at < $1
            RETURNING *
            "#,
        )
        .bind(cutoff)
        .bind(reason)
        .fetch_all(pool)
        .await?;
        Ok(jobs)
    }

    /// Count jobs that have been processing since before `cutoff`
    pub async fn count_stalled(cutoff: DateTime<Utc>, pool: &PgPool) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE status = 'processing' AND started_at IS NOT NULL AND started_at < $1
            "#,
        )
        .bind(cutoff)
        .fetch_one(pool)
        .await?;
        Ok(count)
    }

    /// Job counts grouped by status
    pub async fn count_by_status(pool: &PgPool) -> Result<Vec<JobStatusCount>> {
        let counts = sqlx::query_as::<_, JobStatusCount>(
            "SELECT status, COUNT(*) AS count FROM jobs GROUP BY status",
        )
        .fetch_all(pool)
        .await?;
        Ok(counts)
    }

    /// Age of the oldest pending job, in seconds
    pub async fn oldest_pending_age_seconds(pool: &PgPool) -> Result<Option<f64>> {
        let age = sqlx::query_scalar::<_, Option<f64>>(
            r#"
            SELECT EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::float8
            FROM jobs WHERE status = 'pending'
            "#,
        )
        .fetch_one(pool)
        .await?;
        Ok(age)
    }

    /// Average wait of pending jobs, in seconds
    pub async fn average_pending_wait_seconds(pool: &PgPool) -> Result<Option<f64>> {
        let avg = sqlx::query_scalar::<_, Option<f64>>(
            r#"
            SELECT AVG(EXTRACT(EPOCH FROM (NOW() - created_at)))::float8
            FROM jobs WHERE status = 'pending'
            "#,
        )
        .fetch_one(pool)
        .await?;
        Ok(avg)
    }

    /// Outcome counts and average processing time over the trailing hour
    pub async fn processing_stats(pool: &PgPool) -> Result<ProcessingWindow> {
        let window = sqlx::query_as::<_, ProcessingWindow>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                AVG(EXTRACT(EPOCH FROM (completed_at - started_at)) * 1000)
                    FILTER (WHERE status = 'completed' AND started_at IS NOT NULL)::float8
                    AS avg_processing_ms
            FROM jobs
            WHERE completed_at > NOW() - INTERVAL '1 hour'
            "#,
        )
        .fetch_one(pool)
        .await?;
        Ok(window)
    }

    /// Distinct workers currently holding processing jobs
    pub async fn active_worker_count(pool: &PgPool) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(DISTINCT worker_id) FROM jobs WHERE status = 'processing'",
        )
        .fetch_one(pool)
        .await?;
        Ok(count)
    }

    /// Delete all jobs belonging to a source (used by hard deletion)
    pub async fn delete_for_source(source_id: SourceId, pool: &PgPool) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM jobs WHERE source_id = $1")
            .bind(source_id)
            .execute(pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }
}

/// One row of `count_by_status`
#[derive(FromRow, Debug, Clone)]
pub struct JobStatusCount {
    pub status: JobStatus,
    pub count: i64,
}

/// Trailing-hour outcome aggregates
#[derive(FromRow, Debug, Clone, Default)]
pub struct ProcessingWindow {
    pub completed: i64,
    pub failed: i64,
    pub avg_processing_ms: Option<f64>,
}

impl ProcessingWindow {
    /// Completed / (completed + failed); 1.0 when the window is empty
    pub fn success_rate(&self) -> f64 {
        let total = self.completed + self.failed;
        if total == 0 {
            1.0
        } else {
            self.completed as f64 / total as f64
        }
    }
}
