//! Pipeline health aggregation.
//!
//! The monitor reads queue depth, trailing-hour outcomes, and the repair
//! backlog from the store, folds them into one [`SystemHealth`] snapshot,
//! and grades it. A critical grade forces a recovery and synchronization
//! pass on the spot instead of waiting for their scheduled slots.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::{debug, error, warn};

use super::breaker::{BreakerSnapshot, CircuitBreakerRegistry};
use super::jobs::job::{Job, JobStatus, JobStatusCount};
use super::jobs::recovery::{JobRecoveryService, ORPHANED_TIMEOUT, STALLED_TIMEOUT};
use super::jobs::sync::SynchronizationService;
use crate::domains::sources::models::Page;

const CRITICAL_STALLED_JOBS: i64 = 10;
const CRITICAL_ORPHANED_PAGES: i64 = 20;
const CRITICAL_OLDEST_PENDING_SECONDS: f64 = 30.0 * 60.0;
const CRITICAL_SUCCESS_RATE: f64 = 0.5;

const WARNING_OLDEST_PENDING_SECONDS: f64 = 10.0 * 60.0;
const WARNING_SUCCESS_RATE: f64 = 0.8;
const WARNING_BACKLOG: i64 = 50;

/// Overall grade of one health snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Queue depth and wait times.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueHealth {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_pending_age_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_pending_wait_seconds: Option<f64>,
}

/// Trailing-hour processing outcomes.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingHealth {
    pub completed_last_hour: i64,
    pub failed_last_hour: i64,
    /// Completed / (completed + failed) over the window; 1.0 when idle.
    pub success_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_processing_ms: Option<f64>,
    pub active_workers: i64,
}

/// Work the repair services would pick up right now.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairHealth {
    pub stalled_jobs: i64,
    pub orphaned_pages: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_recovery_run: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synchronization_run: Option<DateTime<Utc>>,
}

/// One full health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub queue: QueueHealth,
    pub processing: ProcessingHealth,
    pub repair: RepairHealth,
    pub breakers: Vec<BreakerSnapshot>,
    pub checked_at: DateTime<Utc>,
}

/// Grade one snapshot.
///
/// Critical: more than 10 stalled jobs, more than 20 orphaned pages, a
/// pending job older than 30 minutes, or a success rate under 50%.
/// Warning: any stalled or orphaned work at all, a pending job older than
/// 10 minutes, a success rate under 80%, or more than 50 pending jobs.
fn evaluate(queue: &QueueHealth, processing: &ProcessingHealth, repair: &RepairHealth) -> HealthStatus {
    let oldest_pending = queue.oldest_pending_age_seconds.unwrap_or(0.0);

    if repair.stalled_jobs > CRITICAL_STALLED_JOBS
        || repair.orphaned_pages > CRITICAL_ORPHANED_PAGES
        || oldest_pending > CRITICAL_OLDEST_PENDING_SECONDS
        || processing.success_rate < CRITICAL_SUCCESS_RATE
    {
        return HealthStatus::Critical;
    }

    if repair.stalled_jobs > 0
        || repair.orphaned_pages > 0
        || oldest_pending > WARNING_OLDEST_PENDING_SECONDS
        || processing.success_rate < WARNING_SUCCESS_RATE
        || queue.pending > WARNING_BACKLOG
    {
        return HealthStatus::Warning;
    }

    HealthStatus::Healthy
}

fn status_count(counts: &[JobStatusCount], status: JobStatus) -> i64 {
    counts
        .iter()
        .find(|c| c.status == status)
        .map(|c| c.count)
        .unwrap_or(0)
}

/// Aggregates pipeline health and forces repairs when it turns critical.
pub struct HealthMonitor {
    pool: PgPool,
    breakers: Arc<CircuitBreakerRegistry>,
    recovery: Arc<JobRecoveryService>,
    sync: Arc<SynchronizationService>,
}

impl HealthMonitor {
    pub fn new(
        pool: PgPool,
        breakers: Arc<CircuitBreakerRegistry>,
        recovery: Arc<JobRecoveryService>,
        sync: Arc<SynchronizationService>,
    ) -> Self {
        Self {
            pool,
            breakers,
            recovery,
            sync,
        }
    }

    /// Read the store and grade the pipeline.
    pub async fn check(&self) -> Result<SystemHealth> {
        let counts = Job::count_by_status(&self.pool).await?;
        let queue = QueueHealth {
            pending: status_count(&counts, JobStatus::Pending),
            processing: status_count(&counts, JobStatus::Processing),
            completed: status_count(&counts, JobStatus::Completed),
            failed: status_count(&counts, JobStatus::Failed),
            oldest_pending_age_seconds: Job::oldest_pending_age_seconds(&self.pool).await?,
            average_pending_wait_seconds: Job::average_pending_wait_seconds(&self.pool).await?,
        };

        let window = Job::processing_stats(&self.pool).await?;
        let processing = ProcessingHealth {
            completed_last_hour: window.completed,
            failed_last_hour: window.failed,
            success_rate: window.success_rate(),
            avg_processing_ms: window.avg_processing_ms,
            active_workers: Job::active_worker_count(&self.pool).await?,
        };

        let stalled_cutoff = Utc::now() - chrono::Duration::seconds(STALLED_TIMEOUT.as_secs() as i64);
        let orphan_cutoff = Utc::now() - chrono::Duration::seconds(ORPHANED_TIMEOUT.as_secs() as i64);
        let repair = RepairHealth {
            stalled_jobs: Job::count_stalled(stalled_cutoff, &self.pool).await?,
            orphaned_pages: Page::count_orphaned(orphan_cutoff, &self.pool).await?,
            last_recovery_run: self.recovery.last_run(),
            last_synchronization_run: self.sync.last_run(),
        };

        let status = evaluate(&queue, &processing, &repair);

        Ok(SystemHealth {
            status,
            queue,
            processing,
            repair,
            breakers: self.breakers.snapshot(),
            checked_at: Utc::now(),
        })
    }

    /// Scheduled entry point: check, log the grade, and on a critical grade
    /// run recovery and synchronization immediately. Repair failures are
    /// logged rather than propagated so the snapshot still comes back.
    pub async fn check_and_repair(&self) -> Result<SystemHealth> {
        let health = self.check().await?;

        match health.status {
            HealthStatus::Healthy => {
                debug!(
                    pending = health.queue.pending,
                    processing = health.queue.processing,
                    "pipeline healthy"
                );
            }
            HealthStatus::Warning => {
                warn!(
                    pending = health.queue.pending,
                    stalled = health.repair.stalled_jobs,
                    orphaned = health.repair.orphaned_pages,
                    success_rate = health.processing.success_rate,
                    "pipeline health degraded"
                );
            }
            HealthStatus::Critical => {
                error!(
                    pending = health.queue.pending,
                    stalled = health.repair.stalled_jobs,
                    orphaned = health.repair.orphaned_pages,
                    success_rate = health.processing.success_rate,
                    "pipeline health critical, forcing repair"
                );
                if let Err(e) = self.recovery.run_recovery().await {
                    error!(error = %e, "forced recovery failed");
                }
                if let Err(e) = self.sync.force_synchronization().await {
                    error!(error = %e, "forced synchronization failed");
                }
            }
        }

        Ok(health)
    }
}
