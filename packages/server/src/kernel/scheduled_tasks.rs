//! Scheduled background tasks using tokio-cron-scheduler.
//!
//! This module provides the periodic safety nets around the job queue:
//! - Health check every 30 seconds (forces repairs when critical)
//! - Stalled-job and orphaned-page recovery every 5 minutes
//! - Store synchronization every 2 minutes
//!
//! # Architecture
//!
//! Scheduled tasks run independently of the job runner. They release and
//! requeue work rather than doing it; the runner picks the jobs up on its
//! next pass.
//!
//! ```text
//! Scheduler
//!     ├─► every 30s  ─► HealthMonitor::check_and_repair
//!     ├─► every 5min ─► JobRecoveryService::run_recovery
//!     └─► every 2min ─► SynchronizationService::run_synchronization
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::kernel::health::HealthMonitor;
use crate::kernel::jobs::recovery::JobRecoveryService;
use crate::kernel::jobs::sync::SynchronizationService;

/// Start all scheduled tasks
pub async fn start_scheduler(
    health: Arc<HealthMonitor>,
    recovery: Arc<JobRecoveryService>,
    sync: Arc<SynchronizationService>,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    // Health check - every 30 seconds
    let health_job = Job::new_async("*/30 * * * * *", move |_uuid, _lock| {
        let health = health.clone();
        Box::pin(async move {
            if let Err(e) = health.check_and_repair().await {
                tracing::error!("Health check task failed: {}", e);
            }
        })
    })?;
    scheduler.add(health_job).await?;

    // Stalled-job and orphaned-page recovery - every 5 minutes
    let recovery_job = Job::new_async("0 */5 * * * *", move |_uuid, _lock| {
        let recovery = recovery.clone();
        Box::pin(async move {
            match recovery.run_recovery().await {
                Ok(report) if report.recovered_jobs > 0 || report.orphaned_jobs > 0 => {
                    tracing::info!(
                        "Recovery pass released {} stalled jobs and requeued {} orphaned pages",
                        report.recovered_jobs,
                        report.orphaned_jobs
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!("Recovery task failed: {}", e),
            }
        })
    })?;
    scheduler.add(recovery_job).await?;

    // Store synchronization - every 2 minutes
    let sync_job = Job::new_async("0 */2 * * * *", move |_uuid, _lock| {
        let sync = sync.clone();
        Box::pin(async move {
            if let Err(e) = sync.run_synchronization().await {
                tracing::error!("Synchronization task failed: {}", e);
            }
        })
    })?;
    scheduler.add(sync_job).await?;

    scheduler.start().await?;

    tracing::info!(
        "Scheduled tasks started (health every 30s, recovery every 5min, synchronization every 2min)"
    );
    Ok(scheduler)
}
