//! Integration tests for the self-healing layer: stalled-job recovery,
//! orphaned-page requeues, periodic synchronization, and the health
//! monitor's forced repairs.

mod common;

use std::sync::Arc;

use crate::common::{
    backdate_job_claim, backdate_page, create_test_source, jobs_for_source,
    jobs_of_type_for_source, page_in_status, source_in_status, TestHarness, STORE_SCAN_LOCK,
};
use ingest_core::domains::sources::status::WorkflowStatus;
use ingest_core::kernel::jobs::{
    JobPriority, JobQueue, JobRecoveryService, JobSpec, JobStatus, SynchronizationService,
    STALLED_RECOVERY_REASON,
};
use ingest_core::kernel::{CircuitBreakerRegistry, HealthMonitor, HealthStatus};
use test_context::test_context;
use uuid::Uuid;

// =============================================================================
// Test Helpers
// =============================================================================

fn recovery_service(ctx: &TestHarness, queue: Arc<dyn JobQueue>) -> JobRecoveryService {
    JobRecoveryService::new(ctx.db_pool.clone(), queue)
}

fn sync_service(ctx: &TestHarness, queue: Arc<dyn JobQueue>) -> SynchronizationService {
    SynchronizationService::new(ctx.db_pool.clone(), queue)
}

fn unique_job_type(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

// =============================================================================
// Stalled jobs
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn stalled_jobs_are_released_with_the_recovery_reason(ctx: &TestHarness) {
    let _scan = STORE_SCAN_LOCK.lock().await;
    let handles = ctx.pipeline();
    let recovery = recovery_service(ctx, handles.queue.clone());
    let source = create_test_source(&ctx.db_pool, "stalled recovery")
        .await
        .expect("Failed to create source");
    let job_type = unique_job_type("stall");

    let stalled_id = handles
        .queue
        .enqueue(
            JobSpec::builder()
                .job_type(job_type.clone())
                .source_id(source.id)
                .build(),
        )
        .await
        .expect("Failed to enqueue")
        .job_id();
    let fresh_id = handles
        .queue
        .enqueue(
            JobSpec::builder()
                .job_type(job_type)
                .source_id(source.id)
                .build(),
        )
        .await
        .expect("Failed to enqueue")
        .job_id();
    assert!(handles
        .queue
        .claim(stalled_id, "worker-dead")
        .await
        .expect("claim failed"));
    assert!(handles
        .queue
        .claim(fresh_id, "worker-live")
        .await
        .expect("claim failed"));
    backdate_job_claim(&ctx.db_pool, stalled_id, 6)
        .await
        .expect("Failed to backdate claim");

    let report = recovery.run_recovery().await.expect("Recovery failed");
    assert!(report.recovered_jobs >= 1);
    assert!(recovery.last_run().is_some());

    let jobs = jobs_for_source(&ctx.db_pool, source.id)
        .await
        .expect("Failed to load jobs");
    let stalled = jobs.iter().find(|job| job.id == stalled_id).unwrap();
    assert_eq!(stalled.status, JobStatus::Pending);
    assert_eq!(stalled.attempts, 0);
    assert!(stalled.worker_id.is_none());
    assert_eq!(
        stalled.error_message.as_deref(),
        Some(STALLED_RECOVERY_REASON)
    );

    let fresh = jobs.iter().find(|job| job.id == fresh_id).unwrap();
    assert_eq!(fresh.status, JobStatus::Processing);
    assert_eq!(fresh.worker_id.as_deref(), Some("worker-live"));
}

// =============================================================================
// Orphaned pages
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn orphaned_pages_get_their_stage_jobs_back(ctx: &TestHarness) {
    let _scan = STORE_SCAN_LOCK.lock().await;
    let handles = ctx.pipeline();
    let recovery = recovery_service(ctx, handles.queue.clone());

    // A created page under a crawling source and a completed page under a
    // training source, both stuck long past the orphan cutoff
    let crawl_source = source_in_status(&ctx.db_pool, "Orphan crawl", WorkflowStatus::Crawling)
        .await
        .expect("Failed to create source");
    let crawl_page = page_in_status(
        &ctx.db_pool,
        crawl_source.id,
        "https://orphans.example.org/uncrawled",
        WorkflowStatus::Created,
    )
    .await
    .expect("Failed to create page");
    backdate_page(&ctx.db_pool, crawl_page.id, 31)
        .await
        .expect("Failed to backdate page");

    let train_source = source_in_status(&ctx.db_pool, "Orphan train", WorkflowStatus::Training)
        .await
        .expect("Failed to create source");
    let train_page = page_in_status(
        &ctx.db_pool,
        train_source.id,
        "https://orphans.example.org/untrained",
        WorkflowStatus::Completed,
    )
    .await
    .expect("Failed to create page");
    backdate_page(&ctx.db_pool, train_page.id, 31)
        .await
        .expect("Failed to backdate page");

    let report = recovery.run_recovery().await.expect("Recovery failed");
    assert!(report.orphaned_jobs >= 2);

    let crawl_jobs = jobs_of_type_for_source(&ctx.db_pool, crawl_source.id, "crawl_page")
        .await
        .expect("Failed to load jobs");
    assert_eq!(crawl_jobs.len(), 1);
    assert_eq!(crawl_jobs[0].status, JobStatus::Pending);
    assert_eq!(crawl_jobs[0].page_id, Some(crawl_page.id));
    assert_eq!(crawl_jobs[0].payload["origin"], "recovery");
    assert_eq!(crawl_jobs[0].priority, JobPriority::High.as_i32());

    let train_jobs = jobs_of_type_for_source(&ctx.db_pool, train_source.id, "train_page")
        .await
        .expect("Failed to load jobs");
    assert_eq!(train_jobs.len(), 1);
    assert_eq!(train_jobs[0].page_id, Some(train_page.id));
    assert_eq!(train_jobs[0].payload["origin"], "recovery");
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn young_stranded_pages_wait_for_synchronization(ctx: &TestHarness) {
    let _scan = STORE_SCAN_LOCK.lock().await;
    let handles = ctx.pipeline();
    let recovery = recovery_service(ctx, handles.queue.clone());
    let sync = sync_service(ctx, handles.queue.clone());

    let source = source_in_status(&ctx.db_pool, "Young orphan", WorkflowStatus::Crawling)
        .await
        .expect("Failed to create source");
    let page = page_in_status(
        &ctx.db_pool,
        source.id,
        "https://young.example.org/page",
        WorkflowStatus::Created,
    )
    .await
    .expect("Failed to create page");
    backdate_page(&ctx.db_pool, page.id, 10)
        .await
        .expect("Failed to backdate page");

    // Ten minutes is under the orphan cutoff, so recovery leaves it alone
    recovery.run_recovery().await.expect("Recovery failed");
    let jobs = jobs_of_type_for_source(&ctx.db_pool, source.id, "crawl_page")
        .await
        .expect("Failed to load jobs");
    assert!(jobs.is_empty());

    // Synchronization has no age requirement and requeues it right away
    sync.run_synchronization().await.expect("Sync failed");
    let jobs = jobs_of_type_for_source(&ctx.db_pool, source.id, "crawl_page")
        .await
        .expect("Failed to load jobs");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].payload["origin"], "sync");
    assert_eq!(jobs[0].priority, JobPriority::Medium.as_i32());
    assert!(sync.last_run().is_some());
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn a_terminal_job_blocks_the_orphan_scan_but_not_synchronization(ctx: &TestHarness) {
    let _scan = STORE_SCAN_LOCK.lock().await;
    let handles = ctx.pipeline();
    let recovery = recovery_service(ctx, handles.queue.clone());
    let sync = sync_service(ctx, handles.queue.clone());

    let source = source_in_status(&ctx.db_pool, "Dead job", WorkflowStatus::Crawling)
        .await
        .expect("Failed to create source");
    let page = page_in_status(
        &ctx.db_pool,
        source.id,
        "https://deadjob.example.org/page",
        WorkflowStatus::Created,
    )
    .await
    .expect("Failed to create page");
    backdate_page(&ctx.db_pool, page.id, 31)
        .await
        .expect("Failed to backdate page");

    // Exhaust a crawl job for the page so a terminal row exists
    let failed_id = handles
        .queue
        .enqueue(
            JobSpec::builder()
                .job_type("crawl_page")
                .source_id(source.id)
                .page_id(page.id)
                .max_attempts(1)
                .build(),
        )
        .await
        .expect("Failed to enqueue")
        .job_id();
    assert!(handles
        .queue
        .claim(failed_id, "worker-a")
        .await
        .expect("claim failed"));
    assert!(handles
        .queue
        .mark_failed(failed_id, "gave up")
        .await
        .expect("mark_failed failed")
        .is_exhausted());

    // The orphan scan sees the failed row and stays out
    recovery.run_recovery().await.expect("Recovery failed");
    let jobs = jobs_of_type_for_source(&ctx.db_pool, source.id, "crawl_page")
        .await
        .expect("Failed to load jobs");
    assert_eq!(jobs.len(), 1);

    // The sync scan only honors active jobs and queues a fresh attempt
    sync.run_synchronization().await.expect("Sync failed");
    let jobs = jobs_of_type_for_source(&ctx.db_pool, source.id, "crawl_page")
        .await
        .expect("Failed to load jobs");
    assert_eq!(jobs.len(), 2);
    let fresh = jobs.iter().find(|job| job.id != failed_id).unwrap();
    assert_eq!(fresh.status, JobStatus::Pending);
    assert_eq!(fresh.payload["origin"], "sync");
}

// =============================================================================
// Synchronization
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn synchronization_is_idempotent_while_its_jobs_are_active(ctx: &TestHarness) {
    let _scan = STORE_SCAN_LOCK.lock().await;
    let handles = ctx.pipeline();
    let sync = sync_service(ctx, handles.queue.clone());

    let source = source_in_status(&ctx.db_pool, "Sync idempotent", WorkflowStatus::Crawling)
        .await
        .expect("Failed to create source");
    let page = page_in_status(
        &ctx.db_pool,
        source.id,
        "https://idempotent.example.org/page",
        WorkflowStatus::Created,
    )
    .await
    .expect("Failed to create page");

    let first = sync.run_synchronization().await.expect("Sync failed");
    assert!(first.jobs_created >= 1);
    let jobs = jobs_of_type_for_source(&ctx.db_pool, source.id, "crawl_page")
        .await
        .expect("Failed to load jobs");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].page_id, Some(page.id));

    // The first pass swept every stranded page in the store, so a second
    // pass right behind it has nothing to do
    let second = sync.run_synchronization().await.expect("Sync failed");
    assert_eq!(second.jobs_created, 0);
    let jobs = jobs_of_type_for_source(&ctx.db_pool, source.id, "crawl_page")
        .await
        .expect("Failed to load jobs");
    assert_eq!(jobs.len(), 1);
}

// =============================================================================
// Emergency recovery
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn emergency_recovery_requeues_only_the_named_source(ctx: &TestHarness) {
    let _scan = STORE_SCAN_LOCK.lock().await;
    let handles = ctx.pipeline();
    let sync = sync_service(ctx, handles.queue.clone());

    let stuck = source_in_status(&ctx.db_pool, "Stuck", WorkflowStatus::Crawling)
        .await
        .expect("Failed to create source");
    for n in 0..2 {
        page_in_status(
            &ctx.db_pool,
            stuck.id,
            &format!("https://stuck.example.org/page-{n}"),
            WorkflowStatus::Created,
        )
        .await
        .expect("Failed to create page");
    }
    let bystander = source_in_status(&ctx.db_pool, "Bystander", WorkflowStatus::Crawling)
        .await
        .expect("Failed to create source");
    page_in_status(
        &ctx.db_pool,
        bystander.id,
        "https://bystander.example.org/page",
        WorkflowStatus::Created,
    )
    .await
    .expect("Failed to create page");

    let report = sync
        .emergency_recovery(stuck.id)
        .await
        .expect("Emergency recovery failed");
    assert_eq!(report.pages_examined, 2);
    assert_eq!(report.jobs_created, 2);

    let stuck_jobs = jobs_of_type_for_source(&ctx.db_pool, stuck.id, "crawl_page")
        .await
        .expect("Failed to load jobs");
    assert_eq!(stuck_jobs.len(), 2);
    for job in &stuck_jobs {
        assert_eq!(job.payload["origin"], "recovery");
    }

    let bystander_jobs = jobs_for_source(&ctx.db_pool, bystander.id)
        .await
        .expect("Failed to load jobs");
    assert!(bystander_jobs.is_empty());
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn emergency_recovery_restarts_discovery_for_an_empty_crawl(ctx: &TestHarness) {
    let _scan = STORE_SCAN_LOCK.lock().await;
    let handles = ctx.pipeline();
    let sync = sync_service(ctx, handles.queue.clone());

    // Crawling with zero pages means discovery itself was lost
    let empty = source_in_status(&ctx.db_pool, "Lost discovery", WorkflowStatus::Crawling)
        .await
        .expect("Failed to create source");
    let report = sync
        .emergency_recovery(empty.id)
        .await
        .expect("Emergency recovery failed");
    assert_eq!(report.jobs_created, 1);

    let jobs = jobs_of_type_for_source(&ctx.db_pool, empty.id, "crawl_source")
        .await
        .expect("Failed to load jobs");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].payload["origin"], "recovery");

    // A finished source with no pages is not mid-crawl and gets nothing
    let finished = source_in_status(&ctx.db_pool, "Finished", WorkflowStatus::Completed)
        .await
        .expect("Failed to create source");
    let report = sync
        .emergency_recovery(finished.id)
        .await
        .expect("Emergency recovery failed");
    assert_eq!(report.jobs_created, 0);
    let jobs = jobs_for_source(&ctx.db_pool, finished.id)
        .await
        .expect("Failed to load jobs");
    assert!(jobs.is_empty());
}

// =============================================================================
// Health monitor
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn critical_health_forces_a_repair_pass(ctx: &TestHarness) {
    let _scan = STORE_SCAN_LOCK.lock().await;
    let handles = ctx.pipeline();
    let recovery = Arc::new(recovery_service(ctx, handles.queue.clone()));
    let sync = Arc::new(sync_service(ctx, handles.queue.clone()));
    let monitor = HealthMonitor::new(
        ctx.db_pool.clone(),
        Arc::new(CircuitBreakerRegistry::new()),
        recovery.clone(),
        sync,
    );

    // Eleven stalled claims push the stalled count past the critical line
    let source = create_test_source(&ctx.db_pool, "Stalled flood")
        .await
        .expect("Failed to create source");
    let job_type = unique_job_type("flood");
    let mut job_ids = Vec::new();
    for n in 0..11 {
        let id = handles
            .queue
            .enqueue(
                JobSpec::builder()
                    .job_type(job_type.clone())
                    .source_id(source.id)
                    .build(),
            )
            .await
            .expect("Failed to enqueue")
            .job_id();
        assert!(handles
            .queue
            .claim(id, &format!("worker-{n}"))
            .await
            .expect("claim failed"));
        backdate_job_claim(&ctx.db_pool, id, 6)
            .await
            .expect("Failed to backdate claim");
        job_ids.push(id);
    }

    let health = monitor.check().await.expect("Health check failed");
    assert_eq!(health.status, HealthStatus::Critical);
    assert!(health.repair.stalled_jobs >= 11);

    // A critical grade forces recovery, which releases every stalled claim
    monitor
        .check_and_repair()
        .await
        .expect("Repair pass failed");
    assert!(recovery.last_run().is_some());
    for id in &job_ids {
        let job = handles
            .queue
            .find_by_id(*id)
            .await
            .expect("Failed to fetch job")
            .expect("Job should exist");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.error_message.as_deref(), Some(STALLED_RECOVERY_REASON));
    }

    // Drain the released jobs so they do not linger as backlog
    for id in job_ids {
        if handles
            .queue
            .claim(id, "janitor")
            .await
            .expect("claim failed")
        {
            handles
                .queue
                .mark_completed(id)
                .await
                .expect("complete failed");
        }
    }
}
