//! Integration tests for the Postgres job queue.
//!
//! Everything here exercises the store-level guarantees the pipeline
//! leans on:
//! - claiming is a conditional update with exactly one winner
//! - job keys admit at most one active job
//! - failures back off and eventually exhaust
//! - timed-out jobs keep their claim until recovery releases them

mod common;

use std::sync::Arc;

use crate::common::{backdate_job_claim, create_test_source, make_job_due, TestHarness};
use chrono::Utc;
use ingest_core::kernel::jobs::{
    JobOutcome, JobPriority, JobQueue, JobSpec, JobStatus, PostgresJobQueue,
    STALLED_RECOVERY_REASON, STALLED_TIMEOUT,
};
use test_context::test_context;
use uuid::Uuid;

// =============================================================================
// Test Helpers
// =============================================================================

/// A job spec with a job type unique to this test run.
///
/// The test database is shared, so scans like `next_jobs` are scoped by
/// job type to keep parallel tests out of each other's way.
fn spec_for(source_id: ingest_core::common::SourceId, job_type: &str) -> JobSpec {
    JobSpec::builder()
        .job_type(job_type)
        .source_id(source_id)
        .build()
}

fn unique_job_type(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

// =============================================================================
// Claiming
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn concurrent_claims_have_exactly_one_winner(ctx: &TestHarness) {
    let queue = Arc::new(PostgresJobQueue::new(ctx.db_pool.clone()));
    let source = create_test_source(&ctx.db_pool, "claim race")
        .await
        .expect("Failed to create source");

    let job_id = queue
        .enqueue(spec_for(source.id, &unique_job_type("race")))
        .await
        .expect("Failed to enqueue")
        .job_id();

    // Act: ten workers race for the same job
    let attempts = (0..10).map(|n| {
        let queue = queue.clone();
        async move {
            queue
                .claim(job_id, &format!("worker-{}", n))
                .await
                .expect("Claim query failed")
        }
    });
    let outcomes = futures::future::join_all(attempts).await;

    // Assert: one winner, and the row names it
    assert_eq!(outcomes.iter().filter(|won| **won).count(), 1);
    let job = queue
        .find_by_id(job_id)
        .await
        .expect("Failed to fetch job")
        .expect("Job should exist");
    assert_eq!(job.status, JobStatus::Processing);
    assert!(job.started_at.is_some());
    assert!(job.worker_id.as_deref().unwrap().starts_with("worker-"));
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn claiming_a_claimed_job_fails(ctx: &TestHarness) {
    let queue = PostgresJobQueue::new(ctx.db_pool.clone());
    let source = create_test_source(&ctx.db_pool, "double claim")
        .await
        .expect("Failed to create source");
    let job_id = queue
        .enqueue(spec_for(source.id, &unique_job_type("double")))
        .await
        .expect("Failed to enqueue")
        .job_id();

    assert!(queue.claim(job_id, "worker-a").await.expect("claim failed"));
    assert!(!queue.claim(job_id, "worker-b").await.expect("claim failed"));

    let job = queue
        .find_by_id(job_id)
        .await
        .expect("Failed to fetch job")
        .expect("Job should exist");
    assert_eq!(job.worker_id.as_deref(), Some("worker-a"));
}

// =============================================================================
// Idempotency keys
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn job_key_admits_one_active_job(ctx: &TestHarness) {
    let queue = PostgresJobQueue::new(ctx.db_pool.clone());
    let source = create_test_source(&ctx.db_pool, "dedupe")
        .await
        .expect("Failed to create source");
    let key = format!("dedupe:{}", Uuid::new_v4());
    let spec = JobSpec::builder()
        .job_type(unique_job_type("dedupe"))
        .source_id(source.id)
        .job_key(key.clone())
        .build();

    // First enqueue creates, second finds the active job
    let first = queue.enqueue(spec.clone()).await.expect("Failed to enqueue");
    assert!(first.is_created());
    let second = queue.enqueue(spec.clone()).await.expect("Failed to enqueue");
    assert!(!second.is_created());
    assert_eq!(second.job_id(), first.job_id());

    // The key holds while the job is processing too
    assert!(queue
        .claim(first.job_id(), "worker-a")
        .await
        .expect("claim failed"));
    let third = queue.enqueue(spec.clone()).await.expect("Failed to enqueue");
    assert_eq!(third.job_id(), first.job_id());

    // A finished job no longer holds the key
    assert!(queue
        .mark_completed(first.job_id())
        .await
        .expect("complete failed"));
    let fourth = queue.enqueue(spec).await.expect("Failed to enqueue");
    assert!(fourth.is_created());
    assert_ne!(fourth.job_id(), first.job_id());
}

// =============================================================================
// Scheduling and ordering
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn ready_jobs_come_back_most_urgent_first(ctx: &TestHarness) {
    let queue = PostgresJobQueue::new(ctx.db_pool.clone());
    let source = create_test_source(&ctx.db_pool, "ordering")
        .await
        .expect("Failed to create source");
    let job_type = unique_job_type("ordering");

    let normal_old = queue
        .enqueue(spec_for(source.id, &job_type))
        .await
        .expect("Failed to enqueue")
        .job_id();
    let normal_new = queue
        .enqueue(spec_for(source.id, &job_type))
        .await
        .expect("Failed to enqueue")
        .job_id();
    let high = queue
        .enqueue(
            JobSpec::builder()
                .job_type(job_type.clone())
                .source_id(source.id)
                .priority(JobPriority::High)
                .build(),
        )
        .await
        .expect("Failed to enqueue")
        .job_id();

    let ready = queue
        .next_jobs(10, Some(&[job_type]))
        .await
        .expect("Failed to scan");

    let ids: Vec<_> = ready.iter().map(|job| job.id).collect();
    assert_eq!(ids, vec![high, normal_old, normal_new]);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn future_scheduled_jobs_are_invisible_until_due(ctx: &TestHarness) {
    let queue = PostgresJobQueue::new(ctx.db_pool.clone());
    let source = create_test_source(&ctx.db_pool, "deferred")
        .await
        .expect("Failed to create source");
    let job_type = unique_job_type("deferred");

    let job_id = queue
        .enqueue(
            JobSpec::builder()
                .job_type(job_type.clone())
                .source_id(source.id)
                .run_at(Utc::now() + chrono::Duration::hours(1))
                .build(),
        )
        .await
        .expect("Failed to enqueue")
        .job_id();

    let ready = queue
        .next_jobs(10, Some(&[job_type.clone()]))
        .await
        .expect("Failed to scan");
    assert!(ready.is_empty());

    make_job_due(&ctx.db_pool, job_id)
        .await
        .expect("Failed to reschedule");
    let ready = queue
        .next_jobs(10, Some(&[job_type]))
        .await
        .expect("Failed to scan");
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, job_id);
}

// =============================================================================
// Failure, backoff, exhaustion
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn failure_releases_the_claim_and_backs_off(ctx: &TestHarness) {
    let queue = PostgresJobQueue::new(ctx.db_pool.clone());
    let source = create_test_source(&ctx.db_pool, "backoff")
        .await
        .expect("Failed to create source");
    let job_id = queue
        .enqueue(spec_for(source.id, &unique_job_type("backoff")))
        .await
        .expect("Failed to enqueue")
        .job_id();
    let enqueued_at = queue
        .find_by_id(job_id)
        .await
        .expect("Failed to fetch job")
        .expect("Job should exist")
        .scheduled_at;

    assert!(queue.claim(job_id, "worker-a").await.expect("claim failed"));
    let outcome = queue
        .mark_failed(job_id, "connection refused")
        .await
        .expect("mark_failed failed");
    assert_eq!(outcome, JobOutcome::WillRetry { attempts: 1 });

    let job = queue
        .find_by_id(job_id)
        .await
        .expect("Failed to fetch job")
        .expect("Job should exist");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.error_message.as_deref(), Some("connection refused"));
    // The claim bookkeeping is wiped and the retry is pushed out
    assert!(job.started_at.is_none());
    assert!(job.worker_id.is_none());
    assert!(job.scheduled_at > enqueued_at);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn exhausted_jobs_keep_their_last_claim_for_forensics(ctx: &TestHarness) {
    let queue = PostgresJobQueue::new(ctx.db_pool.clone());
    let source = create_test_source(&ctx.db_pool, "exhaustion")
        .await
        .expect("Failed to create source");
    let job_id = queue
        .enqueue(
            JobSpec::builder()
                .job_type(unique_job_type("exhaust"))
                .source_id(source.id)
                .max_attempts(1)
                .build(),
        )
        .await
        .expect("Failed to enqueue")
        .job_id();

    assert!(queue.claim(job_id, "worker-a").await.expect("claim failed"));
    let outcome = queue
        .mark_failed(job_id, "still broken")
        .await
        .expect("mark_failed failed");
    assert!(outcome.is_exhausted());

    let job = queue
        .find_by_id(job_id)
        .await
        .expect("Failed to fetch job")
        .expect("Job should exist");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert!(job.completed_at.is_some());
    // Terminal rows keep who held them and since when
    assert!(job.started_at.is_some());
    assert_eq!(job.worker_id.as_deref(), Some("worker-a"));
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn failing_an_unclaimed_job_is_a_no_op(ctx: &TestHarness) {
    let queue = PostgresJobQueue::new(ctx.db_pool.clone());
    let source = create_test_source(&ctx.db_pool, "not processing")
        .await
        .expect("Failed to create source");
    let job_id = queue
        .enqueue(spec_for(source.id, &unique_job_type("noop")))
        .await
        .expect("Failed to enqueue")
        .job_id();

    let outcome = queue
        .mark_failed(job_id, "nobody owns this")
        .await
        .expect("mark_failed failed");
    assert_eq!(outcome, JobOutcome::NotProcessing);

    let job = queue
        .find_by_id(job_id)
        .await
        .expect("Failed to fetch job")
        .expect("Job should exist");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
}

// =============================================================================
// Timeouts and stalled recovery
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn timed_out_jobs_stay_claimed(ctx: &TestHarness) {
    let queue = PostgresJobQueue::new(ctx.db_pool.clone());
    let source = create_test_source(&ctx.db_pool, "timeout")
        .await
        .expect("Failed to create source");
    let job_id = queue
        .enqueue(spec_for(source.id, &unique_job_type("timeout")))
        .await
        .expect("Failed to enqueue")
        .job_id();

    assert!(queue.claim(job_id, "worker-a").await.expect("claim failed"));
    let outcome = queue
        .mark_timed_out(job_id, 30_000)
        .await
        .expect("mark_timed_out failed");
    assert_eq!(outcome, JobOutcome::WillRetry { attempts: 1 });

    // The handler may still be running, so the claim survives
    let job = queue
        .find_by_id(job_id)
        .await
        .expect("Failed to fetch job")
        .expect("Job should exist");
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.worker_id.as_deref(), Some("worker-a"));
    assert!(job.started_at.is_some());
    assert_eq!(
        job.error_message.as_deref(),
        Some("Job processing timed out after 30000ms")
    );
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn stalled_release_only_touches_old_claims(ctx: &TestHarness) {
    let queue = PostgresJobQueue::new(ctx.db_pool.clone());
    let source = create_test_source(&ctx.db_pool, "stalled")
        .await
        .expect("Failed to create source");
    let job_type = unique_job_type("stalled");

    let stalled_id = queue
        .enqueue(spec_for(source.id, &job_type))
        .await
        .expect("Failed to enqueue")
        .job_id();
    let healthy_id = queue
        .enqueue(spec_for(source.id, &job_type))
        .await
        .expect("Failed to enqueue")
        .job_id();
    assert!(queue
        .claim(stalled_id, "worker-dead")
        .await
        .expect("claim failed"));
    assert!(queue
        .claim(healthy_id, "worker-live")
        .await
        .expect("claim failed"));
    backdate_job_claim(&ctx.db_pool, stalled_id, 10)
        .await
        .expect("Failed to backdate claim");

    let cutoff = Utc::now() - chrono::Duration::seconds(STALLED_TIMEOUT.as_secs() as i64);
    let released = queue
        .release_stalled(cutoff, STALLED_RECOVERY_REASON)
        .await
        .expect("release_stalled failed");

    // Only the backdated claim comes back; scoped check since the store
    // is shared with other tests
    assert!(released.iter().any(|job| job.id == stalled_id));
    assert!(released.iter().all(|job| job.id != healthy_id));

    let stalled = queue
        .find_by_id(stalled_id)
        .await
        .expect("Failed to fetch job")
        .expect("Job should exist");
    assert_eq!(stalled.status, JobStatus::Pending);
    assert!(stalled.started_at.is_none());
    assert!(stalled.worker_id.is_none());
    assert_eq!(stalled.attempts, 0);
    assert_eq!(
        stalled.error_message.as_deref(),
        Some(STALLED_RECOVERY_REASON)
    );

    let healthy = queue
        .find_by_id(healthy_id)
        .await
        .expect("Failed to fetch job")
        .expect("Job should exist");
    assert_eq!(healthy.status, JobStatus::Processing);
    assert_eq!(healthy.worker_id.as_deref(), Some("worker-live"));
}
