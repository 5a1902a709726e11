//! Test fixtures for creating test data.
//!
//! These fixtures use the model methods directly where possible; status
//! placement bypasses the workflow engine on purpose so tests can start
//! from any point in the lifecycle.

use anyhow::Result;
use ingest_core::common::{JobId, PageId, SourceId};
use ingest_core::domains::sources::models::{Page, Source};
use ingest_core::domains::sources::status::WorkflowStatus;
use ingest_core::kernel::jobs::Job;
use ingest_core::kernel::traits::DiscoveredPage;
use sqlx::PgPool;
use uuid::Uuid;

/// Create a source with a unique URL in `created` status
pub async fn create_test_source(pool: &PgPool, name: &str) -> Result<Source> {
    let url = format!("https://{}.example.org", Uuid::new_v4());
    Source::create(name, &url, pool).await
}

/// Create a source already sitting in the given status
pub async fn source_in_status(
    pool: &PgPool,
    name: &str,
    status: WorkflowStatus,
) -> Result<Source> {
    let source = create_test_source(pool, name).await?;
    set_source_status(pool, source.id, status).await?;
    Source::find_by_id(source.id, pool).await
}

/// Move a source to a status directly, without the workflow engine
pub async fn set_source_status(
    pool: &PgPool,
    source_id: SourceId,
    status: WorkflowStatus,
) -> Result<()> {
    sqlx::query("UPDATE sources SET workflow_status = $2, updated_at = NOW() WHERE id = $1")
        .bind(source_id)
        .bind(status)
        .execute(pool)
        .await?;
    Ok(())
}

/// Add one page to a source, parked in the given status
pub async fn page_in_status(
    pool: &PgPool,
    source_id: SourceId,
    url: &str,
    status: WorkflowStatus,
) -> Result<Page> {
    let discovered = vec![DiscoveredPage {
        url: url.to_string(),
        title: None,
    }];
    let pages = Page::create_many(source_id, &discovered, pool).await?;
    let page = pages
        .into_iter()
        .next()
        .expect("page url should be new to this source");

    if status != WorkflowStatus::Created {
        set_page_status(pool, page.id, status).await?;
    }
    Page::find_by_id(page.id, pool).await
}

/// Move a page to a status directly, without the workflow engine
pub async fn set_page_status(pool: &PgPool, page_id: PageId, status: WorkflowStatus) -> Result<()> {
    sqlx::query("UPDATE pages SET workflow_status = $2, updated_at = NOW() WHERE id = $1")
        .bind(page_id)
        .bind(status)
        .execute(pool)
        .await?;
    Ok(())
}

/// Age a page so the orphan scans see it
pub async fn backdate_page(pool: &PgPool, page_id: PageId, minutes: i64) -> Result<()> {
    sqlx::query(&format!(
        "UPDATE pages SET updated_at = NOW() - INTERVAL '{} minutes' WHERE id = $1",
        minutes
    ))
    .bind(page_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Age a processing job's claim so the stalled scan sees it
pub async fn backdate_job_claim(pool: &PgPool, job_id: JobId, minutes: i64) -> Result<()> {
    sqlx::query(&format!(
        "UPDATE jobs SET started_at = NOW() - INTERVAL '{} minutes' WHERE id = $1",
        minutes
    ))
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Make a scheduled job due immediately
pub async fn make_job_due(pool: &PgPool, job_id: JobId) -> Result<()> {
    sqlx::query("UPDATE jobs SET scheduled_at = NOW() WHERE id = $1")
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Count jobs of one type in one status
pub async fn count_jobs(pool: &PgPool, job_type: &str, status: &str) -> Result<i64> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM jobs WHERE job_type = $1 AND status = $2",
    )
    .bind(job_type)
    .bind(status)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// All jobs belonging to one source, oldest first.
///
/// The test database is shared between tests, so assertions must scope
/// to their own source rather than counting the whole jobs table.
pub async fn jobs_for_source(pool: &PgPool, source_id: SourceId) -> Result<Vec<Job>> {
    let jobs = sqlx::query_as::<_, Job>(
        "SELECT * FROM jobs WHERE source_id = $1 ORDER BY created_at, id",
    )
    .bind(source_id)
    .fetch_all(pool)
    .await?;
    Ok(jobs)
}

/// Jobs of one type belonging to one source, oldest first.
pub async fn jobs_of_type_for_source(
    pool: &PgPool,
    source_id: SourceId,
    job_type: &str,
) -> Result<Vec<Job>> {
    let jobs = sqlx::query_as::<_, Job>(
        "SELECT * FROM jobs WHERE source_id = $1 AND job_type = $2 ORDER BY created_at, id",
    )
    .bind(source_id)
    .bind(job_type)
    .fetch_all(pool)
    .await?;
    Ok(jobs)
}
