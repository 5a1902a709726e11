use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::common::{PageId, SourceId};
use crate::domains::sources::status::WorkflowStatus;
use crate::kernel::DiscoveredPage;

/// Page - one crawlable document under a source. Pages move through the
/// same workflow statuses as their parent and never outrun it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Page {
    pub id: PageId,
    pub parent_source_id: SourceId,
    pub url: String,
    pub title: Option<String>,
    pub workflow_status: WorkflowStatus,
    /// Status captured when entering pending_removal, for restore
    pub previous_status: Option<WorkflowStatus>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Page {
    /// Bulk-insert discovered pages for a source in one statement.
    ///
    /// Re-discovered URLs are skipped via ON CONFLICT DO NOTHING, so the
    /// returned rows are exactly the pages that are new this crawl.
    pub async fn create_many(
        source_id: SourceId,
        discovered: &[DiscoveredPage],
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        if discovered.is_empty() {
            return Ok(Vec::new());
        }

        let mut query =
            String::from("INSERT INTO pages (id, parent_source_id, url, title) VALUES ");

        for idx in 0..discovered.len() {
            if idx > 0 {
                query.push_str(", ");
            }
            query.push_str(&format!(
                "(${}, ${}, ${}, ${})",
                idx * 4 + 1,
                idx * 4 + 2,
                idx * 4 + 3,
                idx * 4 + 4
            ));
        }

        query.push_str(" ON CONFLICT (parent_source_id, url) DO NOTHING RETURNING *");

        let mut q = sqlx::query_as::<_, Self>(&query);
        for page in discovered {
            q = q
                .bind(PageId::new())
                .bind(source_id)
                .bind(&page.url)
                .bind(&page.title);
        }

        q.fetch_all(pool).await.map_err(Into::into)
    }

    pub async fn find_by_id(id: PageId, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>("SELECT * FROM pages WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn find_by_id_optional(id: PageId, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM pages WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn find_by_source(source_id: SourceId, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM pages WHERE parent_source_id = $1 ORDER BY created_at",
        )
        .bind(source_id)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn count_for_source(source_id: SourceId, pool: &PgPool) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM pages WHERE parent_source_id = $1")
            .bind(source_id)
            .fetch_one(pool)
            .await
            .map_err(Into::into)
    }

    /// Store the title reported by the crawler.
    pub async fn update_title(id: PageId, title: &str, pool: &PgPool) -> Result<bool> {
        let result = sqlx::query("UPDATE pages SET title = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(title)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Count the source's pages sitting in any of the given statuses.
    pub async fn count_in_statuses(
        source_id: SourceId,
        statuses: &[WorkflowStatus],
        pool: &PgPool,
    ) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM pages
            WHERE parent_source_id = $1 AND workflow_status = ANY($2)
            "#,
        )
        .bind(source_id)
        .bind(statuses)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Repair scans. Orphan scans look for pages stuck waiting on a stage
    // job that does not exist at all (any job status counts as existing);
    // the synchronization scans only require an *active* job, so they
    // also catch pages whose job failed for good.
    // ------------------------------------------------------------------

    /// Created pages under a crawling source, older than `cutoff`, with no
    /// crawl_page job referencing them.
    pub async fn find_orphaned_for_crawl(
        cutoff: DateTime<Utc>,
        limit: i64,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT p.* FROM pages p
            JOIN sources s ON s.id = p.parent_source_id
            WHERE p.workflow_status = 'created'
              AND s.workflow_status = 'crawling'
              AND p.updated_at < $1
              AND NOT EXISTS (
                  SELECT 1 FROM jobs j
                  WHERE j.page_id = p.id AND j.job_type = 'crawl_page'
              )
            ORDER BY p.updated_at ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    /// Completed pages under a training source, older than `cutoff`, with
    /// no train_page job referencing them.
    pub async fn find_orphaned_for_train(
        cutoff: DateTime<Utc>,
        limit: i64,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT p.* FROM pages p
            JOIN sources s ON s.id = p.parent_source_id
            WHERE p.workflow_status = 'completed'
              AND s.workflow_status = 'training'
              AND p.updated_at < $1
              AND NOT EXISTS (
                  SELECT 1 FROM jobs j
                  WHERE j.page_id = p.id AND j.job_type = 'train_page'
              )
            ORDER BY p.updated_at ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    /// Total pages currently orphaned (both stages), for health reporting.
    pub async fn count_orphaned(cutoff: DateTime<Utc>, pool: &PgPool) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM pages p
            JOIN sources s ON s.id = p.parent_source_id
            WHERE p.updated_at < $1
              AND (
                  (p.workflow_status = 'created' AND s.workflow_status = 'crawling'
                   AND NOT EXISTS (
                       SELECT 1 FROM jobs j
                       WHERE j.page_id = p.id AND j.job_type = 'crawl_page'
                   ))
               OR (p.workflow_status = 'completed' AND s.workflow_status = 'training'
                   AND NOT EXISTS (
                       SELECT 1 FROM jobs j
                       WHERE j.page_id = p.id AND j.job_type = 'train_page'
                   ))
              )
            "#,
        )
        .bind(cutoff)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    /// Created pages under a crawling source with no pending or processing
    /// crawl_page job. No age requirement: this is the synchronization
    /// scan, which also re-queues pages whose previous job is terminal.
    pub async fn find_needing_crawl_job(limit: i64, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT p.* FROM pages p
            JOIN sources s ON s.id = p.parent_source_id
            WHERE p.workflow_status = 'created'
              AND s.workflow_status = 'crawling'
              AND NOT EXISTS (
                  SELECT 1 FROM jobs j
                  WHERE j.page_id = p.id
                    AND j.job_type = 'crawl_page'
                    AND j.status IN ('pending', 'processing')
              )
            ORDER BY p.updated_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    /// Completed pages under a training source with no pending or
    /// processing train_page job.
    pub async fn find_needing_train_job(limit: i64, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT p.* FROM pages p
            JOIN sources s ON s.id = p.parent_source_id
            WHERE p.workflow_status = 'completed'
              AND s.workflow_status = 'training'
              AND NOT EXISTS (
                  SELECT 1 FROM jobs j
                  WHERE j.page_id = p.id
                    AND j.job_type = 'train_page'
                    AND j.status IN ('pending', 'processing')
              )
            ORDER BY p.updated_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    /// Scoped variants of the synchronization scans for targeted recovery
    /// of a single source.
    pub async fn find_needing_crawl_job_for_source(
        source_id: SourceId,
        limit: i64,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT p.* FROM pages p
            JOIN sources s ON s.id = p.parent_source_id
            WHERE p.parent_source_id = $1
              AND p.workflow_status = 'created'
              AND s.workflow_status = 'crawling'
              AND NOT EXISTS (
                  SELECT 1 FROM jobs j
                  WHERE j.page_id = p.id
                    AND j.job_type = 'crawl_page'
                    AND j.status IN ('pending', 'processing')
              )
            ORDER BY p.updated_at ASC
            LIMIT $2
            "#,
        )
        .bind(source_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn find_needing_train_job_for_source(
        source_id: SourceId,
        limit: i64,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT p.* FROM pages p
            JOIN sources s ON s.id = p.parent_source_id
            WHERE p.parent_source_id = $1
              AND p.workflow_status = 'completed'
              AND s.workflow_status = 'training'
              AND NOT EXISTS (
                  SELECT 1 FROM jobs j
                  WHERE j.page_id = p.id
                    AND j.job_type = 'train_page'
                    AND j.status IN ('pending', 'processing')
              )
            ORDER BY p.updated_at ASC
            LIMIT $2
            "#,
        )
        .bind(source_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }
}
