use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::common::{PageId, SourceId, WorkflowEventId};
use crate::domains::sources::status::WorkflowStatus;

/// Event type strings written by the transition helpers.
///
/// Source-level events leave `page_id` NULL, page-level events set it.
pub mod event_types {
    pub const SOURCE_CREATED: &str = "source_created";
    pub const CRAWL_STARTED: &str = "crawl_started";
    pub const PAGES_DISCOVERED: &str = "pages_discovered";
    pub const CRAWL_COMPLETED: &str = "crawl_completed";
    pub const TRAINING_STARTED: &str = "training_started";
    pub const TRAINING_COMPLETED: &str = "training_completed";
    pub const SOURCE_FAILED: &str = "source_failed";
    pub const SOURCE_REMOVAL_REQUESTED: &str = "source_removal_requested";
    pub const SOURCE_REMOVED: &str = "source_removed";
    pub const SOURCE_RESTORED: &str = "source_restored";
    pub const SOURCE_DELETED: &str = "source_deleted";

    pub const PAGE_CRAWL_STARTED: &str = "page_crawl_started";
    pub const PAGE_CRAWLED: &str = "page_crawled";
    pub const PAGE_CRAWL_FAILED: &str = "page_crawl_failed";
    pub const PAGE_TRAIN_STARTED: &str = "page_train_started";
    pub const PAGE_TRAINED: &str = "page_trained";
    pub const PAGE_TRAIN_FAILED: &str = "page_train_failed";
    pub const PAGE_REMOVAL_REQUESTED: &str = "page_removal_requested";
    pub const PAGE_REMOVED: &str = "page_removed";
    pub const PAGE_RESTORED: &str = "page_restored";
}

/// WorkflowEvent - one append-only audit row per workflow transition.
///
/// Rows are only ever inserted, inside the same transaction as the status
/// update they record (see `transition.rs`). There are no update or delete
/// methods on purpose, and no foreign keys in the table, so the history of
/// a source survives its deletion.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkflowEvent {
    pub id: WorkflowEventId,
    pub source_id: SourceId,
    pub page_id: Option<PageId>,
    pub event_type: String,
    pub from_status: Option<WorkflowStatus>,
    pub to_status: WorkflowStatus,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl WorkflowEvent {
    /// Most recent events for a source, page-level events included.
    pub async fn find_by_source(
        source_id: SourceId,
        limit: i64,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM workflow_events
            WHERE source_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(source_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    /// Most recent events for a single page.
    pub async fn find_by_page(page_id: PageId, limit: i64, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM workflow_events
            WHERE page_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(page_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn count_for_source(source_id: SourceId, pool: &PgPool) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM workflow_events WHERE source_id = $1")
            .bind(source_id)
            .fetch_one(pool)
            .await
            .map_err(Into::into)
    }
}
