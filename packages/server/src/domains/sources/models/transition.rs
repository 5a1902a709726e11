//! Transactional workflow transitions.
//!
//! Every status change and its audit event commit together or not at all.
//! Each update is conditional on the status the caller observed, so a lost
//! race returns `None` instead of clobbering a concurrent transition.
//!
//! Entry into `pending_removal` and the paths out of it cascade to the
//! source's pages and go through the dedicated functions below. Plain
//! stage-to-stage moves use `apply_source_transition` / `apply_page_transition`.

use anyhow::Result;
use serde_json::json;
use sqlx::{PgPool, Postgres, Transaction};

use crate::common::{PageId, SourceId, WorkflowEventId};
use crate::domains::sources::models::page::Page;
use crate::domains::sources::models::source::Source;
use crate::domains::sources::models::workflow_event::{event_types, WorkflowEvent};
use crate::domains::sources::status::WorkflowStatus;

/// Insert one audit event and notify listeners, inside the caller's
/// transaction.
async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    source_id: SourceId,
    page_id: Option<PageId>,
    event_type: &str,
    from_status: Option<WorkflowStatus>,
    to_status: WorkflowStatus,
    metadata: serde_json::Value,
) -> Result<WorkflowEvent> {
    let event = sqlx::query_as::<_, WorkflowEvent>(
        r#"
        INSERT INTO workflow_events (id, source_id, page_id, event_type, from_status, to_status, metadata)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING *
        "#,
    )
    .bind(WorkflowEventId::new())
    .bind(source_id)
    .bind(page_id)
    .bind(event_type)
    .bind(from_status)
    .bind(to_status)
    .bind(metadata)
    .fetch_one(&mut **tx)
    .await?;

    sqlx::query("SELECT pg_notify('workflow_events', $1)")
        .bind(event.id.to_string())
        .execute(&mut **tx)
        .await?;

    Ok(event)
}

/// Record a lifecycle event that is not tied to a status update in the same
/// statement (creation, discovery counts, post-deletion marker).
pub async fn record_event(
    source_id: SourceId,
    page_id: Option<PageId>,
    event_type: &str,
    from_status: Option<WorkflowStatus>,
    to_status: WorkflowStatus,
    metadata: serde_json::Value,
    pool: &PgPool,
) -> Result<WorkflowEvent> {
    let mut tx = pool.begin().await?;
    let event = insert_event(
        &mut tx,
        source_id,
        page_id,
        event_type,
        from_status,
        to_status,
        metadata,
    )
    .await?;
    tx.commit().await?;
    Ok(event)
}

/// Move a source from `from` to `to` and log the event atomically.
///
/// Returns `None` when the source is no longer in `from` (a concurrent
/// worker got there first) or does not exist. `error_message` replaces the
/// stored message on every call, so passing `None` clears a stale error.
pub async fn apply_source_transition(
    source_id: SourceId,
    from: WorkflowStatus,
    to: WorkflowStatus,
    error_message: Option<&str>,
    event_type: &str,
    metadata: serde_json::Value,
    pool: &PgPool,
) -> Result<Option<(Source, WorkflowEvent)>> {
    let mut tx = pool.begin().await?;

    let Some(source) = sqlx::query_as::<_, Source>(
        r#"
        UPDATE sources
        SET workflow_status = $3,
            error_message = $4,
            updated_at = NOW()
        WHERE id = $1 AND workflow_status = $2
        RETURNING *
        "#,
    )
    .bind(source_id)
    .bind(from)
    .bind(to)
    .bind(error_message)
    .fetch_optional(&mut *tx)
    .await?
    else {
        return Ok(None);
    };

    let event = insert_event(
        &mut tx,
        source.id,
        None,
        event_type,
        Some(from),
        to,
        metadata,
    )
    .await?;
    tx.commit().await?;

    Ok(Some((source, event)))
}

/// Page analog of [`apply_source_transition`].
pub async fn apply_page_transition(
    page_id: PageId,
    from: WorkflowStatus,
    to: WorkflowStatus,
    error_message: Option<&str>,
    event_type: &str,
    metadata: serde_json::Value,
    pool: &PgPool,
) -> Result<Option<(Page, WorkflowEvent)>> {
    let mut tx = pool.begin().await?;

    let Some(page) = sqlx::query_as::<_, Page>(
        r#"
        UPDATE pages
        SET workflow_status = $3,
            error_message = $4,
            updated_at = NOW()
        WHERE id = $1 AND workflow_status = $2
        RETURNING *
        "#,
    )
    .bind(page_id)
    .bind(from)
    .bind(to)
    .bind(error_message)
    .fetch_optional(&mut *tx)
    .await?
    else {
        return Ok(None);
    };

    let event = insert_event(
        &mut tx,
        page.parent_source_id,
        Some(page.id),
        event_type,
        Some(from),
        to,
        metadata,
    )
    .await?;
    tx.commit().await?;

    Ok(Some((page, event)))
}

/// First phase of deletion: park the source and all of its live pages in
/// `pending_removal`, remembering where each row came from so a restore can
/// put everything back.
pub async fn mark_source_pending_removal(
    source_id: SourceId,
    from: WorkflowStatus,
    pool: &PgPool,
) -> Result<Option<(Source, Vec<Page>)>> {
    let mut tx = pool.begin().await?;

    let Some(source) = sqlx::query_as::<_, Source>(
        r#"
        UPDATE sources
        SET previous_status = workflow_status,
            workflow_status = 'pending_removal',
            updated_at = NOW()
        WHERE id = $1 AND workflow_status = $2
        RETURNING *
        "#,
    )
    .bind(source_id)
    .bind(from)
    .fetch_optional(&mut *tx)
    .await?
    else {
        return Ok(None);
    };

    let pages = sqlx::query_as::<_, Page>(
        r#"
        UPDATE pages
        SET previous_status = workflow_status,
            workflow_status = 'pending_removal',
            updated_at = NOW()
        WHERE parent_source_id = $1
          AND workflow_status NOT IN ('pending_removal', 'removed')
        RETURNING *
        "#,
    )
    .bind(source_id)
    .fetch_all(&mut *tx)
    .await?;

    insert_event(
        &mut tx,
        source.id,
        None,
        event_types::SOURCE_REMOVAL_REQUESTED,
        Some(from),
        WorkflowStatus::PendingRemoval,
        json!({ "pages_affected": pages.len() }),
    )
    .await?;

    for page in &pages {
        insert_event(
            &mut tx,
            source.id,
            Some(page.id),
            event_types::PAGE_REMOVAL_REQUESTED,
            page.previous_status,
            WorkflowStatus::PendingRemoval,
            json!({}),
        )
        .await?;
    }

    tx.commit().await?;
    Ok(Some((source, pages)))
}

/// Second phase of deletion: settle a parked source and its parked pages
/// into the terminal `removed` status. Restore is no longer possible after
/// this, so the captured statuses are dropped.
pub async fn finalize_source_removal(
    source_id: SourceId,
    pool: &PgPool,
) -> Result<Option<(Source, Vec<Page>)>> {
    let mut tx = pool.begin().await?;

    let Some(source) = sqlx::query_as::<_, Source>(
        r#"
        UPDATE sources
        SET workflow_status = 'removed',
            previous_status = NULL,
            updated_at = NOW()
        WHERE id = $1 AND workflow_status = 'pending_removal'
        RETURNING *
        "#,
    )
    .bind(source_id)
    .fetch_optional(&mut *tx)
    .await?
    else {
        return Ok(None);
    };

    let pages = sqlx::query_as::<_, Page>(
        r#"
        UPDATE pages
        SET workflow_status = 'removed',
            previous_status = NULL,
            updated_at = NOW()
        WHERE parent_source_id = $1 AND workflow_status = 'pending_removal'
        RETURNING *
        "#,
    )
    .bind(source_id)
    .fetch_all(&mut *tx)
    .await?;

    insert_event(
        &mut tx,
        source.id,
        None,
        event_types::SOURCE_REMOVED,
        Some(WorkflowStatus::PendingRemoval),
        WorkflowStatus::Removed,
        json!({ "pages_affected": pages.len() }),
    )
    .await?;

    for page in &pages {
        insert_event(
            &mut tx,
            source.id,
            Some(page.id),
            event_types::PAGE_REMOVED,
            Some(WorkflowStatus::PendingRemoval),
            WorkflowStatus::Removed,
            json!({}),
        )
        .await?;
    }

    tx.commit().await?;
    Ok(Some((source, pages)))
}

/// Undo a pending removal: every parked row returns to the status it held
/// before the removal request.
pub async fn restore_source(
    source_id: SourceId,
    pool: &PgPool,
) -> Result<Option<(Source, Vec<Page>)>> {
    let mut tx = pool.begin().await?;

    let Some(source) = sqlx::query_as::<_, Source>(
        r#"
        UPDATE sources
        SET workflow_status = previous_status,
            previous_status = NULL,
            updated_at = NOW()
        WHERE id = $1
          AND workflow_status = 'pending_removal'
          AND previous_status IS NOT NULL
        RETURNING *
        "#,
    )
    .bind(source_id)
    .fetch_optional(&mut *tx)
    .await?
    else {
        return Ok(None);
    };

    let pages = sqlx::query_as::<_, Page>(
        r#"
        UPDATE pages
        SET workflow_status = previous_status,
            previous_status = NULL,
            updated_at = NOW()
        WHERE parent_source_id = $1
          AND workflow_status = 'pending_removal'
          AND previous_status IS NOT NULL
        RETURNING *
        "#,
    )
    .bind(source_id)
    .fetch_all(&mut *tx)
    .await?;

    insert_event(
        &mut tx,
        source.id,
        None,
        event_types::SOURCE_RESTORED,
        Some(WorkflowStatus::PendingRemoval),
        source.workflow_status,
        json!({ "pages_affected": pages.len() }),
    )
    .await?;

    for page in &pages {
        insert_event(
            &mut tx,
            source.id,
            Some(page.id),
            event_types::PAGE_RESTORED,
            Some(WorkflowStatus::PendingRemoval),
            page.workflow_status,
            json!({}),
        )
        .await?;
    }

    tx.commit().await?;
    Ok(Some((source, pages)))
}

/// Physically delete a source together with its pages and jobs.
///
/// Only parked, removed or errored sources may be deleted. The audit event
/// outlives the rows because `workflow_events` carries no foreign keys.
pub async fn delete_source_hard(source_id: SourceId, pool: &PgPool) -> Result<Option<Source>> {
    let mut tx = pool.begin().await?;

    let jobs_deleted = sqlx::query("DELETE FROM jobs WHERE source_id = $1")
        .bind(source_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    let pages_deleted = sqlx::query("DELETE FROM pages WHERE parent_source_id = $1")
        .bind(source_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    let Some(source) = sqlx::query_as::<_, Source>(
        r#"
        DELETE FROM sources
        WHERE id = $1
          AND workflow_status IN ('pending_removal', 'removed', 'error')
        RETURNING *
        "#,
    )
    .bind(source_id)
    .fetch_optional(&mut *tx)
    .await?
    else {
        // The source is live or gone. Keep its jobs and pages.
        tx.rollback().await?;
        return Ok(None);
    };

    insert_event(
        &mut tx,
        source.id,
        None,
        event_types::SOURCE_DELETED,
        Some(source.workflow_status),
        WorkflowStatus::Removed,
        json!({ "pages_deleted": pages_deleted, "jobs_deleted": jobs_deleted }),
    )
    .await?;

    tx.commit().await?;
    Ok(Some(source))
}
