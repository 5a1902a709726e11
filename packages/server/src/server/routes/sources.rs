//! Source lifecycle routes.
//!
//! All transitions go through the workflow engine; these handlers only
//! translate HTTP into engine calls and engine errors into statuses.

use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::ApiResult;
use crate::common::SourceId;
use crate::domains::sources::jobs::TRAINER_SERVICE;
use crate::domains::sources::models::{Page, Source, WorkflowEvent};
use crate::domains::sources::workflow::WorkflowError;
use crate::server::app::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSourceRequest {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    /// When true, hard-delete the source with its pages and jobs.
    #[serde(default)]
    pub purge: bool,
}

#[derive(Serialize)]
pub struct TrainingStartedResponse {
    pub source: Source,
    pub jobs_enqueued: usize,
}

#[derive(Serialize)]
pub struct RemovalResponse {
    pub source: Source,
    pub pages_affected: usize,
}

/// POST /sources
///
/// Idempotent on URL: posting an existing source returns it with 200.
pub async fn create_source(
    Extension(state): Extension<AppState>,
    Json(body): Json<CreateSourceRequest>,
) -> ApiResult<(StatusCode, Json<Source>)> {
    let (source, created) = state
        .deps
        .workflow()
        .create_source(&body.name, &body.url)
        .await?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(source)))
}

/// GET /sources
pub async fn list_sources(
    Extension(state): Extension<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Source>>> {
    let sources = Source::find_recent(query.limit.unwrap_or(100), &state.db_pool).await?;
    Ok(Json(sources))
}

/// GET /sources/{id}
pub async fn get_source(
    Extension(state): Extension<AppState>,
    Path(source_id): Path<SourceId>,
) -> ApiResult<Json<Source>> {
    let source = Source::find_by_id_optional(source_id, &state.db_pool)
        .await?
        .ok_or(WorkflowError::SourceNotFound(source_id))?;
    Ok(Json(source))
}

/// GET /sources/{id}/pages
pub async fn get_source_pages(
    Extension(state): Extension<AppState>,
    Path(source_id): Path<SourceId>,
) -> ApiResult<Json<Vec<Page>>> {
    Source::find_by_id_optional(source_id, &state.db_pool)
        .await?
        .ok_or(WorkflowError::SourceNotFound(source_id))?;
    let pages = Page::find_by_source(source_id, &state.db_pool).await?;
    Ok(Json(pages))
}

/// GET /sources/{id}/events
///
/// The audit trail outlives the source, so this succeeds even after a
/// hard deletion.
pub async fn get_source_events(
    Extension(state): Extension<AppState>,
    Path(source_id): Path<SourceId>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<WorkflowEvent>>> {
    let events =
        WorkflowEvent::find_by_source(source_id, query.limit.unwrap_or(50), &state.db_pool).await?;
    Ok(Json(events))
}

/// POST /sources/{id}/crawl
pub async fn start_crawl(
    Extension(state): Extension<AppState>,
    Path(source_id): Path<SourceId>,
) -> ApiResult<Json<Source>> {
    let source = state.deps.workflow().start_crawl(source_id).await?;
    Ok(Json(source))
}

/// POST /sources/{id}/train
pub async fn start_training(
    Extension(state): Extension<AppState>,
    Path(source_id): Path<SourceId>,
) -> ApiResult<Json<TrainingStartedResponse>> {
    let (source, jobs_enqueued) = state.deps.workflow().start_training(source_id).await?;
    Ok(Json(TrainingStartedResponse {
        source,
        jobs_enqueued,
    }))
}

/// POST /sources/{id}/remove
///
/// Parks the source and its pages in pending_removal. Outstanding jobs
/// are not cancelled; their handlers see the parked status and drain as
/// no-ops.
pub async fn request_removal(
    Extension(state): Extension<AppState>,
    Path(source_id): Path<SourceId>,
) -> ApiResult<Json<RemovalResponse>> {
    let (source, pages) = state.deps.workflow().request_removal(source_id).await?;
    Ok(Json(RemovalResponse {
        source,
        pages_affected: pages.len(),
    }))
}

/// POST /sources/{id}/restore
pub async fn restore_source(
    Extension(state): Extension<AppState>,
    Path(source_id): Path<SourceId>,
) -> ApiResult<Json<RemovalResponse>> {
    let (source, pages) = state.deps.workflow().restore(source_id).await?;
    Ok(Json(RemovalResponse {
        source,
        pages_affected: pages.len(),
    }))
}

/// DELETE /sources/{id}
///
/// Second phase of removal. The trainer forgets the source's content
/// first; if that call fails nothing is deleted and the caller retries.
/// With `?purge=true` the source row and its pages and jobs are deleted
/// outright instead of being kept as removed.
pub async fn delete_source(
    Extension(state): Extension<AppState>,
    Path(source_id): Path<SourceId>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<Json<Source>> {
    let source = Source::find_by_id_optional(source_id, &state.db_pool)
        .await?
        .ok_or(WorkflowError::SourceNotFound(source_id))?;

    state
        .deps
        .breakers
        .execute(TRAINER_SERVICE, || {
            state.deps.trainer.forget_source(&source.url)
        })
        .await?;

    let engine = state.deps.workflow();
    let source = if query.purge {
        engine.delete_source(source_id).await?
    } else {
        let (source, _pages) = engine.finalize_removal(source_id).await?;
        source
    };
    Ok(Json(source))
}
