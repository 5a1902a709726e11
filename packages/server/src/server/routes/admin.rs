//! Operator routes for the pipeline's repair machinery.

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use super::ApiResult;
use crate::common::SourceId;
use crate::kernel::breaker::BreakerSnapshot;
use crate::kernel::health::SystemHealth;
use crate::kernel::jobs::{RecoveryReport, SyncReport};
use crate::server::app::AppState;

/// GET /admin/status
pub async fn system_status(
    Extension(state): Extension<AppState>,
) -> ApiResult<Json<SystemHealth>> {
    let health = state.health.check().await?;
    Ok(Json(health))
}

/// POST /admin/synchronize
pub async fn force_synchronization(
    Extension(state): Extension<AppState>,
) -> ApiResult<Json<SyncReport>> {
    let report = state.sync.force_synchronization().await?;
    Ok(Json(report))
}

/// POST /admin/recovery
pub async fn run_recovery(
    Extension(state): Extension<AppState>,
) -> ApiResult<Json<RecoveryReport>> {
    let report = state.recovery.run_recovery().await?;
    Ok(Json(report))
}

/// POST /admin/sources/{id}/recover
pub async fn emergency_recovery(
    Extension(state): Extension<AppState>,
    Path(source_id): Path<SourceId>,
) -> ApiResult<Json<SyncReport>> {
    let report = state.sync.emergency_recovery(source_id).await?;
    Ok(Json(report))
}

/// GET /admin/breakers
pub async fn list_breakers(
    Extension(state): Extension<AppState>,
) -> Json<Vec<BreakerSnapshot>> {
    Json(state.deps.breakers.snapshot())
}

/// POST /admin/breakers/{name}/reset
pub async fn reset_breaker(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
) -> (StatusCode, Json<Value>) {
    if state.deps.breakers.reset(&name) {
        (StatusCode::OK, Json(json!({ "reset": name })))
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("No circuit breaker named '{}'", name) })),
        )
    }
}
