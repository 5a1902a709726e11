// HTTP routes
pub mod admin;
pub mod health;
pub mod sources;

pub use health::health_handler;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::domains::sources::workflow::WorkflowError;
use crate::kernel::breaker::BreakerError;

/// Error wrapper that maps pipeline errors onto HTTP statuses.
///
/// Anything a handler bubbles up with `?` lands here; workflow conflicts
/// become 409s, missing entities 404s, open breakers 503s, and the rest
/// plain 500s.
pub struct ApiError(anyhow::Error);

pub type ApiResult<T> = Result<T, ApiError>;

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = classify(&self.0);
        if status.is_server_error() {
            tracing::error!(error = ?self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

fn classify(error: &anyhow::Error) -> StatusCode {
    if let Some(workflow) = error.downcast_ref::<WorkflowError>() {
        return match workflow {
            WorkflowError::SourceNotFound(_) | WorkflowError::PageNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            WorkflowError::IllegalSourceTransition { .. }
            | WorkflowError::IllegalPageTransition { .. }
            | WorkflowError::PageAheadOfSource { .. }
            | WorkflowError::Conflict(_) => StatusCode::CONFLICT,
            WorkflowError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
    }

    if matches!(
        error.downcast_ref::<BreakerError>(),
        Some(BreakerError::Open { .. })
    ) {
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    if matches!(
        error.downcast_ref::<sqlx::Error>(),
        Some(sqlx::Error::RowNotFound)
    ) {
        return StatusCode::NOT_FOUND;
    }

    StatusCode::INTERNAL_SERVER_ERROR
}
