pub mod backups;
pub mod operations;

use crate::error::AppError;
use crate::state::AppState;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use backup_core::orchestrator::tracker::Tracked;
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api/backups", backups::router())
        .nest("/api/restore", backups::restore_router())
        .nest("/api/operations", operations::router())
        .route("/api/timeline", get(operations::timeline))
        .route("/health", get(operations::health))
        .route("/ws", get(crate::ws::audit::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Finished operations answer directly; slow ones hand back an id to poll.
pub fn tracked_response<T: Serialize>(tracked: Tracked<T>, success: StatusCode) -> Result<Response, AppError> {
    match tracked {
        Tracked::Finished(Ok(value)) => Ok((success, Json(value)).into_response()),
        Tracked::Finished(Err(e)) => Err(e.into()),
        Tracked::Pending(id) => Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "operation_id": id, "status": "running" })),
        )
            .into_response()),
    }
}

#[cfg(test)]
pub(crate) mod test_support;
