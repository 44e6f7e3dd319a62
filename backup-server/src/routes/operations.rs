use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use backup_core::orchestrator::tracker::OperationStatus;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/{id}", get(get_operation))
}

async fn get_operation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<OperationStatus>, AppError> {
    state
        .operations
        .get(&id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Operation {} not found", id)))
}

pub async fn timeline(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let timeline_id = state.orchestrator.current_timeline().await?;
    Ok(Json(json!({ "timeline_id": timeline_id })))
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "active_operation": state.orchestrator.gate().active(),
        "running_operations": state.operations.running(),
    }))
}
