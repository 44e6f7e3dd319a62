use crate::error::AppError;
use crate::routes::tracked_response;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use backup_core::{BackupRecord, BackupType};
use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_backups).post(create_backup))
        .route("/{id}", get(get_backup))
        .route("/{id}/download", get(download_backup))
        .route("/{id}/restore", post(restore_backup))
}

pub fn restore_router() -> Router<Arc<AppState>> {
    Router::new().route("/upload", post(upload_and_restore))
}

async fn list_backups(State(state): State<Arc<AppState>>) -> Result<Json<Vec<BackupRecord>>, AppError> {
    let orchestrator = state.orchestrator.clone();
    let backups = tokio::task::spawn_blocking(move || orchestrator.list_backups())
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(backups))
}

async fn get_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BackupRecord>, AppError> {
    let orchestrator = state.orchestrator.clone();
    let record = tokio::task::spawn_blocking(move || orchestrator.get_backup(&id))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(record))
}

#[derive(Deserialize)]
pub struct CreateBackupBody {
    #[serde(rename = "type")]
    pub backup_type: String,
}

async fn create_backup(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateBackupBody>,
) -> Result<Response, AppError> {
    let backup_type: BackupType = body.backup_type.parse()?;

    let orchestrator = state.orchestrator.clone();
    let tracked = state
        .operations
        .run_with_timeout(
            &format!("create {}", backup_type),
            state.request_timeout,
            async move { orchestrator.create_backup(backup_type).await },
        )
        .await;
    tracked_response(tracked, StatusCode::CREATED)
}

async fn restore_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let orchestrator = state.orchestrator.clone();
    let cancel = state.shutdown.child_token();
    let label = format!("restore {}", id);
    let tracked = state
        .operations
        .run_with_timeout(&label, state.request_timeout, async move {
            orchestrator.restore_backup(&id, &cancel).await
        })
        .await;
    tracked_response(tracked, StatusCode::OK)
}

async fn download_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let bundle = state.orchestrator.download_backup(&id).await?;

    let file = tokio::fs::File::open(&bundle)
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to open bundle: {}", e)))?;
    // The open handle keeps the bytes readable after the unlink.
    if let Err(e) = tokio::fs::remove_file(&bundle).await {
        tracing::warn!(path = %bundle.display(), error = %e, "Could not remove download bundle");
    }

    let body = Body::from_stream(ReaderStream::new(file));
    let disposition = format!("attachment; filename=\"{}.tar.zst\"", id);

    Ok((
        [
            (header::CONTENT_TYPE, "application/zstd".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    ))
}

/// Import a bundle sent as the raw request body, then restore it.
async fn upload_and_restore(State(state): State<Arc<AppState>>, request: Request) -> Result<Response, AppError> {
    tokio::fs::create_dir_all(&state.upload_dir)
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to create upload directory: {}", e)))?;
    let upload = state
        .upload_dir
        .join(format!("upload-{}.tar.zst", uuid::Uuid::new_v4()));

    let written = match receive_body(request, &upload).await {
        Ok(written) => written,
        Err(e) => {
            let _ = tokio::fs::remove_file(&upload).await;
            return Err(e);
        }
    };
    if written == 0 {
        let _ = tokio::fs::remove_file(&upload).await;
        return Err(AppError::BadRequest("Empty bundle".into()));
    }
    tracing::info!(path = %upload.display(), bytes = written, "Bundle received");

    let orchestrator = state.orchestrator.clone();
    let cancel = state.shutdown.child_token();
    let tracked = state
        .operations
        .run_with_timeout("restore from upload", state.request_timeout, async move {
            let result = orchestrator.restore_from_file(&upload, &cancel).await;
            if let Err(e) = tokio::fs::remove_file(&upload).await {
                tracing::warn!(path = %upload.display(), error = %e, "Could not remove uploaded bundle");
            }
            result
        })
        .await;
    tracked_response(tracked, StatusCode::OK)
}

async fn receive_body(request: Request, dest: &std::path::Path) -> Result<u64, AppError> {
    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Create file error: {}", e)))?;
    let mut stream = request.into_body().into_data_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| AppError::BadRequest(format!("Read error: {}", e)))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Write error: {}", e)))?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Flush error: {}", e)))?;
    Ok(written)
}
