use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use backup_core::{BackupError, ErrorKind};
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// HTTP status for a backup failure category.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NoChanges => StatusCode::OK,
        ErrorKind::Prerequisite | ErrorKind::Busy | ErrorKind::DuplicateBackup => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Integrity | ErrorKind::BrokenChain => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::EngineControl | ErrorKind::Validation => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::InvalidRecord | ErrorKind::Config => StatusCode::BAD_REQUEST,
        ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Capture | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, Json(json!({ "error": m }))).into_response(),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, Json(json!({ "error": m, "kind": "not_found" }))).into_response(),
            AppError::Backup(e) if e.is_no_op() => (
                StatusCode::OK,
                Json(json!({ "no_changes": true, "detail": e.to_string(), "kind": e.kind() })),
            )
                .into_response(),
            AppError::Backup(e) => {
                let kind = e.kind();
                let status = status_for(kind);
                if status.is_server_error() {
                    tracing::error!(%kind, error = %e, "Backup operation failed");
                } else {
                    tracing::warn!(%kind, error = %e, "Backup operation rejected");
                }
                (status, Json(json!({ "error": e.to_string(), "kind": kind }))).into_response()
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "Internal server error", "kind": "internal" })),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backup_core::restore::{RestoreState, RollbackStatus};

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_no_changes_is_ok() {
        let err = AppError::from(BackupError::NoChanges {
            since: "full_20240107_020000".into(),
            position: "0/3000000".into(),
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["no_changes"], true);
        assert_eq!(body["kind"], "no_changes");
    }

    #[tokio::test]
    async fn test_restore_failure_reports_original_kind() {
        let err = AppError::from(BackupError::RestoreAborted {
            backup_id: "full_20240107_020000".into(),
            failed_in: RestoreState::StartingEngine,
            rollback: RollbackStatus::RolledBack,
            source: Box::new(BackupError::EngineControl("pg_ctl start exited with 1".into())),
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["kind"], "engine_control");
        assert!(body["error"].as_str().unwrap().contains("STARTING_ENGINE"));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::Prerequisite), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::Busy), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::DuplicateBackup), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::Integrity), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(ErrorKind::BrokenChain), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(ErrorKind::Validation), StatusCode::SERVICE_UNAVAILABLE);
    }
}
