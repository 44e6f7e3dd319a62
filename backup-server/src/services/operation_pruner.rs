use crate::state::AppState;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Periodically forget finished background operations and audit subjects
/// that have been quiet for the same retention period.
pub fn start_operation_pruner(state: Arc<AppState>, cancel: CancellationToken) {
    let retention = chrono::Duration::hours(state.config.operation_retention_hours.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(600));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let removed = state.operations.prune(retention);
                    let subjects = state.audit.prune_idle(retention);
                    tracing::debug!(
                        removed,
                        subjects,
                        running = state.operations.running(),
                        "Operation table and audit replay pruned"
                    );
                }
            }
        }
        tracing::info!("Operation pruner stopped");
    });
}
