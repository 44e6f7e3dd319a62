use crate::config::AppConfig;
use crate::ws::audit::AuditBroadcaster;
use backup_core::orchestrator::tracker::OperationTracker;
use backup_core::Orchestrator;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const GATE_POLL: Duration = Duration::from_millis(200);

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub operations: OperationTracker,
    pub audit: AuditBroadcaster,
    pub config: AppConfig,
    /// How long a request waits before it gets a pollable operation id
    pub request_timeout: Duration,
    /// Uploaded bundles are staged here before import
    pub upload_dir: PathBuf,
    /// Cancelled on shutdown; restores still before the engine stop give up
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        audit: AuditBroadcaster,
        config: AppConfig,
        request_timeout: Duration,
        upload_dir: PathBuf,
    ) -> Self {
        Self {
            orchestrator,
            operations: OperationTracker::new(),
            audit,
            config,
            request_timeout,
            upload_dir,
            shutdown: CancellationToken::new(),
        }
    }
    /// Let in-flight work finish before the process exits. Tracked requests
    /// are awaited first, then any scheduled run still holding the gate.
    pub async fn wait_for_background_work(&self) {
        self.operations.drain().await;

        let gate = self.orchestrator.gate();
        if let Some(active) = gate.active() {
            tracing::info!(kind = %active.kind, since = %active.since, "Waiting for running operation");
        }
        while gate.active().is_some() {
            tokio::time::sleep(GATE_POLL).await;
        }
    }
}
