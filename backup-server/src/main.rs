mod config;
mod error;
mod routes;
mod services;
mod state;
mod ws;

use crate::config::AppConfig;
use crate::services::backup_scheduler::BackupScheduler;
use crate::services::operation_pruner::start_operation_pruner;
use crate::state::AppState;
use crate::ws::audit::AuditBroadcaster;
use backup_core::events::EventSink;
use backup_core::{utils, Orchestrator};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_config = AppConfig::from_env();
    let backup_config = app_config.load_backup_config()?;

    let log_level = app_config
        .log_level
        .clone()
        .unwrap_or_else(|| backup_config.log.level.clone());
    utils::logger::init(&log_level)?;
    tracing::info!("Starting backup server on port {}", app_config.port);

    // Every orchestrator event also reaches WebSocket subscribers
    let audit = AuditBroadcaster::new(app_config.replay_capacity);
    let sink: Arc<dyn EventSink> = Arc::new(audit.clone());
    let orchestrator = Arc::new(Orchestrator::from_config(&backup_config, Some(sink))?);

    match orchestrator.current_timeline().await {
        Ok(timeline) => tracing::info!(timeline, "Engine reachable"),
        Err(e) => tracing::warn!(error = %e, "Engine not reachable at startup"),
    }

    let state = Arc::new(AppState::new(
        orchestrator.clone(),
        audit,
        app_config.clone(),
        Duration::from_secs(backup_config.schedule.request_timeout_secs),
        backup_config.storage.work_dir.join("uploads"),
    ));

    let cancel = state.shutdown.clone();
    start_operation_pruner(state.clone(), cancel.clone());

    // Initialize cron scheduler
    let scheduler = match BackupScheduler::new(orchestrator.clone()).await {
        Ok(s) => {
            if let Err(e) = s.init_schedules(&backup_config.schedule).await {
                tracing::warn!("Failed to initialize schedules: {}", e);
            }
            if let Err(e) = s.start().await {
                tracing::warn!("Failed to start scheduler: {}", e);
            }
            Some(s)
        }
        Err(e) => {
            tracing::warn!("Failed to create scheduler: {}", e);
            None
        }
    };

    let app = routes::create_router(state.clone());

    let addr = format!("0.0.0.0:{}", app_config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    tracing::info!("Shutting down...");
    cancel.cancel();

    if let Some(s) = scheduler {
        if let Err(e) = s.shutdown().await {
            tracing::warn!("Scheduler shutdown error: {}", e);
        }
    }

    // A restore past the engine stop must reach DONE or finish rolling back.
    state.wait_for_background_work().await;
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
        _ = cancel.cancelled() => {},
    }

    cancel.cancel();
}
