use backup_core::config::ScheduleConfig;
use backup_core::{BackupError, BackupType, Orchestrator};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

/// What a scheduled trigger ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledOutcome {
    Created(String),
    NoChanges,
    Skipped(String),
    Failed(String),
}

/// Run one scheduled backup. Busy gates, missing FULL backups and empty
/// increments are expected on a timer and only logged.
pub async fn run_scheduled(orchestrator: &Orchestrator, backup_type: BackupType) -> ScheduledOutcome {
    if let Some(active) = orchestrator.gate().active() {
        tracing::warn!(%backup_type, active = %active.kind, "Skipping scheduled backup: another operation is running");
        return ScheduledOutcome::Skipped(format!("{} in progress", active.kind));
    }

    tracing::info!(%backup_type, "Starting scheduled backup");
    match orchestrator.create_backup(backup_type).await {
        Ok(record) => {
            tracing::info!(backup_id = %record.backup_id, "Scheduled backup created");
            ScheduledOutcome::Created(record.backup_id)
        }
        Err(e) if e.is_no_op() => {
            tracing::info!(%backup_type, detail = %e, "Scheduled backup found nothing to capture");
            ScheduledOutcome::NoChanges
        }
        Err(e @ (BackupError::Prerequisite { .. } | BackupError::Busy(_))) => {
            tracing::warn!(%backup_type, error = %e, "Scheduled backup skipped");
            ScheduledOutcome::Skipped(e.to_string())
        }
        Err(e) => {
            tracing::error!(%backup_type, kind = %e.kind(), error = %e, "Scheduled backup failed");
            ScheduledOutcome::Failed(e.to_string())
        }
    }
}

pub struct BackupScheduler {
    scheduler: Mutex<JobScheduler>,
    orchestrator: Arc<Orchestrator>,
}

impl BackupScheduler {
    pub async fn new(orchestrator: Arc<Orchestrator>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            orchestrator,
        })
    }

    pub async fn schedule(&self, backup_type: BackupType, cron_expression: &str) -> anyhow::Result<()> {
        let orchestrator = self.orchestrator.clone();

        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let orchestrator = orchestrator.clone();
            Box::pin(async move {
                run_scheduled(&orchestrator, backup_type).await;
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(%backup_type, cron = %cron_expression, "Backup scheduled");
        Ok(())
    }

    /// Register the FULL and INCREMENTAL jobs. An empty expression disables that job.
    pub async fn init_schedules(&self, config: &ScheduleConfig) -> anyhow::Result<usize> {
        if !config.enabled {
            tracing::info!("Scheduled backups disabled");
            return Ok(0);
        }

        let mut count = 0;
        for (backup_type, cron) in [
            (BackupType::Full, &config.full_cron),
            (BackupType::Incremental, &config.incremental_cron),
        ] {
            if cron.trim().is_empty() {
                continue;
            }
            if let Err(e) = self.schedule(backup_type, cron).await {
                tracing::error!(%backup_type, cron = %cron, error = %e, "Failed to schedule backup");
            } else {
                count += 1;
            }
        }

        tracing::info!(count, "Cron schedules initialized");
        Ok(count)
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::TestApp;
    use backup_core::orchestrator::gate::OperationKind;

    #[tokio::test]
    async fn test_scheduled_runs() {
        let app = TestApp::new();

        let outcome = run_scheduled(&app.orchestrator, BackupType::Incremental).await;
        assert!(matches!(outcome, ScheduledOutcome::Skipped(ref why) if why.contains("FULL")));

        let outcome = run_scheduled(&app.orchestrator, BackupType::Full).await;
        assert!(matches!(outcome, ScheduledOutcome::Created(ref id) if id.starts_with("full_")));

        // The scripted engine's log never moves.
        let outcome = run_scheduled(&app.orchestrator, BackupType::Incremental).await;
        assert_eq!(outcome, ScheduledOutcome::NoChanges);
    }

    #[tokio::test]
    async fn test_busy_gate_skips_run() {
        let app = TestApp::new();
        let _held = app.orchestrator.gate().try_acquire(OperationKind::Restore).unwrap();

        let outcome = run_scheduled(&app.orchestrator, BackupType::Full).await;
        assert_eq!(outcome, ScheduledOutcome::Skipped("restore in progress".into()));
        assert_eq!(app.orchestrator.store().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_cron_is_reported_not_fatal() {
        let app = TestApp::new();
        let scheduler = BackupScheduler::new(app.orchestrator.clone()).await.unwrap();

        assert!(scheduler.schedule(BackupType::Full, "every sunday").await.is_err());

        let config = ScheduleConfig {
            incremental_cron: "not a cron".into(),
            ..ScheduleConfig::default()
        };
        assert_eq!(scheduler.init_schedules(&config).await.unwrap(), 1);

        let disabled = ScheduleConfig {
            enabled: false,
            ..ScheduleConfig::default()
        };
        assert_eq!(scheduler.init_schedules(&disabled).await.unwrap(), 0);
    }
}
