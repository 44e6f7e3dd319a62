//! Notifications for the audit trail.
//!
//! The orchestrator and restore engine report progress to an [`EventSink`].
//! The default sink writes structured log lines; the server forwards the same
//! events to its WebSocket subscribers.

use crate::chain::record::{BackupRecord, BackupType};
use crate::restore::{RestoreState, RollbackStatus};
use crate::utils::errors::{BackupError, ErrorKind};
use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackupEvent {
    BackupStarted {
        backup_type: BackupType,
    },
    BackupCreated {
        record: BackupRecord,
    },
    BackupFailed {
        backup_type: BackupType,
        kind: ErrorKind,
        detail: String,
    },
    NoChanges {
        since: String,
    },
    RestoreStateChanged {
        backup_id: String,
        state: RestoreState,
    },
    RestoreCompleted {
        backup_id: String,
        chain_length: usize,
    },
    RestoreFailed {
        backup_id: String,
        failed_in: RestoreState,
        rollback: RollbackStatus,
        kind: ErrorKind,
        detail: String,
    },
}

impl BackupEvent {
    pub fn backup_failed(backup_type: BackupType, err: &BackupError) -> Self {
        BackupEvent::BackupFailed {
            backup_type,
            kind: err.kind(),
            detail: err.to_string(),
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: BackupEvent);
}

/// Writes every event as a log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: BackupEvent) {
        match &event {
            BackupEvent::BackupStarted { backup_type } => info!(%backup_type, "[AUDIT] Backup started"),
            BackupEvent::BackupCreated { record } => info!(
                backup_id = %record.backup_id,
                backup_type = %record.backup_type,
                size = record.total_size_bytes,
                "[AUDIT] Backup created"
            ),
            BackupEvent::BackupFailed { backup_type, kind, detail } => {
                error!(%backup_type, %kind, %detail, "[AUDIT] Backup failed")
            }
            BackupEvent::NoChanges { since } => info!(%since, "[AUDIT] No changes since last backup"),
            BackupEvent::RestoreStateChanged { backup_id, state } => {
                info!(%backup_id, %state, "[AUDIT] Restore state")
            }
            BackupEvent::RestoreCompleted { backup_id, chain_length } => {
                info!(%backup_id, chain_length, "[AUDIT] Restore completed")
            }
            BackupEvent::RestoreFailed { backup_id, failed_in, rollback, kind, detail } => warn!(
                %backup_id,
                %failed_in,
                %rollback,
                %kind,
                %detail,
                "[AUDIT] Restore failed"
            ),
        }
    }
}
