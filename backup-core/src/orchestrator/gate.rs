//! One-operation-at-a-time gate shared by manual calls and scheduled runs.

use crate::chain::record::BackupType;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    FullBackup,
    IncrementalBackup,
    Restore,
    Import,
}

impl From<BackupType> for OperationKind {
    fn from(value: BackupType) -> Self {
        match value {
            BackupType::Full => OperationKind::FullBackup,
            BackupType::Incremental => OperationKind::IncrementalBackup,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::FullBackup => "full backup",
            OperationKind::IncrementalBackup => "incremental backup",
            OperationKind::Restore => "restore",
            OperationKind::Import => "restore from file",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ActiveOperation {
    pub kind: OperationKind,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct OperationGate {
    active: Arc<Mutex<Option<ActiveOperation>>>,
}

impl OperationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the single permit, or fail with [`BackupError::Busy`] naming the holder.
    pub fn try_acquire(&self, kind: OperationKind) -> Result<GateGuard> {
        let mut slot = self.slot();
        if let Some(current) = *slot {
            return Err(BackupError::Busy(format!(
                "{} running since {}",
                current.kind,
                current.since.format("%Y-%m-%d %H:%M:%S UTC")
            )));
        }
        *slot = Some(ActiveOperation {
            kind,
            since: Utc::now(),
        });
        debug!(%kind, "Operation gate acquired");
        Ok(GateGuard {
            gate: self.clone(),
            kind,
        })
    }

    pub fn active(&self) -> Option<ActiveOperation> {
        *self.slot()
    }

    fn slot(&self) -> MutexGuard<'_, Option<ActiveOperation>> {
        // A panic while holding the lock leaves a valid Option behind.
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases the gate when dropped.
#[derive(Debug)]
pub struct GateGuard {
    gate: OperationGate,
    kind: OperationKind,
}

impl GateGuard {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        *self.gate.slot() = None;
        debug!(kind = %self.kind, "Operation gate released");
    }
}
