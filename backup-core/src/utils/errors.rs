//! Error taxonomy for backup and restore operations.
//!
//! Every failure carries a stable [`ErrorKind`] for callers that branch on the
//! category, and a human-readable detail through `Display`.

use crate::restore::{RestoreState, RollbackStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("No FULL backup exists in timeline {timeline}; create a full backup first")]
    Prerequisite { timeline: u32 },

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("No changes since backup {since} (log position {position})")]
    NoChanges { since: String, position: String },

    #[error("Integrity check failed for {backup_id}: {detail}")]
    Integrity { backup_id: String, detail: String },

    #[error("Broken backup chain at {backup_id}: {detail}")]
    BrokenChain { backup_id: String, detail: String },

    #[error("Engine control error: {0}")]
    EngineControl(String),

    #[error("Post-restore validation failed: {0}")]
    Validation(String),

    #[error("Restore of {backup_id} failed during {failed_in}: {source} (rollback: {rollback})")]
    RestoreAborted {
        backup_id: String,
        failed_in: RestoreState,
        rollback: RollbackStatus,
        source: Box<BackupError>,
    },

    #[error("Backup not found: {0}")]
    NotFound(String),

    #[error("Another operation is in progress: {0}")]
    Busy(String),

    #[error("Backup {0} already exists")]
    DuplicateBackup(String),

    #[error("Operation cancelled before the engine was stopped")]
    Cancelled,

    #[error("Invalid backup record: {0}")]
    InvalidRecord(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Catalog error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Catalog pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

/// Stable category of a [`BackupError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Prerequisite,
    Capture,
    NoChanges,
    Integrity,
    BrokenChain,
    EngineControl,
    Validation,
    NotFound,
    Busy,
    DuplicateBackup,
    Cancelled,
    InvalidRecord,
    Config,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Prerequisite => "prerequisite",
            ErrorKind::Capture => "capture",
            ErrorKind::NoChanges => "no_changes",
            ErrorKind::Integrity => "integrity",
            ErrorKind::BrokenChain => "broken_chain",
            ErrorKind::EngineControl => "engine_control",
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Busy => "busy",
            ErrorKind::DuplicateBackup => "duplicate_backup",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidRecord => "invalid_record",
            ErrorKind::Config => "config",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BackupError {
    /// Category of this error. A wrapped restore failure reports the kind of
    /// the error that aborted it.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::Prerequisite { .. } => ErrorKind::Prerequisite,
            BackupError::Capture(_) => ErrorKind::Capture,
            BackupError::NoChanges { .. } => ErrorKind::NoChanges,
            BackupError::Integrity { .. } => ErrorKind::Integrity,
            BackupError::BrokenChain { .. } => ErrorKind::BrokenChain,
            BackupError::EngineControl(_) => ErrorKind::EngineControl,
            BackupError::Validation(_) => ErrorKind::Validation,
            BackupError::RestoreAborted { source, .. } => source.kind(),
            BackupError::NotFound(_) => ErrorKind::NotFound,
            BackupError::Busy(_) => ErrorKind::Busy,
            BackupError::DuplicateBackup(_) => ErrorKind::DuplicateBackup,
            BackupError::Cancelled => ErrorKind::Cancelled,
            BackupError::InvalidRecord(_) => ErrorKind::InvalidRecord,
            BackupError::Config(_) => ErrorKind::Config,
            BackupError::Archive(_)
            | BackupError::Io(_)
            | BackupError::Database(_)
            | BackupError::Pool(_)
            | BackupError::Serialization(_)
            | BackupError::Task(_) => ErrorKind::Internal,
        }
    }

    /// `NoChanges` is reported to the caller but is not a failure.
    pub fn is_no_op(&self) -> bool {
        matches!(self, BackupError::NoChanges { .. })
    }

    pub(crate) fn integrity(backup_id: &str, detail: impl Into<String>) -> Self {
        BackupError::Integrity {
            backup_id: backup_id.to_string(),
            detail: detail.into(),
        }
    }

    pub(crate) fn broken_chain(backup_id: &str, detail: impl Into<String>) -> Self {
        BackupError::BrokenChain {
            backup_id: backup_id.to_string(),
            detail: detail.into(),
        }
    }
}

impl From<tokio::task::JoinError> for BackupError {
    fn from(e: tokio::task::JoinError) -> Self {
        BackupError::Task(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
