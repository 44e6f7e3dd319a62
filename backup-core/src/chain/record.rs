use crate::engine::LogPosition;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackupType {
    Full,
    Incremental,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "FULL",
            BackupType::Incremental => "INCREMENTAL",
        }
    }

    /// Prefix of backup ids of this type.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FULL" => Ok(BackupType::Full),
            "INCREMENTAL" | "INCR" => Ok(BackupType::Incremental),
            other => Err(BackupError::InvalidRecord(format!("unknown backup type '{}'", other))),
        }
    }
}

/// Canonical id: type prefix plus capture time at second resolution.
pub fn backup_id_for(backup_type: BackupType, at: DateTime<Utc>) -> String {
    format!("{}_{}", backup_type.id_prefix(), at.format("%Y%m%d_%H%M%S"))
}

/// One committed backup. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub backup_id: String,
    pub backup_type: BackupType,
    pub backup_date: DateTime<Utc>,
    pub timeline_id: u32,
    pub database_location: String,
    pub files_location: Option<String>,
    pub total_size_bytes: u64,
    pub parent_backup_id: Option<String>,
    pub wal_position: LogPosition,
}

impl BackupRecord {
    pub fn full(
        backup_id: String,
        backup_date: DateTime<Utc>,
        timeline_id: u32,
        wal_position: LogPosition,
    ) -> Self {
        Self {
            backup_id,
            backup_type: BackupType::Full,
            backup_date,
            timeline_id,
            database_location: String::new(),
            files_location: None,
            total_size_bytes: 0,
            parent_backup_id: None,
            wal_position,
        }
    }

    pub fn incremental(
        backup_id: String,
        backup_date: DateTime<Utc>,
        timeline_id: u32,
        wal_position: LogPosition,
        parent_backup_id: String,
    ) -> Self {
        Self {
            backup_type: BackupType::Incremental,
            parent_backup_id: Some(parent_backup_id),
            ..Self::full(backup_id, backup_date, timeline_id, wal_position)
        }
    }

    pub fn is_full(&self) -> bool {
        self.backup_type == BackupType::Full
    }

    /// Structural invariants: FULL has no parent, INCREMENTAL has one that is not itself.
    pub fn validate(&self) -> Result<()> {
        if self.backup_id.trim().is_empty() {
            return Err(BackupError::InvalidRecord("empty backup_id".into()));
        }
        if self.backup_id.contains(['/', '\\']) || self.backup_id.starts_with('.') {
            return Err(BackupError::InvalidRecord(format!(
                "backup_id '{}' is not a plain directory name",
                self.backup_id
            )));
        }
        match (self.backup_type, self.parent_backup_id.as_deref()) {
            (BackupType::Full, None) => Ok(()),
            (BackupType::Full, Some(parent)) => Err(BackupError::InvalidRecord(format!(
                "FULL backup {} must not have a parent (got {})",
                self.backup_id, parent
            ))),
            (BackupType::Incremental, None) => Err(BackupError::InvalidRecord(format!(
                "INCREMENTAL backup {} has no parent",
                self.backup_id
            ))),
            (BackupType::Incremental, Some(parent)) if parent == self.backup_id => {
                Err(BackupError::InvalidRecord(format!(
                    "backup {} lists itself as parent",
                    self.backup_id
                )))
            }
            (BackupType::Incremental, Some(_)) => Ok(()),
        }
    }
}
