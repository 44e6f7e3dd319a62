//! Capability interface over the relational database engine.
//!
//! The capture driver and the restore engine only talk to [`EngineDriver`],
//! so a test double can stand in for a live cluster.

pub mod postgres;

use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub use postgres::PostgresDriver;

/// Base archive produced by the native full backup.
pub const BASE_ARCHIVE: &str = "base.tar.gz";
/// WAL needed to make the base archive consistent.
pub const WAL_ARCHIVE: &str = "pg_wal.tar.gz";
/// WAL directory inside a data directory.
pub const WAL_DIR: &str = "pg_wal";

#[async_trait]
pub trait EngineDriver: Send + Sync {
    /// Native full physical backup of the running engine into `dest`,
    /// leaving [`BASE_ARCHIVE`] and [`WAL_ARCHIVE`] there.
    async fn capture_full(&self, dest: &Path) -> Result<()>;

    /// Force a WAL segment boundary. Returns the switch position.
    async fn switch_log(&self) -> Result<LogPosition>;

    async fn current_log_position(&self) -> Result<LogPosition>;

    /// Recovery timeline the engine is currently on.
    async fn timeline_id(&self) -> Result<u32>;

    /// Issue a start request. Callers poll [`EngineDriver::ping`] for readiness.
    async fn start(&self) -> Result<()>;

    /// Issue a stop request. Callers poll [`EngineDriver::is_running`] for completion.
    async fn stop(&self) -> Result<()>;

    async fn is_running(&self) -> Result<bool>;

    /// Trivial round-trip query.
    async fn ping(&self) -> Result<()>;

    /// Discard write-ahead state in `data_dir` so it starts as a fresh instance.
    async fn reset_wal(&self, data_dir: &Path) -> Result<()>;

    fn data_dir(&self) -> &Path;

    fn wal_segment_size(&self) -> u64;

    fn wal_dir(&self) -> PathBuf {
        self.data_dir().join(WAL_DIR)
    }
}

/// Engine log sequence number, written `XXXXXXXX/XXXXXXXX` in hex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LogPosition(pub u64);

impl LogPosition {
    /// Number of the WAL segment holding this position.
    pub fn segment(self, segment_size: u64) -> u64 {
        self.0 / segment_size
    }

    /// Segment holding the last byte before this position.
    pub fn previous_segment(self, segment_size: u64) -> u64 {
        self.0.saturating_sub(1) / segment_size
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for LogPosition {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || BackupError::InvalidRecord(format!("invalid log position '{}'", s));
        let (hi, lo) = s.trim().split_once('/').ok_or_else(invalid)?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| invalid())?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| invalid())?;
        Ok(LogPosition(((hi as u64) << 32) | lo as u64))
    }
}

impl TryFrom<String> for LogPosition {
    type Error = BackupError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<LogPosition> for String {
    fn from(value: LogPosition) -> Self {
        value.to_string()
    }
}

/// WAL segment file name: timeline, log id and segment, eight hex digits each.
pub fn segment_file_name(timeline: u32, segment: u64, segment_size: u64) -> String {
    let per_log_id = 0x1_0000_0000u64 / segment_size;
    format!(
        "{:08X}{:08X}{:08X}",
        timeline,
        segment / per_log_id,
        segment % per_log_id
    )
}

/// True for a bare segment file name: 24 hex digits, nothing else.
pub fn is_segment_file_name(name: &str) -> bool {
    name.len() == 24 && name.bytes().all(|b| b.is_ascii_hexdigit())
}
