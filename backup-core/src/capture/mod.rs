//! Physical Capture Driver.
//!
//! A FULL capture delegates to the engine's native base backup. An
//! INCREMENTAL forces a segment switch, then copies the WAL segments written
//! since the parent backup, gzip-compressed, next to a `backup.info` sidecar.
//!
//! Segment range for an incremental, with `seg` the WAL segment size:
//! - first: the parent's position segment, or the segment before it when the
//!   parent is FULL (its archived copy of that segment may be partial)
//! - last: the segment ending at the post-switch position

pub mod sidecar;

use crate::archive::gzip;
use crate::chain::record::{BackupRecord, BackupType};
use crate::engine::{segment_file_name, EngineDriver, LogPosition, BASE_ARCHIVE};
use crate::utils::errors::{BackupError, Result};
use sidecar::WalSidecar;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// What a capture left on disk and where the engine log stood afterwards.
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub location: PathBuf,
    pub wal_position: LogPosition,
    /// Segment files written (incremental only), oldest first.
    pub wal_files: Vec<String>,
}

pub struct PhysicalCapture {
    engine: Arc<dyn EngineDriver>,
}

impl PhysicalCapture {
    pub fn new(engine: Arc<dyn EngineDriver>) -> Self {
        Self { engine }
    }

    pub async fn capture_full(&self, dest_dir: &Path) -> Result<CaptureOutcome> {
        tokio::fs::create_dir_all(dest_dir).await?;
        self.engine.capture_full(dest_dir).await?;

        if !dest_dir.join(BASE_ARCHIVE).is_file() {
            return Err(BackupError::Capture(format!(
                "native backup finished without producing {}",
                BASE_ARCHIVE
            )));
        }

        let wal_position = self.engine.current_log_position().await?;
        info!(dest = %dest_dir.display(), %wal_position, "Full capture complete");
        Ok(CaptureOutcome {
            location: dest_dir.to_path_buf(),
            wal_position,
            wal_files: Vec::new(),
        })
    }

    /// Capture the WAL written since `since`. Fails with
    /// [`BackupError::NoChanges`] when the log has not advanced.
    pub async fn capture_incremental(
        &self,
        dest_dir: &Path,
        backup_id: &str,
        since: &BackupRecord,
        timeline_id: u32,
    ) -> Result<CaptureOutcome> {
        let segment_size = self.engine.wal_segment_size();

        self.engine.switch_log().await?;
        let current = self.engine.current_log_position().await?;
        if current <= since.wal_position {
            return Err(BackupError::NoChanges {
                since: since.backup_id.clone(),
                position: current.to_string(),
            });
        }

        let first = match since.backup_type {
            BackupType::Full => since.wal_position.previous_segment(segment_size),
            BackupType::Incremental => since.wal_position.segment(segment_size),
        };
        let last = current.previous_segment(segment_size);
        let names: Vec<String> = (first..=last)
            .map(|s| segment_file_name(timeline_id, s, segment_size))
            .collect();
        debug!(backup_id, first = %names[0], count = names.len(), "WAL segment range");

        tokio::fs::create_dir_all(dest_dir).await?;
        let wal_dir = self.engine.wal_dir();
        let dest = dest_dir.to_path_buf();
        let to_copy = names.clone();
        tokio::task::spawn_blocking(move || copy_segments(&wal_dir, &dest, &to_copy)).await??;

        let sidecar = WalSidecar {
            backup_id: backup_id.to_string(),
            backup_type: BackupType::Incremental,
            parent_backup_id: since.backup_id.clone(),
            start_wal: since.wal_position.to_string(),
            end_wal: current.to_string(),
            wal_filename: names[names.len() - 1].clone(),
            wal_files: names.clone(),
        };
        sidecar.write(dest_dir)?;

        info!(
            backup_id,
            parent = %since.backup_id,
            start = %since.wal_position,
            end = %current,
            segments = names.len(),
            "Incremental capture complete"
        );
        Ok(CaptureOutcome {
            location: dest_dir.to_path_buf(),
            wal_position: current,
            wal_files: names,
        })
    }
}

fn copy_segments(wal_dir: &Path, dest_dir: &Path, names: &[String]) -> Result<()> {
    for name in names {
        let source = wal_dir.join(name);
        if !source.is_file() {
            return Err(BackupError::Capture(format!(
                "WAL segment {} is no longer in {}",
                name,
                wal_dir.display()
            )));
        }
        gzip::compress_file(&source, &dest_dir.join(format!("{}.gz", name)))?;
    }
    Ok(())
}
