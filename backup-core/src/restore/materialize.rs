//! Rebuilding a data directory from a verified backup chain.

use crate::archive::gzip;
use crate::capture::sidecar::WalSidecar;
use crate::chain::record::BackupRecord;
use crate::engine::{BASE_ARCHIVE, WAL_ARCHIVE, WAL_DIR};
use crate::fs::tree::recreate_private_dir;
use crate::layout::BackupLayout;
use crate::utils::errors::{BackupError, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

pub const RECOVERY_SIGNAL: &str = "recovery.signal";
pub const AUTO_CONF: &str = "postgresql.auto.conf";
const BACKUP_LABEL: &str = "backup_label";
const TABLESPACE_MAP: &str = "tablespace_map";
const STALE_MARKERS: [&str; 2] = ["backup_label.old", "tablespace_map.old"];

#[derive(Debug, Clone, Default)]
pub struct Materialized {
    pub base_files: usize,
    pub wal_segments: usize,
    /// True when the engine must replay WAL on startup.
    pub needs_recovery: bool,
}

/// Replace `data_dir` with the state described by `chain` (root first).
///
/// A lone FULL backup is laid down as-is with its backup label removed; the
/// caller resets write-ahead state afterwards. A chain with incrementals gets
/// every captured segment injected into `pg_wal` and recovery directives that
/// replay to the end of the available log.
pub fn materialize(data_dir: &Path, layout: &BackupLayout, chain: &[BackupRecord]) -> Result<Materialized> {
    let base = chain
        .first()
        .ok_or_else(|| BackupError::InvalidRecord("empty restore chain".into()))?;
    let base_db = layout.database_dir(&base.backup_id);

    recreate_private_dir(data_dir)?;
    let mut summary = Materialized {
        base_files: gzip::extract_tar_gz(&base_db.join(BASE_ARCHIVE), data_dir)?,
        ..Materialized::default()
    };

    let wal_dir = data_dir.join(WAL_DIR);
    fs::create_dir_all(&wal_dir)?;
    let wal_archive = base_db.join(WAL_ARCHIVE);
    if wal_archive.is_file() {
        summary.wal_segments += gzip::extract_tar_gz(&wal_archive, &wal_dir)?;
    }
    debug!(backup_id = %base.backup_id, files = summary.base_files, "Base extracted");

    if chain.len() == 1 {
        remove_if_present(&data_dir.join(BACKUP_LABEL))?;
        remove_if_present(&data_dir.join(TABLESPACE_MAP))?;
        info!(backup_id = %base.backup_id, "Materialized FULL backup");
        return Ok(summary);
    }

    for pair in chain.windows(2) {
        let (parent, incremental) = (&pair[0], &pair[1]);
        let db_dir = layout.database_dir(&incremental.backup_id);
        let sidecar = WalSidecar::read(&db_dir)?;
        if sidecar.parent_backup_id != parent.backup_id {
            return Err(BackupError::broken_chain(
                &incremental.backup_id,
                format!(
                    "{} names parent {} but the chain has {}",
                    crate::capture::sidecar::SIDECAR_FILE,
                    sidecar.parent_backup_id,
                    parent.backup_id
                ),
            ));
        }

        for name in &sidecar.wal_files {
            gzip::decompress_file(&db_dir.join(format!("{}.gz", name)), &wal_dir.join(name))?;
            summary.wal_segments += 1;
        }
        debug!(backup_id = %incremental.backup_id, segments = sidecar.wal_files.len(), "Injected WAL");
    }

    write_recovery_directives(data_dir)?;
    for marker in STALE_MARKERS {
        remove_if_present(&data_dir.join(marker))?;
    }
    summary.needs_recovery = true;

    info!(
        target_id = %chain[chain.len() - 1].backup_id,
        links = chain.len(),
        segments = summary.wal_segments,
        "Materialized backup chain"
    );
    Ok(summary)
}

/// Settings [`materialize`] appends to `postgresql.auto.conf` for a chain restore.
const RECOVERY_SETTINGS: [&str; 3] = ["restore_command", "recovery_target_timeline", "recovery_target_action"];

/// Drop the recovery settings and signal file once the engine has promoted,
/// so a later restart does not try to replay from the restore's `pg_wal` copy.
pub fn clear_recovery_directives(data_dir: &Path) -> Result<()> {
    remove_if_present(&data_dir.join(RECOVERY_SIGNAL))?;

    let conf_path = data_dir.join(AUTO_CONF);
    let conf = match fs::read_to_string(&conf_path) {
        Ok(conf) => conf,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let kept: Vec<&str> = conf
        .lines()
        .filter(|line| {
            let key = line.split('=').next().unwrap_or_default().trim();
            !RECOVERY_SETTINGS.contains(&key)
        })
        .collect();
    let mut out = kept.join("\n").trim_end().to_string();
    out.push('\n');
    fs::write(&conf_path, out)?;
    Ok(())
}

fn write_recovery_directives(data_dir: &Path) -> Result<()> {
    fs::write(data_dir.join(RECOVERY_SIGNAL), b"")?;

    let wal_dir = data_dir.join(WAL_DIR);
    let mut conf = OpenOptions::new()
        .create(true)
        .append(true)
        .open(data_dir.join(AUTO_CONF))?;
    writeln!(conf)?;
    writeln!(conf, "restore_command = 'cp \"{}/%f\" \"%p\"'", wal_dir.display())?;
    writeln!(conf, "recovery_target_timeline = 'latest'")?;
    writeln!(conf, "recovery_target_action = 'promote'")?;
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}
