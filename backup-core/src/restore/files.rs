//! Repository asset tree restore: stage next to the live tree, then swap.

use crate::archive::{extract_zst, FILES_ARCHIVE};
use crate::chain::record::BackupRecord;
use crate::fs::tree::{recreate_private_dir, remove_dir_if_exists, sibling_path};
use crate::layout::BackupLayout;
use crate::utils::errors::Result;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Rebuild `files_dir` from the FULL archive overlaid with every incremental
/// archive in chain order. The live tree is only replaced once staging
/// succeeded.
pub fn restore_files(files_dir: &Path, layout: &BackupLayout, chain: &[BackupRecord], stamp: &str) -> Result<usize> {
    let staging = sibling_path(files_dir, "restore", stamp);
    recreate_private_dir(&staging)?;

    let mut restored = 0usize;
    for record in chain {
        let archive = layout.files_dir(&record.backup_id).join(FILES_ARCHIVE);
        if !archive.is_file() {
            continue;
        }
        match extract_zst(&archive, &staging) {
            Ok(count) => restored += count,
            Err(e) => {
                let _ = remove_dir_if_exists(&staging);
                return Err(e);
            }
        }
    }

    swap_into_place(&staging, files_dir, stamp)?;
    info!(files_dir = %files_dir.display(), entries = restored, "Repository files restored");
    Ok(restored)
}

fn swap_into_place(staging: &Path, live: &Path, stamp: &str) -> Result<()> {
    if let Some(parent) = live.parent() {
        fs::create_dir_all(parent)?;
    }

    let displaced = sibling_path(live, "replaced", stamp);
    let had_live = live.exists();
    if had_live {
        fs::rename(live, &displaced)?;
    }

    if let Err(e) = fs::rename(staging, live) {
        if had_live {
            let _ = fs::rename(&displaced, live);
        }
        let _ = remove_dir_if_exists(staging);
        return Err(e.into());
    }

    if had_live {
        if let Err(e) = remove_dir_if_exists(&displaced) {
            warn!(path = %displaced.display(), error = %e, "Could not remove replaced file tree");
        }
    }
    Ok(())
}
