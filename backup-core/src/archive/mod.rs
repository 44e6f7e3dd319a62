//! Repository File Archiver.
//!
//! Tars and zstd-compresses the repository asset tree, either whole or only
//! the files modified since a given instant. Entry names are the files'
//! relative paths so a restore can re-root them anywhere.

pub mod gzip;

use crate::fs::walker::{is_safe_relative, walk_files, FileInfo, WalkOptions};
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tar::{Archive, Builder};
use tracing::info;

/// Asset archive written inside `backups/<id>/files/`.
pub const FILES_ARCHIVE: &str = "files.tar.zst";

#[derive(Debug, Clone)]
pub struct FileArchiver {
    compression_level: i32,
}

impl Default for FileArchiver {
    fn default() -> Self {
        Self { compression_level: 3 }
    }
}

impl FileArchiver {
    pub fn new(compression_level: i32) -> Self {
        Self { compression_level }
    }

    pub fn compression_level(&self) -> i32 {
        self.compression_level
    }

    /// Archive the entire tree. A missing tree produces an empty archive.
    pub fn archive_full(&self, source: &Path, dest_dir: &Path) -> Result<PathBuf> {
        let files = walk_files(source, &WalkOptions::default())?;
        let archive = dest_dir.join(FILES_ARCHIVE);
        self.write_archive(&files, &archive)?;
        info!(source = %source.display(), files = files.len(), "Archived repository files (full)");
        Ok(archive)
    }

    /// Archive only files modified after `since`. Returns `None` when nothing changed.
    pub fn archive_incremental(
        &self,
        source: &Path,
        dest_dir: &Path,
        since: DateTime<Utc>,
    ) -> Result<Option<PathBuf>> {
        let options = WalkOptions {
            modified_after: Some(SystemTime::from(since)),
            ..WalkOptions::default()
        };
        let files = walk_files(source, &options)?;
        if files.is_empty() {
            info!(source = %source.display(), %since, "No repository files changed");
            return Ok(None);
        }

        let archive = dest_dir.join(FILES_ARCHIVE);
        self.write_archive(&files, &archive)?;
        info!(source = %source.display(), files = files.len(), "Archived repository files (incremental)");
        Ok(Some(archive))
    }

    fn write_archive(&self, files: &[FileInfo], archive: &Path) -> Result<()> {
        if let Some(parent) = archive.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let encoder = zstd::stream::Encoder::new(File::create(archive)?, self.compression_level)?;
        let mut builder = Builder::new(encoder);

        for file in files {
            builder
                .append_path_with_name(&file.path, &file.relative_path)
                .map_err(|e| BackupError::Archive(format!("adding {}: {}", file.relative_path, e)))?;
        }

        let encoder = builder.into_inner()?;
        encoder.finish()?;
        Ok(())
    }
}

/// Extract a zstd tarball into `target`, returning the number of files written.
/// Entries that would escape `target` are rejected.
pub fn extract_zst(archive: &Path, target: &Path) -> Result<usize> {
    std::fs::create_dir_all(target)?;
    let decoder = zstd::stream::Decoder::new(File::open(archive)?)?;
    unpack_entries(Archive::new(decoder), archive, target)
}

pub(crate) fn unpack_entries<R: std::io::Read>(
    mut archive: Archive<R>,
    source: &Path,
    target: &Path,
) -> Result<usize> {
    let mut count = 0usize;
    let entries = archive
        .entries()
        .map_err(|e| BackupError::Archive(format!("reading {}: {}", source.display(), e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| BackupError::Archive(format!("reading {}: {}", source.display(), e)))?;
        let name = entry.path()?.to_string_lossy().trim_start_matches("./").to_string();
        let name = name.trim_end_matches('/');
        if name.is_empty() || name == "." {
            continue;
        }
        if !is_safe_relative(name) {
            return Err(BackupError::Archive(format!(
                "{} contains unsafe entry '{}'",
                source.display(),
                name
            )));
        }
        let is_file = entry.header().entry_type().is_file();
        entry
            .unpack_in(target)
            .map_err(|e| BackupError::Archive(format!("extracting {}: {}", name, e)))?;
        if is_file {
            count += 1;
        }
    }

    Ok(count)
}
