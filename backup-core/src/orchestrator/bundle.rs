//! Portable download bundles: one zstd tarball holding a backup directory
//! (`database/`, `files/`, `integrity.json`) plus `record.json`.

use crate::archive::extract_zst;
use crate::chain::record::BackupRecord;
use crate::fs::walker::{walk_files, WalkOptions};
use crate::utils::errors::{BackupError, Result};
use std::fs::File;
use std::path::Path;
use tar::{Builder, Header};
use tracing::info;

pub const BUNDLE_RECORD: &str = "record.json";
pub const BUNDLE_EXTENSION: &str = "tar.zst";

/// Pack `backup_dir` and the serialized `record` into `dest`.
pub fn write_bundle(backup_dir: &Path, record: &BackupRecord, dest: &Path, level: i32) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let files = walk_files(backup_dir, &WalkOptions::excluding(&[BUNDLE_RECORD]))?;
    let encoder = zstd::stream::Encoder::new(File::create(dest)?, level)?;
    let mut builder = Builder::new(encoder);

    for file in &files {
        builder
            .append_path_with_name(&file.path, &file.relative_path)
            .map_err(|e| BackupError::Archive(format!("bundling {}: {}", file.relative_path, e)))?;
    }

    let json = serde_json::to_vec_pretty(record)?;
    let mut header = Header::new_gnu();
    header.set_size(json.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(record.backup_date.timestamp().max(0) as u64);
    header.set_cksum();
    builder.append_data(&mut header, BUNDLE_RECORD, json.as_slice())?;

    builder.into_inner()?.finish()?;
    let size = std::fs::metadata(dest)?.len();
    info!(backup_id = %record.backup_id, files = files.len(), size, "Download bundle written");
    Ok(size)
}

/// Unpack a bundle into `target`. Returns the record it carries, if any.
pub fn unpack_bundle(bundle: &Path, target: &Path) -> Result<Option<BackupRecord>> {
    extract_zst(bundle, target)?;
    let record_path = target.join(BUNDLE_RECORD);
    if !record_path.is_file() {
        return Ok(None);
    }
    let record: BackupRecord = serde_json::from_slice(&std::fs::read(&record_path)?)
        .map_err(|e| BackupError::InvalidRecord(format!("{}: {}", BUNDLE_RECORD, e)))?;
    std::fs::remove_file(&record_path)?;
    Ok(Some(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::record::BackupType;
    use crate::engine::LogPosition;
    use crate::manifest;
    use chrono::Utc;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_bundle_carries_backup_and_record() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("full_20240101_000000");
        fs::create_dir_all(dir.join("database")).unwrap();
        fs::create_dir_all(dir.join("files")).unwrap();
        fs::write(dir.join("database/base.tar.gz"), b"base").unwrap();
        fs::write(dir.join("files/files.tar.zst"), b"files").unwrap();
        let now = Utc::now();
        manifest::generate(&dir, "full_20240101_000000", BackupType::Full, now).unwrap();

        let record = BackupRecord::full("full_20240101_000000".into(), now, 1, LogPosition(0x2000000));
        let bundle = temp.path().join("out/full_20240101_000000.tar.zst");
        assert!(write_bundle(&dir, &record, &bundle, 3).unwrap() > 0);

        let unpacked = temp.path().join("unpacked");
        let carried = unpack_bundle(&bundle, &unpacked).unwrap().unwrap();
        assert_eq!(carried, record);
        assert!(!unpacked.join(BUNDLE_RECORD).exists());
        assert!(manifest::verify(&unpacked).is_ok());
    }
}
