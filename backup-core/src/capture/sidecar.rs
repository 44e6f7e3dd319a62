//! `backup.info`: key=value metadata written next to an incremental's WAL segments.

use crate::chain::record::BackupType;
use crate::engine::is_segment_file_name;
use crate::utils::errors::{BackupError, Result};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;

pub const SIDECAR_FILE: &str = "backup.info";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalSidecar {
    pub backup_id: String,
    pub backup_type: BackupType,
    pub parent_backup_id: String,
    pub start_wal: String,
    pub end_wal: String,
    /// Most recent segment captured.
    pub wal_filename: String,
    /// Every captured segment, oldest first.
    pub wal_files: Vec<String>,
}

impl WalSidecar {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "backup_id={}", self.backup_id);
        let _ = writeln!(out, "backup_type={}", self.backup_type);
        let _ = writeln!(out, "parent_backup_id={}", self.parent_backup_id);
        let _ = writeln!(out, "start_wal={}", self.start_wal);
        let _ = writeln!(out, "end_wal={}", self.end_wal);
        let _ = writeln!(out, "wal_filename={}", self.wal_filename);
        let _ = writeln!(out, "wal_files={}", self.wal_files.join(","));
        out
    }

    pub fn parse(content: &str) -> Result<Self> {
        let values: HashMap<&str, &str> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.trim(), v.trim()))
            .collect();

        let field = |key: &str| -> Result<String> {
            values
                .get(key)
                .map(|v| v.to_string())
                .ok_or_else(|| BackupError::InvalidRecord(format!("{} is missing '{}'", SIDECAR_FILE, key)))
        };

        let wal_filename = field("wal_filename")?;
        // Older sidecars only name the newest segment.
        let wal_files = match values.get("wal_files") {
            Some(list) if !list.is_empty() => list.split(',').map(|s| s.trim().to_string()).collect(),
            _ => vec![wal_filename.clone()],
        };
        // Names are joined onto pg_wal during restore.
        if let Some(bad) = std::iter::once(&wal_filename)
            .chain(wal_files.iter())
            .find(|name| !is_segment_file_name(name))
        {
            return Err(BackupError::InvalidRecord(format!(
                "{} lists '{}', which is not a WAL segment name",
                SIDECAR_FILE, bad
            )));
        }

        Ok(Self {
            backup_id: field("backup_id")?,
            backup_type: field("backup_type")?.parse()?,
            parent_backup_id: field("parent_backup_id")?,
            start_wal: field("start_wal")?,
            end_wal: field("end_wal")?,
            wal_filename,
            wal_files,
        })
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        std::fs::write(dir.join(SIDECAR_FILE), self.render())?;
        Ok(())
    }

    pub fn read(dir: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(dir.join(SIDECAR_FILE)).map_err(|e| {
            BackupError::InvalidRecord(format!("cannot read {} in {}: {}", SIDECAR_FILE, dir.display(), e))
        })?;
        Self::parse(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WalSidecar {
        WalSidecar {
            backup_id: "incremental_20240501_030000".into(),
            backup_type: BackupType::Incremental,
            parent_backup_id: "full_20240428_020000".into(),
            start_wal: "0/3000028".into(),
            end_wal: "0/5000000".into(),
            wal_filename: "000000010000000000000004".into(),
            wal_files: vec!["000000010000000000000003".into(), "000000010000000000000004".into()],
        }
    }

    #[test]
    fn test_render_is_key_value_lines() {
        let text = sample().render();
        assert!(text.contains("backup_type=INCREMENTAL\n"));
        assert!(text.contains("wal_files=000000010000000000000003,000000010000000000000004\n"));
        assert_eq!(WalSidecar::parse(&text).unwrap(), sample());
    }

    #[test]
    fn test_parse_without_wal_files_list() {
        let text = "backup_id=incremental_1\nbackup_type=INCREMENTAL\nparent_backup_id=full_1\n\
                    start_wal=0/1000000\nend_wal=0/2000000\nwal_filename=000000010000000000000001\n";
        let parsed = WalSidecar::parse(text).unwrap();
        assert_eq!(parsed.wal_files, vec!["000000010000000000000001".to_string()]);
    }

    #[test]
    fn test_parse_rejects_path_like_segment_names() {
        let mut sidecar = sample();
        sidecar.wal_files = vec!["../../../escaped".into()];
        let err = WalSidecar::parse(&sidecar.render()).unwrap_err();
        assert!(matches!(err, BackupError::InvalidRecord(_)));
        assert!(err.to_string().contains("../../../escaped"));

        let mut sidecar = sample();
        sidecar.wal_filename = "/etc/passwd".into();
        assert!(WalSidecar::parse(&sidecar.render()).is_err());
    }

    #[test]
    fn test_parse_missing_key() {
        let err = WalSidecar::parse("backup_id=x\n").unwrap_err();
        assert!(err.to_string().contains("is missing"));
    }
}
