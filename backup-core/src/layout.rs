//! On-disk layout of the backup repository: `<root>/<backup_id>/{database,files,integrity.json}`.

use std::path::{Path, PathBuf};

pub const DATABASE_DIR: &str = "database";
pub const FILES_DIR: &str = "files";

#[derive(Debug, Clone)]
pub struct BackupLayout {
    root: PathBuf,
}

impl BackupLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backup_dir(&self, backup_id: &str) -> PathBuf {
        self.root.join(backup_id)
    }

    pub fn database_dir(&self, backup_id: &str) -> PathBuf {
        self.backup_dir(backup_id).join(DATABASE_DIR)
    }

    pub fn files_dir(&self, backup_id: &str) -> PathBuf {
        self.backup_dir(backup_id).join(FILES_DIR)
    }
}
