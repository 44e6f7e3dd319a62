//! Configuration management for the backup core.
//!
//! Loads configuration from a TOML file. Every section and field has a
//! default, so a partial file only needs the values that differ.

use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub retry: RetryConfig,
    pub schedule: ScheduleConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of `backups/<backup_id>/` directories
    pub backups_dir: PathBuf,

    /// SQLite catalog holding the backup records
    pub catalog_path: PathBuf,

    /// Repository asset tree archived next to the database
    pub files_dir: PathBuf,

    /// Scratch space for imports and download bundles
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding pg_basebackup, pg_ctl, psql, pg_resetwal (PATH when unset)
    pub bin_dir: Option<PathBuf>,

    /// Live data directory of the engine
    pub data_dir: PathBuf,

    pub host: String,
    pub port: u16,
    pub user: String,
    pub database: String,

    /// Passed to the engine tools through PGPASSWORD
    pub password: Option<String>,

    /// When set, start/stop go through `systemctl` instead of `pg_ctl`
    pub service_name: Option<String>,

    /// WAL segment size in bytes (16 MiB unless the cluster was initialised otherwise)
    pub wal_segment_size: u64,

    /// Server log written by `pg_ctl start`
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Number of status checks when stopping or starting the engine
    pub attempts: u32,

    /// Delay between checks in milliseconds
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,

    /// Cron expression (with seconds) for automated FULL backups
    pub full_cron: String,

    /// Cron expression (with seconds) for automated INCREMENTAL backups
    pub incremental_cron: String,

    /// How long a caller waits before receiving a pollable operation id
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

const DEFAULT_WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

impl Default for StorageConfig {
    fn default() -> Self {
        let root = PathBuf::from("/var/lib/research-repo");
        Self {
            backups_dir: root.join("backups"),
            catalog_path: root.join("backup-catalog.db"),
            files_dir: root.join("files"),
            work_dir: root.join("tmp"),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bin_dir: None,
            data_dir: PathBuf::from("/var/lib/postgresql/data"),
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            database: "postgres".to_string(),
            password: None,
            service_name: None,
            wal_segment_size: DEFAULT_WAL_SEGMENT_SIZE,
            log_file: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval_ms: 1000,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            full_cron: "0 0 2 * * Sun".to_string(),
            incremental_cron: "0 0 3 * * *".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| BackupError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.attempts == 0 {
            return Err(BackupError::Config("retry.attempts must be at least 1".into()));
        }
        let seg = self.engine.wal_segment_size;
        if !seg.is_power_of_two() || !(1024 * 1024..=1024 * 1024 * 1024).contains(&seg) {
            return Err(BackupError::Config(format!(
                "engine.wal_segment_size must be a power of two between 1 MiB and 1 GiB, got {}",
                seg
            )));
        }
        if self.storage.backups_dir.as_os_str().is_empty() {
            return Err(BackupError::Config("storage.backups_dir must be set".into()));
        }
        Ok(())
    }
}
