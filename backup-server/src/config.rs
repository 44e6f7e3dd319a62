use backup_core::Config;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// TOML file for backup-core; built-in defaults when unset
    pub backup_config: Option<PathBuf>,
    pub log_level: Option<String>,
    /// Events kept per subject for WebSocket replay
    pub replay_capacity: usize,
    /// Finished operations are forgotten after this many hours
    pub operation_retention_hours: i64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            backup_config: std::env::var("BACKUP_CONFIG").ok().map(PathBuf::from),
            log_level: std::env::var("LOG_LEVEL").ok(),
            replay_capacity: std::env::var("REPLAY_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            operation_retention_hours: std::env::var("OPERATION_RETENTION_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(24),
        }
    }

    /// Load the backup-core configuration this server runs with.
    pub fn load_backup_config(&self) -> anyhow::Result<Config> {
        let config = match &self.backup_config {
            Some(path) => Config::from_file(path)?,
            None => {
                tracing::warn!("BACKUP_CONFIG not set, using built-in defaults");
                Config::default()
            }
        };
        Ok(config)
    }
}
