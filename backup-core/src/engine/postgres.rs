//! [`EngineDriver`] for PostgreSQL, driving its command-line tools.
//!
//! - `pg_basebackup -Ft -z -Xs` for the full physical capture
//! - `psql` for log position, timeline and liveness queries
//! - `pg_ctl` (or `systemctl` when a service name is configured) for start/stop
//! - `pg_resetwal` to turn an extracted base into a fresh instance

use super::{EngineDriver, LogPosition};
use crate::config::EngineConfig;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

pub struct PostgresDriver {
    config: EngineConfig,
}

/// Outcome of a tool invocation that exited non-zero.
struct ToolFailure {
    code: Option<i32>,
    stderr: String,
}

impl PostgresDriver {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    fn binary(&self, name: &str) -> PathBuf {
        match &self.config.bin_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    fn command(&self, name: &str) -> Command {
        let mut cmd = Command::new(self.binary(name));
        if let Some(password) = &self.config.password {
            cmd.env("PGPASSWORD", password);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn connection_args(&self, cmd: &mut Command) {
        cmd.arg("-h")
            .arg(&self.config.host)
            .arg("-p")
            .arg(self.config.port.to_string())
            .arg("-U")
            .arg(&self.config.user);
    }

    async fn run(&self, mut cmd: Command, tool: &str) -> std::result::Result<String, ToolFailure> {
        debug!(tool, "Running engine tool");
        let output = cmd.output().await.map_err(|e| ToolFailure {
            code: None,
            stderr: format!("failed to spawn {}: {}", tool, e),
        })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(ToolFailure {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Single-value query through psql in unaligned, tuples-only mode.
    async fn query(&self, sql: &str) -> Result<String> {
        let mut cmd = self.command("psql");
        cmd.arg("-X").arg("-A").arg("-t").arg("-w");
        self.connection_args(&mut cmd);
        cmd.arg("-d").arg(&self.config.database).arg("-c").arg(sql);

        self.run(cmd, "psql").await.map_err(|f| {
            BackupError::EngineControl(format!("query `{}` failed: {}", sql, f.stderr))
        })
    }

    async fn systemctl(&self, action: &str, service: &str) -> std::result::Result<String, ToolFailure> {
        let mut cmd = Command::new("systemctl");
        cmd.arg(action)
            .arg(service)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        self.run(cmd, "systemctl").await
    }
}

#[async_trait]
impl EngineDriver for PostgresDriver {
    async fn capture_full(&self, dest: &Path) -> Result<()> {
        info!(dest = %dest.display(), "Starting pg_basebackup");

        let mut cmd = self.command("pg_basebackup");
        cmd.arg("-D")
            .arg(dest)
            .arg("-Ft")
            .arg("-z")
            .arg("-Xs")
            .arg("-c")
            .arg("fast")
            .arg("-w");
        self.connection_args(&mut cmd);

        self.run(cmd, "pg_basebackup")
            .await
            .map(|_| ())
            .map_err(|f| BackupError::Capture(format!("pg_basebackup exited with {:?}: {}", f.code, f.stderr)))
    }

    async fn switch_log(&self) -> Result<LogPosition> {
        self.query("SELECT pg_switch_wal()").await?.parse()
    }

    async fn current_log_position(&self) -> Result<LogPosition> {
        self.query("SELECT pg_current_wal_lsn()").await?.parse()
    }

    async fn timeline_id(&self) -> Result<u32> {
        let raw = self
            .query("SELECT timeline_id FROM pg_control_checkpoint()")
            .await?;
        raw.parse()
            .map_err(|_| BackupError::EngineControl(format!("unexpected timeline id '{}'", raw)))
    }

    async fn start(&self) -> Result<()> {
        let result = match &self.config.service_name {
            Some(service) => self.systemctl("start", service).await,
            None => {
                let mut cmd = self.command("pg_ctl");
                cmd.arg("start").arg("-D").arg(&self.config.data_dir).arg("-W");
                if let Some(log) = &self.config.log_file {
                    cmd.arg("-l").arg(log);
                }
                self.run(cmd, "pg_ctl").await
            }
        };
        result
            .map(|_| ())
            .map_err(|f| BackupError::EngineControl(format!("start request failed: {}", f.stderr)))
    }

    async fn stop(&self) -> Result<()> {
        let result = match &self.config.service_name {
            Some(service) => self.systemctl("stop", service).await,
            None => {
                let mut cmd = self.command("pg_ctl");
                cmd.arg("stop")
                    .arg("-D")
                    .arg(&self.config.data_dir)
                    .arg("-m")
                    .arg("fast")
                    .arg("-W");
                self.run(cmd, "pg_ctl").await
            }
        };
        result
            .map(|_| ())
            .map_err(|f| BackupError::EngineControl(format!("stop request failed: {}", f.stderr)))
    }

    async fn is_running(&self) -> Result<bool> {
        match &self.config.service_name {
            Some(service) => Ok(self.systemctl("is-active", service).await.is_ok()),
            None => {
                let mut cmd = self.command("pg_ctl");
                cmd.arg("status").arg("-D").arg(&self.config.data_dir);
                match self.run(cmd, "pg_ctl").await {
                    Ok(_) => Ok(true),
                    // 3: not running, 4: no accessible data directory
                    Err(ToolFailure { code: Some(3), .. }) | Err(ToolFailure { code: Some(4), .. }) => Ok(false),
                    Err(f) => Err(BackupError::EngineControl(format!("status check failed: {}", f.stderr))),
                }
            }
        }
    }

    async fn ping(&self) -> Result<()> {
        let out = self
            .query("SELECT 1")
            .await
            .map_err(|e| BackupError::Validation(e.to_string()))?;
        if out == "1" {
            Ok(())
        } else {
            Err(BackupError::Validation(format!("unexpected reply to SELECT 1: '{}'", out)))
        }
    }

    async fn reset_wal(&self, data_dir: &Path) -> Result<()> {
        let mut cmd = self.command("pg_resetwal");
        cmd.arg("-f").arg("-D").arg(data_dir);
        self.run(cmd, "pg_resetwal")
            .await
            .map(|_| ())
            .map_err(|f| BackupError::EngineControl(format!("pg_resetwal failed: {}", f.stderr)))
    }

    fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    fn wal_segment_size(&self) -> u64 {
        self.config.wal_segment_size
    }
}
