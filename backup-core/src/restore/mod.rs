//! Restore Engine.
//!
//! Drives one restore through
//! `IDLE → VERIFYING → STOPPING_ENGINE → SNAPSHOTTING → MATERIALIZING →
//! STARTING_ENGINE → VALIDATING → DONE`. Any failure once the engine stop has
//! been requested moves to `ROLLING_BACK`, which puts the pre-restore data
//! directory back and restarts the engine on it before the original error is
//! surfaced as [`BackupError::RestoreAborted`].
//!
//! Cancellation is honoured up to the moment the engine stop is requested.
//! From then on the machine always runs to `DONE` or through `ROLLING_BACK`.

pub mod files;
pub mod materialize;

use crate::capture::sidecar::{WalSidecar, SIDECAR_FILE};
use crate::chain::record::BackupRecord;
use crate::engine::EngineDriver;
use crate::events::{BackupEvent, EventSink};
use crate::fs::tree::{copy_tree, remove_dir_if_exists, sibling_path};
use crate::layout::BackupLayout;
use crate::manifest;
use crate::utils::errors::{BackupError, Result};
use crate::utils::retry::{Clock, RetryPolicy};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestoreState {
    Idle,
    Verifying,
    StoppingEngine,
    Snapshotting,
    Materializing,
    StartingEngine,
    Validating,
    Done,
    RollingBack,
}

impl RestoreState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreState::Idle => "IDLE",
            RestoreState::Verifying => "VERIFYING",
            RestoreState::StoppingEngine => "STOPPING_ENGINE",
            RestoreState::Snapshotting => "SNAPSHOTTING",
            RestoreState::Materializing => "MATERIALIZING",
            RestoreState::StartingEngine => "STARTING_ENGINE",
            RestoreState::Validating => "VALIDATING",
            RestoreState::Done => "DONE",
            RestoreState::RollingBack => "ROLLING_BACK",
        }
    }

    /// States in which the live engine may already have been touched.
    pub fn engine_touched(&self) -> bool {
        matches!(
            self,
            RestoreState::StoppingEngine
                | RestoreState::Snapshotting
                | RestoreState::Materializing
                | RestoreState::StartingEngine
                | RestoreState::Validating
                | RestoreState::RollingBack
        )
    }
}

impl fmt::Display for RestoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a failed restore left the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum RollbackStatus {
    /// Failure happened before the engine was touched.
    NotNeeded,
    /// The engine is running on the pre-restore data directory.
    RolledBack,
    /// Rollback itself failed; the detail says where.
    Failed(String),
}

impl fmt::Display for RollbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackStatus::NotNeeded => f.write_str("not needed"),
            RollbackStatus::RolledBack => f.write_str("engine running on pre-restore data"),
            RollbackStatus::Failed(detail) => write!(f, "FAILED, {}", detail),
        }
    }
}

/// Transient bookkeeping for one restore call.
#[derive(Debug)]
pub struct RestoreAttempt {
    pub target: String,
    pub chain: Vec<BackupRecord>,
    pub state: RestoreState,
    pub snapshot: Option<PathBuf>,
    stamp: String,
}

/// Result of a successful restore.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub backup_id: String,
    pub chain: Vec<String>,
    pub wal_segments: usize,
    pub files_restored: usize,
    pub duration_ms: u64,
}

pub struct RestoreEngine {
    engine: Arc<dyn EngineDriver>,
    layout: BackupLayout,
    files_dir: PathBuf,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl RestoreEngine {
    pub fn new(
        engine: Arc<dyn EngineDriver>,
        layout: BackupLayout,
        files_dir: PathBuf,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            engine,
            layout,
            files_dir,
            retry,
            clock,
            events,
        }
    }

    /// Restore the last element of `chain`. The chain must be ordered root
    /// first, as returned by the chain store.
    pub async fn restore(&self, chain: Vec<BackupRecord>, cancel: &CancellationToken) -> Result<RestoreReport> {
        let target = chain
            .last()
            .map(|r| r.backup_id.clone())
            .ok_or_else(|| BackupError::InvalidRecord("empty restore chain".into()))?;
        let started = Instant::now();
        let mut attempt = RestoreAttempt {
            target,
            chain,
            state: RestoreState::Idle,
            snapshot: None,
            stamp: self.clock.now().format("%Y%m%d%H%M%S").to_string(),
        };

        match self.run(&mut attempt, cancel).await {
            Ok((wal_segments, files_restored)) => {
                self.transition(&mut attempt, RestoreState::Done);
                self.events.emit(BackupEvent::RestoreCompleted {
                    backup_id: attempt.target.clone(),
                    chain_length: attempt.chain.len(),
                });
                Ok(RestoreReport {
                    backup_id: attempt.target.clone(),
                    chain: attempt.chain.iter().map(|r| r.backup_id.clone()).collect(),
                    wal_segments,
                    files_restored,
                    duration_ms: started.elapsed().as_millis() as u64,
                })
            }
            Err(e) if !attempt.state.engine_touched() => {
                warn!(backup_id = %attempt.target, state = %attempt.state, error = %e, "Restore aborted before touching the engine");
                Err(e)
            }
            Err(e) => {
                let failed_in = attempt.state;
                error!(backup_id = %attempt.target, state = %failed_in, error = %e, "Restore failed, rolling back");
                let rollback = self.roll_back(&mut attempt, failed_in).await;
                self.events.emit(BackupEvent::RestoreFailed {
                    backup_id: attempt.target.clone(),
                    failed_in,
                    rollback: rollback.clone(),
                    kind: e.kind(),
                    detail: e.to_string(),
                });
                Err(BackupError::RestoreAborted {
                    backup_id: attempt.target,
                    failed_in,
                    rollback,
                    source: Box::new(e),
                })
            }
        }
    }

    async fn run(&self, attempt: &mut RestoreAttempt, cancel: &CancellationToken) -> Result<(usize, usize)> {
        if cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        self.transition(attempt, RestoreState::Verifying);
        self.verify_chain(&attempt.chain).await?;

        if cancel.is_cancelled() {
            info!(backup_id = %attempt.target, "Restore cancelled before stopping the engine");
            return Err(BackupError::Cancelled);
        }

        self.transition(attempt, RestoreState::StoppingEngine);
        self.stop_engine().await?;

        self.transition(attempt, RestoreState::Snapshotting);
        attempt.snapshot = self.snapshot(&attempt.stamp).await?;

        self.transition(attempt, RestoreState::Materializing);
        let data_dir = self.engine.data_dir().to_path_buf();
        let layout = self.layout.clone();
        let chain = attempt.chain.clone();
        let materialized = {
            let data_dir = data_dir.clone();
            tokio::task::spawn_blocking(move || materialize::materialize(&data_dir, &layout, &chain)).await??
        };
        if !materialized.needs_recovery {
            self.engine.reset_wal(&data_dir).await?;
        }

        self.transition(attempt, RestoreState::StartingEngine);
        self.start_engine().await?;

        self.transition(attempt, RestoreState::Validating);
        self.engine.ping().await?;
        if materialized.needs_recovery {
            if let Err(e) = materialize::clear_recovery_directives(&data_dir) {
                warn!(data_dir = %data_dir.display(), error = %e, "Could not clear recovery settings");
            }
        }
        let files_dir = self.files_dir.clone();
        let layout = self.layout.clone();
        let chain = attempt.chain.clone();
        let stamp = attempt.stamp.clone();
        let files_restored =
            tokio::task::spawn_blocking(move || files::restore_files(&files_dir, &layout, &chain, &stamp)).await??;

        if let Some(snapshot) = attempt.snapshot.take() {
            if let Err(e) = remove_dir_if_exists(&snapshot) {
                warn!(path = %snapshot.display(), error = %e, "Could not discard pre-restore snapshot");
            }
        }

        Ok((materialized.wal_segments, files_restored))
    }

    fn transition(&self, attempt: &mut RestoreAttempt, next: RestoreState) {
        info!(backup_id = %attempt.target, from = %attempt.state, to = %next, "Restore state");
        attempt.state = next;
        self.events.emit(BackupEvent::RestoreStateChanged {
            backup_id: attempt.target.clone(),
            state: next,
        });
    }

    /// Hashes every backup in the chain and parses each incremental's
    /// sidecar, so nothing read during materialization is unchecked.
    async fn verify_chain(&self, chain: &[BackupRecord]) -> Result<()> {
        for (position, record) in chain.iter().enumerate() {
            let dir = self.layout.backup_dir(&record.backup_id);
            let verified = tokio::task::spawn_blocking(move || manifest::verify(&dir)).await??;
            if verified.backup_id != record.backup_id {
                return Err(BackupError::integrity(
                    &record.backup_id,
                    format!("manifest belongs to {}", verified.backup_id),
                ));
            }

            let Some(parent) = position.checked_sub(1).map(|i| &chain[i]) else {
                continue;
            };
            let sidecar = WalSidecar::read(&self.layout.database_dir(&record.backup_id))?;
            if sidecar.parent_backup_id != parent.backup_id {
                return Err(BackupError::broken_chain(
                    &record.backup_id,
                    format!(
                        "{} names parent {} but the chain has {}",
                        SIDECAR_FILE, sidecar.parent_backup_id, parent.backup_id
                    ),
                ));
            }
        }
        Ok(())
    }

    async fn stop_engine(&self) -> Result<()> {
        if !self.engine.is_running().await? {
            info!("Engine already stopped");
            return Ok(());
        }
        self.engine.stop().await?;

        let engine = &self.engine;
        let stopped = self
            .retry
            .poll_until(self.clock.as_ref(), || async move {
                matches!(engine.is_running().await, Ok(false))
            })
            .await;
        if stopped {
            Ok(())
        } else {
            Err(BackupError::EngineControl(format!(
                "engine still running after {} checks",
                self.retry.attempts
            )))
        }
    }

    async fn start_engine(&self) -> Result<()> {
        self.engine.start().await?;

        let engine = &self.engine;
        let ready = self
            .retry
            .poll_until(self.clock.as_ref(), || async move { engine.ping().await.is_ok() })
            .await;
        if ready {
            Ok(())
        } else {
            Err(BackupError::EngineControl(format!(
                "engine not accepting connections after {} checks",
                self.retry.attempts
            )))
        }
    }

    /// Copy the live data directory aside. `None` when there was nothing to copy.
    async fn snapshot(&self, stamp: &str) -> Result<Option<PathBuf>> {
        let data_dir = self.engine.data_dir().to_path_buf();
        if !data_dir.exists() {
            warn!(data_dir = %data_dir.display(), "No data directory to snapshot");
            return Ok(None);
        }
        let snapshot = sibling_path(&data_dir, "pre-restore", stamp);
        let target = snapshot.clone();
        let bytes = tokio::task::spawn_blocking(move || {
            remove_dir_if_exists(&target)?;
            copy_tree(&data_dir, &target).inspect_err(|_| {
                let _ = remove_dir_if_exists(&target);
            })
        })
        .await??;
        info!(snapshot = %snapshot.display(), bytes, "Pre-restore snapshot taken");
        Ok(Some(snapshot))
    }

    async fn roll_back(&self, attempt: &mut RestoreAttempt, failed_in: RestoreState) -> RollbackStatus {
        self.transition(attempt, RestoreState::RollingBack);

        let running = !matches!(self.engine.is_running().await, Ok(false));
        if failed_in == RestoreState::StoppingEngine && running {
            // Stop never took effect and the data directory was not touched.
            warn!(backup_id = %attempt.target, "Engine still running on original data");
            return RollbackStatus::RolledBack;
        }
        let data_replaced = matches!(
            failed_in,
            RestoreState::Materializing | RestoreState::StartingEngine | RestoreState::Validating
        );
        if data_replaced && attempt.snapshot.is_none() {
            // There was no data directory before the restore, so nothing to
            // put back. Starting the engine would run it on the new data.
            error!(backup_id = %attempt.target, "No pre-restore data directory to return to");
            return RollbackStatus::Failed("data directory: none existed before the restore".into());
        }
        if running {
            if let Err(e) = self.stop_engine().await {
                error!(error = %e, "Rollback could not stop the engine");
                return RollbackStatus::Failed(format!("stop: {}", e));
            }
        }

        if let Some(snapshot) = attempt.snapshot.take() {
            let data_dir = self.engine.data_dir().to_path_buf();
            let result = tokio::task::spawn_blocking(move || put_back(&snapshot, &data_dir)).await;
            match result {
                Ok(Ok(())) => info!("Pre-restore data directory put back"),
                Ok(Err(e)) => return RollbackStatus::Failed(format!("data directory: {}", e)),
                Err(e) => return RollbackStatus::Failed(format!("data directory: {}", e)),
            }
        }

        match self.start_engine().await {
            Ok(()) => {
                warn!(backup_id = %attempt.target, "Rolled back to pre-restore state");
                RollbackStatus::RolledBack
            }
            Err(e) => {
                error!(backup_id = %attempt.target, error = %e, "Engine did not come back after rollback");
                RollbackStatus::Failed(format!("restart: {}", e))
            }
        }
    }
}

fn put_back(snapshot: &Path, data_dir: &Path) -> std::io::Result<()> {
    remove_dir_if_exists(data_dir)?;
    std::fs::rename(snapshot, data_dir)
}
