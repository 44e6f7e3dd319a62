//! Orchestrator: the single entry point for create, restore, list and download.
//!
//! Every mutating operation first takes the [`OperationGate`], so a backup
//! can never start while a restore has the engine down, and vice versa.
//! A backup is committed to the chain store only after capture, archiving and
//! manifesting all succeeded; any failure removes the attempt's directory.

pub mod bundle;
pub mod gate;
pub mod tracker;

use crate::archive::FileArchiver;
use crate::capture::sidecar::WalSidecar;
use crate::capture::PhysicalCapture;
use crate::chain::record::{backup_id_for, BackupRecord, BackupType};
use crate::chain::ChainStore;
use crate::config::{Config, StorageConfig};
use crate::db;
use crate::engine::{EngineDriver, LogPosition, PostgresDriver};
use crate::events::{BackupEvent, EventSink, TracingSink};
use crate::fs::tree::{copy_tree, remove_dir_if_exists, tree_size};
use crate::layout::{BackupLayout, DATABASE_DIR};
use crate::manifest::{self, IntegrityManifest};
use crate::restore::{RestoreEngine, RestoreReport};
use crate::utils::errors::{BackupError, Result};
use crate::utils::retry::{Clock, RetryPolicy, SystemClock};
use chrono::{DateTime, SubsecRound, Utc};
use gate::{OperationGate, OperationKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub struct Orchestrator {
    engine: Arc<dyn EngineDriver>,
    store: ChainStore,
    layout: BackupLayout,
    files_dir: PathBuf,
    work_dir: PathBuf,
    capture: PhysicalCapture,
    archiver: FileArchiver,
    restorer: RestoreEngine,
    gate: OperationGate,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl Orchestrator {
    pub fn new(
        storage: &StorageConfig,
        retry: RetryPolicy,
        engine: Arc<dyn EngineDriver>,
        store: ChainStore,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&storage.backups_dir)?;
        std::fs::create_dir_all(&storage.work_dir)?;

        let layout = BackupLayout::new(&storage.backups_dir);
        let restorer = RestoreEngine::new(
            engine.clone(),
            layout.clone(),
            storage.files_dir.clone(),
            retry,
            clock.clone(),
            events.clone(),
        );

        Ok(Self {
            capture: PhysicalCapture::new(engine.clone()),
            engine,
            store,
            layout,
            files_dir: storage.files_dir.clone(),
            work_dir: storage.work_dir.clone(),
            archiver: FileArchiver::default(),
            restorer,
            gate: OperationGate::new(),
            clock,
            events,
        })
    }

    /// Production wiring: PostgreSQL driver, SQLite catalog, wall clock.
    pub fn from_config(config: &Config, events: Option<Arc<dyn EventSink>>) -> Result<Self> {
        config.validate()?;
        let pool = db::create_pool(&config.storage.catalog_path)?;
        Self::new(
            &config.storage,
            RetryPolicy::from_config(&config.retry),
            Arc::new(PostgresDriver::new(config.engine.clone())),
            ChainStore::new(pool),
            Arc::new(SystemClock),
            events.unwrap_or_else(|| Arc::new(TracingSink)),
        )
    }

    pub fn gate(&self) -> &OperationGate {
        &self.gate
    }

    pub fn store(&self) -> &ChainStore {
        &self.store
    }

    pub fn layout(&self) -> &BackupLayout {
        &self.layout
    }

    pub async fn current_timeline(&self) -> Result<u32> {
        self.engine.timeline_id().await
    }

    pub fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        self.store.list()
    }

    pub fn get_backup(&self, backup_id: &str) -> Result<BackupRecord> {
        self.store.get(backup_id)
    }

    /// Create a backup of the requested type.
    ///
    /// INCREMENTAL requires a FULL backup in the engine's current timeline and
    /// chains onto the newest backup of that timeline.
    pub async fn create_backup(&self, backup_type: BackupType) -> Result<BackupRecord> {
        let _guard = self.gate.try_acquire(backup_type.into())?;

        let backup_date = self.clock.now().trunc_subsecs(0);
        let timeline_id = self.engine.timeline_id().await?;
        let parent = match backup_type {
            BackupType::Full => None,
            BackupType::Incremental => {
                if self.store.latest_full(timeline_id)?.is_none() {
                    return Err(BackupError::Prerequisite { timeline: timeline_id });
                }
                Some(
                    self.store
                        .latest(timeline_id)?
                        .ok_or(BackupError::Prerequisite { timeline: timeline_id })?,
                )
            }
        };

        let backup_id = backup_id_for(backup_type, backup_date);
        let backup_dir = self.layout.backup_dir(&backup_id);
        if self.store.find_by_id(&backup_id)?.is_some() || backup_dir.exists() {
            // The existing directory belongs to someone else; leave it alone.
            return Err(BackupError::DuplicateBackup(backup_id));
        }

        info!(%backup_id, %backup_type, timeline_id, parent = ?parent.as_ref().map(|p| &p.backup_id), "Creating backup");
        self.events.emit(BackupEvent::BackupStarted { backup_type });

        match self
            .build_backup(&backup_id, backup_type, backup_date, timeline_id, parent.as_ref())
            .await
        {
            Ok(record) => {
                self.events.emit(BackupEvent::BackupCreated { record: record.clone() });
                Ok(record)
            }
            Err(e) => {
                if let Err(cleanup) = remove_dir_if_exists(&backup_dir) {
                    warn!(%backup_id, error = %cleanup, "Could not remove partial backup directory");
                }
                match (&e, &parent) {
                    (BackupError::NoChanges { .. }, Some(p)) => {
                        info!(%backup_id, since = %p.backup_id, "Nothing to back up");
                        self.events.emit(BackupEvent::NoChanges { since: p.backup_id.clone() });
                    }
                    _ => {
                        warn!(%backup_id, error = %e, "Backup failed");
                        self.events.emit(BackupEvent::backup_failed(backup_type, &e));
                    }
                }
                Err(e)
            }
        }
    }

    async fn build_backup(
        &self,
        backup_id: &str,
        backup_type: BackupType,
        backup_date: DateTime<Utc>,
        timeline_id: u32,
        parent: Option<&BackupRecord>,
    ) -> Result<BackupRecord> {
        let backup_dir = self.layout.backup_dir(backup_id);
        let database_dir = self.layout.database_dir(backup_id);
        let files_out = self.layout.files_dir(backup_id);

        let captured = match parent {
            None => self.capture.capture_full(&database_dir).await?,
            Some(since) => {
                self.capture
                    .capture_incremental(&database_dir, backup_id, since, timeline_id)
                    .await?
            }
        };

        let archiver = self.archiver.clone();
        let source = self.files_dir.clone();
        let dest = files_out.clone();
        let since = parent.map(|p| p.backup_date);
        let files_archive = tokio::task::spawn_blocking(move || match since {
            None => archiver.archive_full(&source, &dest).map(Some),
            Some(since) => archiver.archive_incremental(&source, &dest, since),
        })
        .await??;

        let dir = backup_dir.clone();
        let id = backup_id.to_string();
        let (manifest, total_size) = tokio::task::spawn_blocking(move || -> Result<(IntegrityManifest, u64)> {
            let manifest = manifest::generate(&dir, &id, backup_type, backup_date)?;
            Ok((manifest, tree_size(&dir)?))
        })
        .await??;

        let mut record = match parent {
            None => BackupRecord::full(backup_id.to_string(), backup_date, timeline_id, captured.wal_position),
            Some(p) => BackupRecord::incremental(
                backup_id.to_string(),
                backup_date,
                timeline_id,
                captured.wal_position,
                p.backup_id.clone(),
            ),
        };
        record.database_location = database_dir.display().to_string();
        record.files_location = files_archive.map(|_| files_out.display().to_string());
        record.total_size_bytes = total_size;

        self.store.create(&record)?;
        info!(
            backup_id,
            files = manifest.file_hashes.len(),
            size = total_size,
            wal_position = %record.wal_position,
            "Backup committed"
        );
        Ok(record)
    }

    /// Restore `backup_id`, replaying its whole chain.
    pub async fn restore_backup(&self, backup_id: &str, cancel: &CancellationToken) -> Result<RestoreReport> {
        let _guard = self.gate.try_acquire(OperationKind::Restore)?;
        let chain = self.store.resolve_chain(backup_id)?;
        self.restorer.restore(chain, cancel).await
    }

    /// Import a download bundle, register it, then restore it.
    pub async fn restore_from_file(&self, bundle: &Path, cancel: &CancellationToken) -> Result<RestoreReport> {
        let _guard = self.gate.try_acquire(OperationKind::Import)?;

        let staging = self.work_dir.join(format!("import-{}", Uuid::new_v4()));
        let imported = self.import_bundle(bundle, &staging).await;
        if let Err(e) = remove_dir_if_exists(&staging) {
            warn!(path = %staging.display(), error = %e, "Could not remove import staging directory");
        }
        let record = imported?;

        let chain = self.store.resolve_chain(&record.backup_id)?;
        self.restorer.restore(chain, cancel).await
    }

    async fn import_bundle(&self, bundle: &Path, staging: &Path) -> Result<BackupRecord> {
        let source = bundle.to_path_buf();
        let target = staging.to_path_buf();
        let (carried, manifest) = tokio::task::spawn_blocking(move || {
            let carried = bundle::unpack_bundle(&source, &target)?;
            let manifest = manifest::verify(&target)?;
            if manifest.backup_type == BackupType::Incremental {
                WalSidecar::read(&target.join(DATABASE_DIR))?;
            }
            Ok::<_, BackupError>((carried, manifest))
        })
        .await??;

        let mut record = match carried {
            Some(record) => record,
            None if manifest.backup_type == BackupType::Full => {
                warn!(backup_id = %manifest.backup_id, "Bundle has no record, registering as FULL on the current timeline");
                BackupRecord::full(
                    manifest.backup_id.clone(),
                    manifest.creation_date,
                    self.engine.timeline_id().await?,
                    LogPosition::default(),
                )
            }
            None => {
                return Err(BackupError::InvalidRecord(format!(
                    "incremental bundle {} carries no {}",
                    manifest.backup_id,
                    bundle::BUNDLE_RECORD
                )))
            }
        };
        record.validate()?;
        if record.backup_id != manifest.backup_id || record.backup_type != manifest.backup_type {
            return Err(BackupError::integrity(
                &manifest.backup_id,
                format!("bundle record describes {} {}", record.backup_type, record.backup_id),
            ));
        }

        if let Some(parent) = &record.parent_backup_id {
            if self.store.find_by_id(parent)?.is_none() {
                return Err(BackupError::broken_chain(
                    &record.backup_id,
                    format!("parent {} is not in this repository", parent),
                ));
            }
        }

        if let Some(existing) = self.store.find_by_id(&record.backup_id)? {
            let stored = manifest::read(&self.layout.backup_dir(&existing.backup_id))?;
            if stored.overall_hash == manifest.overall_hash {
                info!(backup_id = %existing.backup_id, "Bundle matches a stored backup, reusing it");
                return Ok(existing);
            }
            return Err(BackupError::DuplicateBackup(record.backup_id));
        }

        let dest = self.layout.backup_dir(&record.backup_id);
        if dest.exists() {
            return Err(BackupError::DuplicateBackup(record.backup_id));
        }
        let from = staging.to_path_buf();
        let to = dest.clone();
        tokio::task::spawn_blocking(move || move_tree(&from, &to)).await??;

        record.database_location = self.layout.database_dir(&record.backup_id).display().to_string();
        record.files_location = record
            .files_location
            .as_ref()
            .map(|_| self.layout.files_dir(&record.backup_id).display().to_string());
        if let Err(e) = self.store.create(&record) {
            let _ = remove_dir_if_exists(&dest);
            return Err(e);
        }
        info!(backup_id = %record.backup_id, "Imported backup bundle");
        Ok(record)
    }

    /// Verify `backup_id` and pack it into a portable bundle under the work
    /// directory. Every call gets its own file; the caller removes it.
    pub async fn download_backup(&self, backup_id: &str) -> Result<PathBuf> {
        let record = self.store.get(backup_id)?;
        let dir = self.layout.backup_dir(backup_id);
        let dest = self
            .work_dir
            .join(format!("{}-{}.{}", backup_id, Uuid::new_v4(), bundle::BUNDLE_EXTENSION));
        let level = self.archiver.compression_level();

        let out = dest.clone();
        let written = tokio::task::spawn_blocking(move || {
            manifest::verify(&dir)?;
            bundle::write_bundle(&dir, &record, &out, level)
        })
        .await?;
        if let Err(e) = written {
            let _ = std::fs::remove_file(&dest);
            return Err(e);
        }
        Ok(dest)
    }

    pub async fn verify_backup(&self, backup_id: &str) -> Result<IntegrityManifest> {
        self.store.get(backup_id)?;
        let dir = self.layout.backup_dir(backup_id);
        tokio::task::spawn_blocking(move || manifest::verify(&dir)).await?
    }
}

/// Rename when possible, otherwise copy then delete (staging on another file system).
fn move_tree(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    if let Err(e) = copy_tree(from, to) {
        let _ = remove_dir_if_exists(to);
        return Err(e.into());
    }
    remove_dir_if_exists(from)?;
    Ok(())
}
