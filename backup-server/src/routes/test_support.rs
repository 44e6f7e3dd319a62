//! Orchestrator wired to a scripted engine for route and scheduler tests.

use crate::config::AppConfig;
use crate::routes::create_router;
use crate::state::AppState;
use crate::ws::audit::AuditBroadcaster;
use async_trait::async_trait;
use axum::Router;
use backup_core::archive::gzip::pack_tree_gz;
use backup_core::chain::ChainStore;
use backup_core::config::StorageConfig;
use backup_core::db;
use backup_core::engine::{EngineDriver, LogPosition, BASE_ARCHIVE, WAL_ARCHIVE, WAL_DIR};
use backup_core::utils::retry::{RetryPolicy, SystemClock};
use backup_core::{Orchestrator, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const SEGMENT: u64 = 16 * 1024 * 1024;

/// Always-up engine whose log advances one segment per switch.
pub struct ScriptedEngine {
    data_dir: PathBuf,
    position: AtomicU64,
}

impl ScriptedEngine {
    pub fn new(data_dir: &Path) -> Self {
        std::fs::create_dir_all(data_dir.join(WAL_DIR)).unwrap();
        std::fs::write(data_dir.join("PG_VERSION"), b"16\n").unwrap();
        std::fs::write(data_dir.join(WAL_DIR).join("000000010000000000000002"), b"wal").unwrap();
        Self {
            data_dir: data_dir.to_path_buf(),
            position: AtomicU64::new(2 * SEGMENT + 0x28),
        }
    }

    fn position(&self) -> LogPosition {
        LogPosition(self.position.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl EngineDriver for ScriptedEngine {
    async fn capture_full(&self, dest: &Path) -> Result<()> {
        pack_tree_gz(&self.data_dir, &dest.join(BASE_ARCHIVE), &[WAL_DIR])?;
        pack_tree_gz(&self.data_dir.join(WAL_DIR), &dest.join(WAL_ARCHIVE), &[])?;
        Ok(())
    }

    async fn switch_log(&self) -> Result<LogPosition> {
        Ok(self.position())
    }

    async fn current_log_position(&self) -> Result<LogPosition> {
        Ok(self.position())
    }

    async fn timeline_id(&self) -> Result<u32> {
        Ok(1)
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn is_running(&self) -> Result<bool> {
        Ok(true)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn reset_wal(&self, _data_dir: &Path) -> Result<()> {
        Ok(())
    }

    fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn wal_segment_size(&self) -> u64 {
        SEGMENT
    }
}

pub struct TestApp {
    pub temp: TempDir,
    pub orchestrator: Arc<Orchestrator>,
    pub state: Arc<AppState>,
}

impl TestApp {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let storage = StorageConfig {
            backups_dir: root.join("backups"),
            catalog_path: root.join("catalog.db"),
            files_dir: root.join("files"),
            work_dir: root.join("tmp"),
        };
        std::fs::create_dir_all(&storage.files_dir).unwrap();
        std::fs::write(storage.files_dir.join("abstract.txt"), b"On incremental backups").unwrap();

        let audit = AuditBroadcaster::new(16);
        let orchestrator = Arc::new(
            Orchestrator::new(
                &storage,
                RetryPolicy::new(2, Duration::from_millis(10)),
                Arc::new(ScriptedEngine::new(&root.join("pgdata"))),
                ChainStore::new(db::create_pool(&storage.catalog_path).unwrap()),
                Arc::new(SystemClock),
                Arc::new(audit.clone()),
            )
            .unwrap(),
        );

        let config = AppConfig {
            port: 0,
            backup_config: None,
            log_level: None,
            replay_capacity: 16,
            operation_retention_hours: 24,
        };
        let state = Arc::new(AppState::new(
            orchestrator.clone(),
            audit,
            config,
            Duration::from_secs(30),
            root.join("uploads"),
        ));

        Self {
            temp,
            orchestrator,
            state,
        }
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }
}
