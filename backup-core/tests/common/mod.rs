//! Shared fixtures: a simulated engine, a manual clock and a wired orchestrator.

#![allow(dead_code)]

use async_trait::async_trait;
use backup_core::archive::gzip::pack_tree_gz;
use backup_core::chain::ChainStore;
use backup_core::config::StorageConfig;
use backup_core::db;
use backup_core::engine::{segment_file_name, EngineDriver, LogPosition, BASE_ARCHIVE, WAL_ARCHIVE, WAL_DIR};
use backup_core::events::{BackupEvent, EventSink};
use backup_core::fs::walker::{walk_files, WalkOptions};
use backup_core::restore::RestoreState;
use backup_core::utils::retry::{Clock, RetryPolicy};
use backup_core::{BackupError, BackupRecord, BackupType, Orchestrator, Result};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const SEG: u64 = 1024 * 1024;

struct EngineState {
    position: LogPosition,
    running: bool,
}

/// Stand-in for a live cluster. Every write appends to the WAL segment at the
/// current position; a log switch rounds the position up to the next
/// segment boundary, and does nothing when already on one.
pub struct MockEngine {
    data_dir: PathBuf,
    timeline: u32,
    state: Mutex<EngineState>,
    /// Number of upcoming `start` calls that fail.
    pub failing_starts: AtomicU32,
    /// When set, `stop` is accepted but the engine keeps running.
    pub ignore_stop: AtomicBool,
    pub stops: AtomicU32,
    pub starts: AtomicU32,
}

impl MockEngine {
    pub fn new(data_dir: &Path) -> Self {
        fs::create_dir_all(data_dir.join("base/1")).unwrap();
        fs::create_dir_all(data_dir.join("global")).unwrap();
        fs::create_dir_all(data_dir.join(WAL_DIR)).unwrap();
        fs::write(data_dir.join("PG_VERSION"), b"16\n").unwrap();
        fs::write(data_dir.join("global/pg_control"), vec![0x5a; 8192]).unwrap();
        fs::write(data_dir.join("base/1/1259"), vec![0x11; 16384]).unwrap();

        let engine = Self {
            data_dir: data_dir.to_path_buf(),
            timeline: 1,
            state: Mutex::new(EngineState {
                position: LogPosition(SEG),
                running: true,
            }),
            failing_starts: AtomicU32::new(0),
            ignore_stop: AtomicBool::new(false),
            stops: AtomicU32::new(0),
            starts: AtomicU32::new(0),
        };
        engine.write(40);
        engine
    }

    /// Commit `len` bytes of WAL.
    pub fn write(&self, len: usize) {
        let mut state = self.state.lock().unwrap();
        let mut remaining = len as u64;
        while remaining > 0 {
            let pos = state.position.0;
            let room = SEG - pos % SEG;
            let chunk = remaining.min(room);
            let name = segment_file_name(self.timeline, pos / SEG, SEG);
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.data_dir.join(WAL_DIR).join(name))
                .unwrap();
            let byte = (pos % 251) as u8;
            file.write_all(&vec![byte; chunk as usize]).unwrap();
            state.position = LogPosition(pos + chunk);
            remaining -= chunk;
        }
    }

    pub fn position(&self) -> LogPosition {
        self.state.lock().unwrap().position
    }

    pub fn running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    pub fn set_running(&self, running: bool) {
        self.state.lock().unwrap().running = running;
    }

    fn require_running(&self, what: &str) -> Result<()> {
        if self.running() {
            Ok(())
        } else {
            Err(BackupError::EngineControl(format!("{}: engine is not running", what)))
        }
    }

    fn switch(&self) -> LogPosition {
        let mut state = self.state.lock().unwrap();
        if state.position.0 % SEG != 0 {
            state.position = LogPosition((state.position.0 / SEG + 1) * SEG);
        }
        state.position
    }
}

#[async_trait]
impl EngineDriver for MockEngine {
    async fn capture_full(&self, dest: &Path) -> Result<()> {
        if !self.running() {
            return Err(BackupError::Capture("could not connect to server".into()));
        }
        pack_tree_gz(&self.data_dir, &dest.join(BASE_ARCHIVE), &[WAL_DIR])?;
        pack_tree_gz(&self.data_dir.join(WAL_DIR), &dest.join(WAL_ARCHIVE), &[])?;
        self.switch();
        Ok(())
    }

    async fn switch_log(&self) -> Result<LogPosition> {
        self.require_running("switch_log")?;
        Ok(self.switch())
    }

    async fn current_log_position(&self) -> Result<LogPosition> {
        self.require_running("current_log_position")?;
        Ok(self.position())
    }

    async fn timeline_id(&self) -> Result<u32> {
        Ok(self.timeline)
    }

    async fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_starts.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_starts.store(failing - 1, Ordering::SeqCst);
            return Err(BackupError::EngineControl("simulated start failure".into()));
        }
        self.set_running(true);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if !self.ignore_stop.load(Ordering::SeqCst) {
            self.set_running(false);
        }
        Ok(())
    }

    async fn is_running(&self) -> Result<bool> {
        Ok(self.running())
    }

    async fn ping(&self) -> Result<()> {
        if self.running() {
            Ok(())
        } else {
            Err(BackupError::Validation("connection refused".into()))
        }
    }

    async fn reset_wal(&self, data_dir: &Path) -> Result<()> {
        let wal = data_dir.join(WAL_DIR);
        if wal.exists() {
            fs::remove_dir_all(&wal)?;
        }
        fs::create_dir_all(&wal)?;
        Ok(())
    }

    fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn wal_segment_size(&self) -> u64 {
        SEG
    }
}

/// Clock that only moves when told to. Sleeping advances it instantly.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    pub sleeps: AtomicU32,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            sleeps: AtomicU32::new(0),
        }
    }

    pub fn advance(&self, by: ChronoDuration) {
        *self.now.lock().unwrap() += by;
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        *self.now.lock().unwrap() += ChronoDuration::from_std(duration).unwrap();
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<BackupEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<BackupEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn restore_states(&self) -> Vec<RestoreState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BackupEvent::RestoreStateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: BackupEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub struct Harness {
    pub temp: TempDir,
    pub storage: StorageConfig,
    pub engine: Arc<MockEngine>,
    pub clock: Arc<ManualClock>,
    pub events: Arc<RecordingSink>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let storage = StorageConfig {
            backups_dir: root.join("backups"),
            catalog_path: root.join("catalog.db"),
            files_dir: root.join("files"),
            work_dir: root.join("tmp"),
        };
        fs::create_dir_all(storage.files_dir.join("papers")).unwrap();
        fs::write(storage.files_dir.join("papers/thesis.pdf"), b"%PDF thesis v1").unwrap();
        fs::write(storage.files_dir.join("papers/poster.pdf"), b"%PDF poster v1").unwrap();

        let engine = Arc::new(MockEngine::new(&root.join("pgdata")));
        // Backup dates sit in the past so every file on disk counts as modified since.
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 7, 2, 0, 0).unwrap()));
        let events = Arc::new(RecordingSink::default());
        let store = ChainStore::new(db::create_pool(&storage.catalog_path).unwrap());

        let orchestrator = Orchestrator::new(
            &storage,
            RetryPolicy::new(3, Duration::from_secs(1)),
            engine.clone(),
            store,
            clock.clone(),
            events.clone(),
        )
        .unwrap();

        Self {
            temp,
            storage,
            engine,
            clock,
            events,
            orchestrator,
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.engine.data_dir().to_path_buf()
    }

    /// Create a backup one minute after the previous one.
    pub async fn backup(&self, backup_type: BackupType) -> Result<BackupRecord> {
        self.clock.advance(ChronoDuration::minutes(1));
        self.orchestrator.create_backup(backup_type).await
    }

    pub fn backup_dirs(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(&self.storage.backups_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

/// SHA-256 over every file's relative path and bytes, in sorted order.
pub fn tree_digest(root: &Path, exclude: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for file in walk_files(root, &WalkOptions::excluding(exclude)).unwrap() {
        hasher.update(file.relative_path.as_bytes());
        hasher.update([0u8]);
        hasher.update(fs::read(&file.path).unwrap());
    }
    format!("{:x}", hasher.finalize())
}

/// Names of the sibling directories left next to `dir` (snapshots, staging).
pub fn siblings_of(dir: &Path) -> Vec<String> {
    let name = dir.file_name().unwrap().to_string_lossy().into_owned();
    let prefix = format!("{}.", name);
    fs::read_dir(dir.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with(&prefix))
        .collect()
}
