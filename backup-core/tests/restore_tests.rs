mod common;

use backup_core::archive::gzip::compress_file;
use backup_core::manifest;
use backup_core::restore::materialize::{AUTO_CONF, RECOVERY_SIGNAL};
use backup_core::restore::{RestoreState, RollbackStatus};
use backup_core::{BackupError, BackupType, ErrorKind};
use common::{siblings_of, tree_digest, Harness};
use std::fs;
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;

const RECOVERY_FILES: [&str; 2] = [RECOVERY_SIGNAL, AUTO_CONF];

#[tokio::test]
async fn test_restore_chain_reconstructs_data_state() {
    let h = Harness::new();
    let data = h.data_dir();

    h.backup(BackupType::Full).await.unwrap();
    h.engine.write(100);
    fs::write(h.storage.files_dir.join("papers/thesis.pdf"), b"%PDF thesis v2").unwrap();
    h.backup(BackupType::Incremental).await.unwrap();
    h.engine.write(300_000);
    fs::write(h.storage.files_dir.join("papers/dataset.csv"), b"id,value\n1,42\n").unwrap();
    let b3 = h.backup(BackupType::Incremental).await.unwrap();

    let expected_data = tree_digest(&data, &RECOVERY_FILES);
    let expected_files = tree_digest(&h.storage.files_dir, &[]);

    // Diverge after B3.
    h.engine.write(5000);
    fs::write(data.join("base/1/16384"), b"table created after the backup").unwrap();
    fs::write(h.storage.files_dir.join("papers/draft.docx"), b"later upload").unwrap();
    assert_ne!(tree_digest(&data, &RECOVERY_FILES), expected_data);

    h.events.clear();
    let report = h
        .orchestrator
        .restore_backup(&b3.backup_id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.chain.len(), 3);
    assert_eq!(report.backup_id, b3.backup_id);

    assert_eq!(tree_digest(&data, &RECOVERY_FILES), expected_data);
    assert_eq!(tree_digest(&h.storage.files_dir, &[]), expected_files);
    // Recovery settings only live until the engine has promoted.
    assert!(!data.join(RECOVERY_SIGNAL).exists());
    let conf = fs::read_to_string(data.join(AUTO_CONF)).unwrap();
    assert!(!conf.contains("restore_command"));
    assert!(!conf.contains("recovery_target_timeline"));

    assert!(h.engine.running());
    assert!(siblings_of(&data).is_empty(), "snapshot should be discarded");
    assert!(siblings_of(&h.storage.files_dir).is_empty());

    assert_eq!(
        h.events.restore_states(),
        vec![
            RestoreState::Verifying,
            RestoreState::StoppingEngine,
            RestoreState::Snapshotting,
            RestoreState::Materializing,
            RestoreState::StartingEngine,
            RestoreState::Validating,
            RestoreState::Done,
        ]
    );
}

#[tokio::test]
async fn test_restore_full_only_resets_wal() {
    let h = Harness::new();
    let data = h.data_dir();

    let full = h.backup(BackupType::Full).await.unwrap();
    let expected_base = tree_digest(&data, &["pg_wal"]);

    h.engine.write(2048);
    fs::write(data.join("base/1/16384"), b"new relation").unwrap();

    h.orchestrator
        .restore_backup(&full.backup_id, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(tree_digest(&data, &["pg_wal"]), expected_base);
    assert!(fs::read_dir(data.join("pg_wal")).unwrap().next().is_none());
    assert!(!data.join(RECOVERY_SIGNAL).exists());
    assert!(h.engine.running());
}

#[tokio::test]
async fn test_start_failure_rolls_back_to_original_data() {
    let h = Harness::new();
    let data = h.data_dir();

    let full = h.backup(BackupType::Full).await.unwrap();
    h.engine.write(4096);
    fs::write(data.join("base/1/16384"), b"rows written after the backup").unwrap();
    let before = tree_digest(&data, &[]);
    let files_before = tree_digest(&h.storage.files_dir, &[]);

    h.engine.failing_starts.store(1, Ordering::SeqCst);
    let err = h
        .orchestrator
        .restore_backup(&full.backup_id, &CancellationToken::new())
        .await
        .unwrap_err();

    match &err {
        BackupError::RestoreAborted { failed_in, rollback, .. } => {
            assert_eq!(*failed_in, RestoreState::StartingEngine);
            assert_eq!(*rollback, RollbackStatus::RolledBack);
        }
        other => panic!("expected RestoreAborted, got {:?}", other),
    }
    assert_eq!(err.kind(), ErrorKind::EngineControl);

    assert!(h.engine.running());
    assert_eq!(tree_digest(&data, &[]), before);
    assert_eq!(tree_digest(&h.storage.files_dir, &[]), files_before);
    assert!(siblings_of(&data).is_empty());
    assert_eq!(h.events.restore_states().last(), Some(&RestoreState::RollingBack));
}

#[tokio::test]
async fn test_rollback_that_cannot_restart_is_reported() {
    let h = Harness::new();
    let full = h.backup(BackupType::Full).await.unwrap();

    h.engine.failing_starts.store(2, Ordering::SeqCst);
    let err = h
        .orchestrator
        .restore_backup(&full.backup_id, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        BackupError::RestoreAborted { rollback: RollbackStatus::Failed(detail), .. } => {
            assert!(detail.starts_with("restart"));
        }
        other => panic!("unexpected {:?}", other),
    }
    // The original data directory is back in place even though the engine is down.
    assert!(h.data_dir().join("PG_VERSION").is_file());
    assert!(!h.engine.running());
}

#[tokio::test]
async fn test_rollback_without_prior_data_directory_is_not_reported_as_success() {
    let h = Harness::new();
    let data = h.data_dir();
    let full = h.backup(BackupType::Full).await.unwrap();

    // Cluster is down and its data directory is gone.
    h.engine.set_running(false);
    fs::remove_dir_all(&data).unwrap();
    h.engine.failing_starts.store(1, Ordering::SeqCst);

    let err = h
        .orchestrator
        .restore_backup(&full.backup_id, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        BackupError::RestoreAborted { failed_in, rollback, .. } => {
            assert_eq!(failed_in, RestoreState::StartingEngine);
            match rollback {
                RollbackStatus::Failed(detail) => assert!(detail.starts_with("data directory")),
                other => panic!("unexpected rollback {:?}", other),
            }
        }
        other => panic!("unexpected {:?}", other),
    }
    // Only the restore's own start attempt; rollback did not start the engine on the new data.
    assert_eq!(h.engine.starts.load(Ordering::SeqCst), 1);
    assert!(!h.engine.running());
}

#[tokio::test]
async fn test_engine_that_will_not_stop_is_left_untouched() {
    let h = Harness::new();
    let data = h.data_dir();
    let full = h.backup(BackupType::Full).await.unwrap();
    let before = tree_digest(&data, &[]);

    h.engine.ignore_stop.store(true, Ordering::SeqCst);
    let err = h
        .orchestrator
        .restore_backup(&full.backup_id, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::EngineControl);
    match err {
        BackupError::RestoreAborted { failed_in, rollback, .. } => {
            assert_eq!(failed_in, RestoreState::StoppingEngine);
            assert_eq!(rollback, RollbackStatus::RolledBack);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(h.engine.running());
    assert_eq!(tree_digest(&data, &[]), before);
    // Polling used the retry budget through the clock, without real sleeps.
    assert_eq!(h.clock.sleeps.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cancelled_restore_never_stops_the_engine() {
    let h = Harness::new();
    let full = h.backup(BackupType::Full).await.unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let err = h.orchestrator.restore_backup(&full.backup_id, &token).await.unwrap_err();

    assert!(matches!(err, BackupError::Cancelled));
    assert_eq!(h.engine.stops.load(Ordering::SeqCst), 0);
    assert!(h.engine.running());
}

#[tokio::test]
async fn test_corrupt_backup_aborts_before_engine_is_touched() {
    let h = Harness::new();
    let data = h.data_dir();
    h.backup(BackupType::Full).await.unwrap();
    h.engine.write(100);
    let incr = h.backup(BackupType::Incremental).await.unwrap();
    let before = tree_digest(&data, &[]);

    let info = h.orchestrator.layout().database_dir(&incr.backup_id).join("backup.info");
    fs::write(&info, "backup_id=forged\n").unwrap();

    h.events.clear();
    let err = h
        .orchestrator
        .restore_backup(&incr.backup_id, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, BackupError::Integrity { .. }));
    assert_eq!(h.events.restore_states(), vec![RestoreState::Verifying]);
    assert_eq!(h.engine.stops.load(Ordering::SeqCst), 0);
    assert_eq!(tree_digest(&data, &[]), before);
}

#[tokio::test]
async fn test_segment_names_that_escape_pg_wal_are_rejected_before_stopping() {
    let h = Harness::new();
    let data = h.data_dir();
    h.backup(BackupType::Full).await.unwrap();
    h.engine.write(100);
    let incr = h.backup(BackupType::Incremental).await.unwrap();
    let before = tree_digest(&data, &[]);

    // A forged backup whose manifest is consistent with its sidecar.
    let root = h.temp.path();
    let db_dir = h.orchestrator.layout().database_dir(&incr.backup_id);
    let payload = root.join("payload");
    fs::write(&payload, b"not a wal segment").unwrap();
    compress_file(&payload, &h.storage.backups_dir.join("escaped.gz")).unwrap();
    let info = fs::read_to_string(db_dir.join("backup.info")).unwrap();
    let forged: String = info
        .lines()
        .map(|line| if line.starts_with("wal_files=") { "wal_files=../../escaped" } else { line })
        .map(|line| format!("{}\n", line))
        .collect();
    fs::write(db_dir.join("backup.info"), forged).unwrap();
    manifest::generate(
        &h.orchestrator.layout().backup_dir(&incr.backup_id),
        &incr.backup_id,
        BackupType::Incremental,
        incr.backup_date,
    )
    .unwrap();

    h.events.clear();
    let err = h
        .orchestrator
        .restore_backup(&incr.backup_id, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidRecord);
    assert_eq!(h.events.restore_states(), vec![RestoreState::Verifying]);
    assert_eq!(h.engine.stops.load(Ordering::SeqCst), 0);
    assert!(!root.join("escaped").exists());
    assert_eq!(tree_digest(&data, &[]), before);
}

#[tokio::test]
async fn test_missing_parent_record_is_broken_chain() {
    let h = Harness::new();
    let full = h.backup(BackupType::Full).await.unwrap();
    h.engine.write(100);
    let incr = h.backup(BackupType::Incremental).await.unwrap();

    let conn = rusqlite::Connection::open(&h.storage.catalog_path).unwrap();
    conn.execute("DELETE FROM backups WHERE backup_id = ?1", [&full.backup_id])
        .unwrap();

    let err = h
        .orchestrator
        .restore_backup(&incr.backup_id, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BrokenChain);
    assert_eq!(h.engine.stops.load(Ordering::SeqCst), 0);
}
