//! Backup Chain Store.
//!
//! Owns the lifecycle of [`BackupRecord`]s in the SQLite catalog. A record
//! is written once, in a single transaction, after its backup directory has
//! been captured and manifested.

pub mod record;

use crate::db::DbPool;
use crate::engine::LogPosition;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use record::{BackupRecord, BackupType};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use tracing::{debug, info};

#[derive(Clone)]
pub struct ChainStore {
    pool: DbPool,
}

fn row_to_record(row: &Row) -> rusqlite::Result<BackupRecord> {
    let backup_type: String = row.get("backup_type")?;
    let backup_date: String = row.get("backup_date")?;
    let wal_position: String = row.get("wal_position")?;
    let total_size: i64 = row.get("total_size_bytes")?;

    let conversion = |idx: usize, e: BackupError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    };

    Ok(BackupRecord {
        backup_id: row.get("backup_id")?,
        backup_type: backup_type.parse().map_err(|e| conversion(1, e))?,
        backup_date: DateTime::parse_from_rfc3339(&backup_date)
            .map_err(|e| conversion(2, BackupError::InvalidRecord(e.to_string())))?
            .with_timezone(&Utc),
        timeline_id: row.get("timeline_id")?,
        database_location: row.get("database_location")?,
        files_location: row.get("files_location")?,
        total_size_bytes: total_size.max(0) as u64,
        parent_backup_id: row.get("parent_backup_id")?,
        wal_position: wal_position
            .parse::<LogPosition>()
            .map_err(|e| conversion(8, e))?,
    })
}

const SELECT: &str = "SELECT backup_id, backup_type, backup_date, timeline_id, database_location, \
     files_location, total_size_bytes, parent_backup_id, wal_position FROM backups";

impl ChainStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Persist a record. The parent of an INCREMENTAL must already be stored.
    pub fn create(&self, record: &BackupRecord) -> Result<()> {
        record.validate()?;
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        if find(&tx, &record.backup_id)?.is_some() {
            return Err(BackupError::DuplicateBackup(record.backup_id.clone()));
        }
        if let Some(parent) = &record.parent_backup_id {
            if find(&tx, parent)?.is_none() {
                return Err(BackupError::broken_chain(
                    &record.backup_id,
                    format!("parent {} is not in the catalog", parent),
                ));
            }
        }

        insert(&tx, record)?;
        tx.commit()?;
        info!(backup_id = %record.backup_id, backup_type = %record.backup_type, "Backup record committed");
        Ok(())
    }

    pub fn find_by_id(&self, backup_id: &str) -> Result<Option<BackupRecord>> {
        let conn = self.pool.get()?;
        find(&conn, backup_id)
    }

    pub fn get(&self, backup_id: &str) -> Result<BackupRecord> {
        self.find_by_id(backup_id)?
            .ok_or_else(|| BackupError::NotFound(backup_id.to_string()))
    }

    /// Every record, newest first.
    pub fn list(&self) -> Result<Vec<BackupRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY backup_date DESC, backup_id DESC", SELECT))?;
        let rows = stmt.query_map([], row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Most recent backup of any type in the timeline.
    pub fn latest(&self, timeline_id: u32) -> Result<Option<BackupRecord>> {
        self.latest_where(timeline_id, None)
    }

    pub fn latest_full(&self, timeline_id: u32) -> Result<Option<BackupRecord>> {
        self.latest_where(timeline_id, Some(BackupType::Full))
    }

    fn latest_where(&self, timeline_id: u32, backup_type: Option<BackupType>) -> Result<Option<BackupRecord>> {
        let conn = self.pool.get()?;
        let record = match backup_type {
            Some(t) => conn
                .query_row(
                    &format!(
                        "{} WHERE timeline_id = ?1 AND backup_type = ?2 ORDER BY backup_date DESC, backup_id DESC LIMIT 1",
                        SELECT
                    ),
                    params![timeline_id, t.as_str()],
                    row_to_record,
                )
                .optional()?,
            None => conn
                .query_row(
                    &format!(
                        "{} WHERE timeline_id = ?1 ORDER BY backup_date DESC, backup_id DESC LIMIT 1",
                        SELECT
                    ),
                    params![timeline_id],
                    row_to_record,
                )
                .optional()?,
        };
        Ok(record)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM backups", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Walk parent links from `backup_id` to its FULL root.
    /// The result is ordered root first, target last.
    pub fn resolve_chain(&self, backup_id: &str) -> Result<Vec<BackupRecord>> {
        let conn = self.pool.get()?;
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = find(&conn, backup_id)?
            .ok_or_else(|| BackupError::NotFound(backup_id.to_string()))?;

        loop {
            if !seen.insert(current.backup_id.clone()) {
                return Err(BackupError::broken_chain(
                    backup_id,
                    format!("cycle through {}", current.backup_id),
                ));
            }
            let parent = current.parent_backup_id.clone();
            let is_full = current.is_full();
            chain.push(current);

            if is_full {
                break;
            }
            let parent = parent.ok_or_else(|| {
                BackupError::broken_chain(backup_id, "reached a root that is not a FULL backup")
            })?;
            current = find(&conn, &parent)?.ok_or_else(|| {
                BackupError::broken_chain(backup_id, format!("parent {} is missing", parent))
            })?;
        }

        chain.reverse();
        debug!(backup_id, links = chain.len(), "Resolved backup chain");
        Ok(chain)
    }

    /// Write a record without parent checks, for staging broken chains.
    #[cfg(test)]
    pub(crate) fn insert_unchecked(&self, record: &BackupRecord) -> Result<()> {
        let conn = self.pool.get()?;
        insert(&conn, record)
    }
}

fn find(conn: &Connection, backup_id: &str) -> Result<Option<BackupRecord>> {
    Ok(conn
        .query_row(
            &format!("{} WHERE backup_id = ?1", SELECT),
            params![backup_id],
            row_to_record,
        )
        .optional()?)
}

fn insert(conn: &Connection, record: &BackupRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO backups (backup_id, backup_type, backup_date, timeline_id, database_location, \
         files_location, total_size_bytes, parent_backup_id, wal_position) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.backup_id,
            record.backup_type.as_str(),
            record.backup_date.to_rfc3339_opts(SecondsFormat::Micros, true),
            record.timeline_id,
            record.database_location,
            record.files_location,
            record.total_size_bytes as i64,
            record.parent_backup_id,
            record.wal_position.to_string(),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_memory_pool;
    use chrono::{Duration, TimeZone};

    fn store() -> ChainStore {
        ChainStore::new(create_memory_pool().unwrap())
    }

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn full(id: &str, minutes: i64) -> BackupRecord {
        BackupRecord::full(id.into(), t(minutes), 1, LogPosition(minutes as u64 * 0x100))
    }

    fn incr(id: &str, parent: &str, minutes: i64) -> BackupRecord {
        BackupRecord::incremental(id.into(), t(minutes), 1, LogPosition(minutes as u64 * 0x100), parent.into())
    }

    #[test]
    fn test_create_and_find() {
        let store = store();
        let mut record = full("full_a", 0);
        record.files_location = Some("/backups/full_a/files".into());
        record.total_size_bytes = 4096;
        store.create(&record).unwrap();

        assert_eq!(store.find_by_id("full_a").unwrap(), Some(record));
        assert!(store.find_by_id("nope").unwrap().is_none());
        assert!(matches!(store.get("nope"), Err(BackupError::NotFound(_))));
    }

    #[test]
    fn test_duplicate_rejected() {
        let store = store();
        store.create(&full("full_a", 0)).unwrap();
        assert!(matches!(
            store.create(&full("full_a", 5)),
            Err(BackupError::DuplicateBackup(_))
        ));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_incremental_needs_stored_parent() {
        let store = store();
        let err = store.create(&incr("incremental_b", "full_a", 1)).unwrap_err();
        assert!(matches!(err, BackupError::BrokenChain { .. }));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_resolve_chain_order_and_links() {
        let store = store();
        store.create(&full("full_a", 0)).unwrap();
        store.create(&incr("incremental_b", "full_a", 10)).unwrap();
        store.create(&incr("incremental_c", "incremental_b", 20)).unwrap();
        store.create(&full("full_d", 30)).unwrap();

        let chain = store.resolve_chain("incremental_c").unwrap();
        let ids: Vec<_> = chain.iter().map(|r| r.backup_id.as_str()).collect();
        assert_eq!(ids, vec!["full_a", "incremental_b", "incremental_c"]);
        assert_eq!(chain[0].backup_type, BackupType::Full);
        for pair in chain.windows(2) {
            assert_eq!(pair[1].parent_backup_id.as_deref(), Some(pair[0].backup_id.as_str()));
        }

        assert_eq!(store.resolve_chain("full_d").unwrap().len(), 1);
    }

    #[test]
    fn test_resolve_chain_missing_parent() {
        let store = store();
        store.insert_unchecked(&incr("incremental_b", "full_gone", 10)).unwrap();
        let err = store.resolve_chain("incremental_b").unwrap_err();
        assert!(matches!(err, BackupError::BrokenChain { .. }));
        assert!(err.to_string().contains("full_gone"));
    }

    #[test]
    fn test_resolve_chain_cycle() {
        let store = store();
        store.insert_unchecked(&incr("incremental_x", "incremental_y", 1)).unwrap();
        store.insert_unchecked(&incr("incremental_y", "incremental_x", 2)).unwrap();
        let err = store.resolve_chain("incremental_x").unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_latest_by_timeline() {
        let store = store();
        assert!(store.latest(1).unwrap().is_none());

        store.create(&full("full_a", 0)).unwrap();
        store.create(&incr("incremental_b", "full_a", 10)).unwrap();
        let mut other = full("full_t2", 20);
        other.timeline_id = 2;
        store.create(&other).unwrap();

        assert_eq!(store.latest(1).unwrap().unwrap().backup_id, "incremental_b");
        assert_eq!(store.latest_full(1).unwrap().unwrap().backup_id, "full_a");
        assert_eq!(store.latest(2).unwrap().unwrap().backup_id, "full_t2");
        assert!(store.latest_full(3).unwrap().is_none());

        let listed: Vec<_> = store.list().unwrap().into_iter().map(|r| r.backup_id).collect();
        assert_eq!(listed, vec!["full_t2", "incremental_b", "full_a"]);
    }
}
