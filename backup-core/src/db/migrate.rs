use super::connection::DbPool;
use crate::utils::errors::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backups (
  backup_id TEXT PRIMARY KEY,
  backup_type TEXT NOT NULL CHECK(backup_type IN ('FULL','INCREMENTAL')),
  backup_date TEXT NOT NULL,
  timeline_id INTEGER NOT NULL,
  database_location TEXT NOT NULL,
  files_location TEXT,
  total_size_bytes INTEGER NOT NULL DEFAULT 0,
  parent_backup_id TEXT,
  wal_position TEXT NOT NULL,
  created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_backups_timeline_date ON backups(timeline_id, backup_date DESC);
CREATE INDEX IF NOT EXISTS idx_backups_parent ON backups(parent_backup_id);
"#;

pub fn migrate(pool: &DbPool) -> Result<()> {
    tracing::debug!("[DB] Applying catalog schema");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    // Idempotent column additions for catalogs created by earlier releases
    let has_column = |table: &str, column: &str| -> rusqlite::Result<bool> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(columns.iter().any(|c| c == column))
    };

    if !has_column("backups", "files_location")? {
        conn.execute_batch("ALTER TABLE backups ADD COLUMN files_location TEXT")?;
    }

    Ok(())
}
