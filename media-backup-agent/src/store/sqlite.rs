//! SQLite-backed storage for settings and the delivered-files index.

use super::ConfigStore;
use crate::dedup::{DedupBackend, DedupEntry};
use crate::fs::MediaCategory;
use crate::Result;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use std::path::Path;

pub type DbPool = Pool<SqliteConnectionManager>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS delivered_files (
  content_hash TEXT PRIMARY KEY,
  source_name TEXT NOT NULL,
  source_path TEXT NOT NULL DEFAULT '',
  size INTEGER NOT NULL DEFAULT 0,
  category TEXT NOT NULL DEFAULT 'other',
  delivered_at INTEGER NOT NULL,
  remote_ref TEXT
);
"#;

#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("connections", &self.pool.state().connections)
            .finish()
    }
}

impl SqliteStore {
    /// Open (or create) the database file and apply the schema.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_manager(SqliteConnectionManager::file(db_path), 4)
    }

    /// Private in-memory database; a single connection so every caller sees
    /// the same data.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_manager(SqliteConnectionManager::memory(), 1)
    }

    fn from_manager(manager: SqliteConnectionManager, max_size: u32) -> Result<Self> {
        let manager = manager.with_init(|conn| {
            // FULL sync: a committed insert survives a crash right after it.
            conn.execute_batch(
                "PRAGMA journal_mode = DELETE;
                 PRAGMA synchronous = FULL;",
            )
        });
        let pool = Pool::builder().max_size(max_size).build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(SCHEMA)?;
        drop(conn);

        Ok(Self { pool })
    }
}

impl ConfigStore for SqliteStore {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        let conn = self.pool.get()?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put_string(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

fn row_to_entry(row: &Row) -> rusqlite::Result<DedupEntry> {
    let delivered_ms: i64 = row.get("delivered_at")?;
    let category: String = row.get("category")?;
    let size: i64 = row.get("size")?;
    Ok(DedupEntry {
        content_hash: row.get("content_hash")?,
        source_name: row.get("source_name")?,
        source_path: row.get("source_path")?,
        size: size.max(0) as u64,
        category: MediaCategory::from_label(&category),
        delivered_at: DateTime::<Utc>::from_timestamp_millis(delivered_ms).unwrap_or_default(),
        remote_ref: row.get("remote_ref")?,
    })
}

fn insert_entry(conn: &rusqlite::Connection, entry: &DedupEntry) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT OR IGNORE INTO delivered_files
           (content_hash, source_name, source_path, size, category, delivered_at, remote_ref)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.content_hash,
            entry.source_name,
            entry.source_path,
            entry.size as i64,
            entry.category.as_label(),
            entry.delivered_at.timestamp_millis(),
            entry.remote_ref,
        ],
    )
}

impl DedupBackend for SqliteStore {
    fn load(&self) -> Result<Vec<DedupEntry>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT * FROM delivered_files")?;
        let rows = stmt.query_map([], row_to_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    fn insert(&self, entry: &DedupEntry) -> Result<()> {
        let conn = self.pool.get()?;
        insert_entry(&conn, entry)?;
        Ok(())
    }

    fn replace_all(&self, entries: &[DedupEntry]) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM delivered_files", [])?;
        for entry in entries {
            insert_entry(&tx, entry)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM delivered_files", [])?;
        Ok(())
    }
}
