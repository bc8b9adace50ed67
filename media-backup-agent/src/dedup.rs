//! Persistent set of content hashes that have already been delivered.
//!
//! Lookups hit an in-memory map; every mutation goes to the durable
//! [`DedupBackend`] first so a crash right after a successful upload cannot
//! lose the record. Mutations hold the write lock across the backend call,
//! so an import never overwrites a row that an add is writing.

use crate::fs::{FileRecord, MediaCategory};
use crate::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupEntry {
    pub content_hash: String,
    pub source_name: String,
    pub source_path: String,
    pub size: u64,
    pub category: MediaCategory,
    pub delivered_at: DateTime<Utc>,
    /// Identifier the remote assigned to the delivered document
    pub remote_ref: Option<String>,
}

impl DedupEntry {
    pub fn delivered(file: &FileRecord, remote_ref: Option<String>, at: DateTime<Utc>) -> Self {
        Self {
            content_hash: file.content_hash.clone(),
            source_name: file.file_name(),
            source_path: file.path.display().to_string(),
            size: file.size,
            category: file.category,
            delivered_at: at,
            remote_ref,
        }
    }
}

/// Durable storage behind a [`DedupIndex`].
pub trait DedupBackend: Send + Sync {
    fn load(&self) -> Result<Vec<DedupEntry>>;

    /// Insert unless the hash is already present.
    fn insert(&self, entry: &DedupEntry) -> Result<()>;

    /// Atomically swap the stored set for `entries`.
    fn replace_all(&self, entries: &[DedupEntry]) -> Result<()>;

    fn clear(&self) -> Result<()>;
}

/// How an imported snapshot combines with the local index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    /// Union; on a hash collision the newer `delivered_at` wins
    LastWriteWins,
    /// Drop local entries and keep only the snapshot
    Replace,
}

pub struct DedupIndex {
    entries: RwLock<HashMap<String, DedupEntry>>,
    backend: Arc<dyn DedupBackend>,
}

impl std::fmt::Debug for DedupIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupIndex")
            .field("len", &self.len())
            .finish()
    }
}

impl DedupIndex {
    /// Load every stored entry into memory.
    pub fn open(backend: Arc<dyn DedupBackend>) -> Result<Self> {
        let entries: HashMap<String, DedupEntry> = backend
            .load()?
            .into_iter()
            .map(|e| (e.content_hash.clone(), e))
            .collect();
        debug!("Dedup index loaded with {} entries", entries.len());

        Ok(Self {
            entries: RwLock::new(entries),
            backend,
        })
    }

    pub fn contains(&self, content_hash: &str) -> bool {
        self.entries.read().contains_key(content_hash)
    }

    /// Record a delivery. Returns `false` if the hash was already known.
    pub fn add(&self, entry: DedupEntry) -> Result<bool> {
        if self.contains(&entry.content_hash) {
            return Ok(false);
        }
        let mut entries = self.entries.write();
        if entries.contains_key(&entry.content_hash) {
            return Ok(false);
        }
        self.backend.insert(&entry)?;
        entries.insert(entry.content_hash.clone(), entry);
        Ok(true)
    }

    /// Merge entries from another source. Returns how many entries were
    /// added or changed.
    pub fn import_snapshot(&self, snapshot: Vec<DedupEntry>, rule: MergeRule) -> Result<usize> {
        let mut entries = self.entries.write();

        let (merged, changed) = match rule {
            MergeRule::Replace => {
                let changed = snapshot.len();
                let merged: HashMap<String, DedupEntry> = snapshot
                    .into_iter()
                    .map(|e| (e.content_hash.clone(), e))
                    .collect();
                (merged, changed)
            }
            MergeRule::LastWriteWins => {
                let mut merged = entries.clone();
                let mut changed = 0;
                for incoming in snapshot {
                    match merged.get(&incoming.content_hash) {
                        Some(existing) if existing.delivered_at >= incoming.delivered_at => {}
                        _ => {
                            merged.insert(incoming.content_hash.clone(), incoming);
                            changed += 1;
                        }
                    }
                }
                (merged, changed)
            }
        };

        if changed == 0 && rule == MergeRule::LastWriteWins {
            return Ok(0);
        }

        let rows: Vec<DedupEntry> = merged.values().cloned().collect();
        self.backend.replace_all(&rows)?;
        *entries = merged;

        info!("Imported {} dedup entries ({:?})", changed, rule);
        Ok(changed)
    }

    /// Forget every delivery.
    pub fn clear(&self) -> Result<()> {
        let mut entries = self.entries.write();
        self.backend.clear()?;
        entries.clear();
        info!("Dedup index cleared");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every entry, newest delivery first.
    pub fn entries(&self) -> Vec<DedupEntry> {
        let mut all: Vec<DedupEntry> = self.entries.read().values().cloned().collect();
        all.sort_by(|a, b| b.delivered_at.cmp(&a.delivered_at));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SqliteStore};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn entry(hash: &str, secs: i64) -> DedupEntry {
        DedupEntry {
            content_hash: hash.to_string(),
            source_name: format!("{hash}.jpg"),
            source_path: format!("/DCIM/{hash}.jpg"),
            size: 10,
            category: MediaCategory::Image,
            delivered_at: Utc.timestamp_opt(secs, 0).unwrap(),
            remote_ref: None,
        }
    }

    #[test]
    fn test_add_is_idempotent() {
        let index = DedupIndex::open(Arc::new(MemoryStore::new())).unwrap();
        assert!(index.add(entry("a", 1)).unwrap());
        assert!(!index.add(entry("a", 2)).unwrap());
        assert_eq!(index.len(), 1);
        assert_eq!(index.entries()[0].delivered_at.timestamp(), 1);
    }

    #[test]
    fn test_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let db = temp_dir.path().join("agent.db");

        {
            let store = Arc::new(SqliteStore::open(&db).unwrap());
            let index = DedupIndex::open(store).unwrap();
            index.add(entry("a", 1)).unwrap();
            index.add(entry("b", 2)).unwrap();
        }

        let store = Arc::new(SqliteStore::open(&db).unwrap());
        let index = DedupIndex::open(store).unwrap();
        assert!(index.contains("a"));
        assert!(index.contains("b"));
        assert!(!index.contains("c"));
    }

    #[test]
    fn test_import_last_write_wins() {
        let backend = Arc::new(MemoryStore::new());
        let index = DedupIndex::open(backend.clone()).unwrap();
        index.add(entry("a", 10)).unwrap();
        index.add(entry("b", 10)).unwrap();

        let mut newer_b = entry("b", 20);
        newer_b.remote_ref = Some("99".to_string());
        let changed = index
            .import_snapshot(
                vec![entry("a", 5), newer_b.clone(), entry("c", 1)],
                MergeRule::LastWriteWins,
            )
            .unwrap();

        assert_eq!(changed, 2);
        assert_eq!(index.len(), 3);
        let stored = backend.load().unwrap();
        assert_eq!(stored.len(), 3);
        assert!(stored.contains(&newer_b));
        assert!(stored.contains(&entry("a", 10)));

        // Re-importing the same snapshot changes nothing
        let again = index
            .import_snapshot(vec![entry("a", 5), newer_b], MergeRule::LastWriteWins)
            .unwrap();
        assert_eq!(again, 0);
    }

    #[test]
    fn test_concurrent_add_and_import_stay_durable() {
        let temp_dir = TempDir::new().unwrap();
        let db = temp_dir.path().join("agent.db");
        let store = Arc::new(SqliteStore::open(&db).unwrap());
        let index = DedupIndex::open(store).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..100 {
                    index.add(entry(&format!("local-{i}"), i)).unwrap();
                }
            });
            scope.spawn(|| {
                for i in 0..20 {
                    index
                        .import_snapshot(
                            vec![entry(&format!("remote-{i}"), i)],
                            MergeRule::LastWriteWins,
                        )
                        .unwrap();
                }
            });
        });
        assert_eq!(index.len(), 120);
        drop(index);

        let reopened = DedupIndex::open(Arc::new(SqliteStore::open(&db).unwrap())).unwrap();
        assert_eq!(reopened.len(), 120);
        for i in 0..100 {
            assert!(reopened.contains(&format!("local-{i}")));
        }
    }

    #[test]
    fn test_import_replace_and_clear() {
        let backend = Arc::new(MemoryStore::new());
        let index = DedupIndex::open(backend.clone()).unwrap();
        index.add(entry("a", 1)).unwrap();

        index
            .import_snapshot(vec![entry("x", 1)], MergeRule::Replace)
            .unwrap();
        assert!(!index.contains("a"));
        assert!(index.contains("x"));

        index.clear().unwrap();
        assert!(index.is_empty());
        assert!(backend.load().unwrap().is_empty());
    }
}
