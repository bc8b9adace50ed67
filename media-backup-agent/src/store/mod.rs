//! Key/value configuration storage.
//!
//! [`ConfigStore`] is the only interface the core uses for settings. Values are
//! stored as strings; integers and string sets are encoded on top of that so
//! any backend with atomic single-key writes can implement it.

pub mod sqlite;

use crate::dedup::{DedupBackend, DedupEntry};
use crate::Result;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

pub use sqlite::SqliteStore;

pub trait ConfigStore: Send + Sync {
    fn get_string(&self, key: &str) -> Result<Option<String>>;

    fn put_string(&self, key: &str, value: &str) -> Result<()>;

    /// Unparseable values read as absent.
    fn get_int(&self, key: &str) -> Result<Option<i64>> {
        Ok(self
            .get_string(key)?
            .and_then(|raw| raw.trim().parse::<i64>().ok()))
    }

    fn put_int(&self, key: &str, value: i64) -> Result<()> {
        self.put_string(key, &value.to_string())
    }

    /// Sets are stored as a JSON array of strings.
    fn get_string_set(&self, key: &str) -> Result<Option<BTreeSet<String>>> {
        match self.get_string(key)? {
            Some(raw) => Ok(serde_json::from_str::<BTreeSet<String>>(&raw).ok()),
            None => Ok(None),
        }
    }

    fn put_string_set(&self, key: &str, values: &BTreeSet<String>) -> Result<()> {
        self.put_string(key, &serde_json::to_string(values)?)
    }
}

/// In-process store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    delivered: Mutex<HashMap<String, DedupEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryStore {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn put_string(&self, key: &str, value: &str) -> Result<()> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

impl DedupBackend for MemoryStore {
    fn load(&self) -> Result<Vec<DedupEntry>> {
        Ok(self.delivered.lock().values().cloned().collect())
    }

    fn insert(&self, entry: &DedupEntry) -> Result<()> {
        self.delivered
            .lock()
            .entry(entry.content_hash.clone())
            .or_insert_with(|| entry.clone());
        Ok(())
    }

    fn replace_all(&self, entries: &[DedupEntry]) -> Result<()> {
        let mut delivered = self.delivered.lock();
        delivered.clear();
        for entry in entries {
            delivered.insert(entry.content_hash.clone(), entry.clone());
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.delivered.lock().clear();
        Ok(())
    }
}
