//! Attempt record storage. The tracker owns no global state: records live in
//! an injected store that is explicitly opened and closed.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("attempt store is not open")]
    NotOpen,
    #[error("attempt store io failed: {0}")]
    Io(String),
    #[error("attempt store data is corrupt: {0}")]
    Corrupt(String),
}

/// Failed-login state for one normalized identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub identity: String,
    pub window_start: DateTime<Utc>,
    pub last_attempt: DateTime<Utc>,
    pub attempt_count: u32,
    pub locked_until: Option<DateTime<Utc>>,
}

impl AttemptRecord {
    /// A record with no failures yet counted.
    pub fn fresh(identity: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            identity: identity.into(),
            window_start: now,
            last_attempt: now,
            attempt_count: 0,
            locked_until: None,
        }
    }

    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| now < until)
    }
}

/// Any durable key-value medium keyed by normalized identity.
pub trait AttemptStore: Send + Sync {
    fn open(&self) -> Result<(), StoreError>;
    fn close(&self) -> Result<(), StoreError>;
    fn get(&self, identity: &str) -> Result<Option<AttemptRecord>, StoreError>;
    fn put(&self, identity: &str, record: AttemptRecord) -> Result<(), StoreError>;
    /// Returns whether a record existed.
    fn remove(&self, identity: &str) -> Result<bool, StoreError>;
    fn list_all(&self) -> Result<Vec<AttemptRecord>, StoreError>;
    /// Returns how many records were removed.
    fn remove_all(&self) -> Result<usize, StoreError>;
}

type Records = HashMap<String, AttemptRecord>;

fn with_open<T>(
    state: &Mutex<Option<Records>>,
    f: impl FnOnce(&mut Records) -> T,
) -> Result<T, StoreError> {
    let mut guard = state.lock();
    let records = guard.as_mut().ok_or(StoreError::NotOpen)?;
    Ok(f(records))
}

/// Process-local store. Contents are dropped on close.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<Option<Records>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AttemptStore for MemoryStore {
    fn open(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.is_none() {
            *state = Some(HashMap::new());
        }
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        *self.state.lock() = None;
        Ok(())
    }

    fn get(&self, identity: &str) -> Result<Option<AttemptRecord>, StoreError> {
        with_open(&self.state, |records| records.get(identity).cloned())
    }

    fn put(&self, identity: &str, record: AttemptRecord) -> Result<(), StoreError> {
        with_open(&self.state, |records| {
            records.insert(identity.to_string(), record);
        })
    }

    fn remove(&self, identity: &str) -> Result<bool, StoreError> {
        with_open(&self.state, |records| records.remove(identity).is_some())
    }

    fn list_all(&self) -> Result<Vec<AttemptRecord>, StoreError> {
        with_open(&self.state, |records| records.values().cloned().collect())
    }

    fn remove_all(&self) -> Result<usize, StoreError> {
        with_open(&self.state, |records| {
            let removed = records.len();
            records.clear();
            removed
        })
    }
}

/// Keeps every record in one JSON file. Loaded on `open`, written through on
/// each mutation via a temp file and rename so a crash never leaves a torn
/// file behind.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<Option<Records>>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, records: &Records) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(records).map_err(|e| StoreError::Corrupt(format!("{e}")))?;
        let tmp = self.path.with_extension("tmp");
        let io_err = |e: std::io::Error| StoreError::Io(format!("{e}"));
        let mut file = File::create(&tmp).map_err(io_err)?;
        file.write_all(&json).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::Io(format!("{e}")))?;
        debug!(path = %self.path.display(), records = records.len(), "attempt store persisted");
        Ok(())
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Records) -> T) -> Result<T, StoreError> {
        let mut guard = self.state.lock();
        let records = guard.as_mut().ok_or(StoreError::NotOpen)?;
        let result = f(records);
        self.persist(records)?;
        Ok(result)
    }
}

impl AttemptStore for JsonFileStore {
    fn open(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Ok(());
        }
        let records = match fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => HashMap::new(),
            Ok(content) => {
                serde_json::from_str(&content).map_err(|e| StoreError::Corrupt(format!("{e}")))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(StoreError::Io(format!("{e}"))),
        };
        *state = Some(records);
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if let Some(records) = state.take() {
            self.persist(&records)?;
        }
        Ok(())
    }

    fn get(&self, identity: &str) -> Result<Option<AttemptRecord>, StoreError> {
        with_open(&self.state, |records| records.get(identity).cloned())
    }

    fn put(&self, identity: &str, record: AttemptRecord) -> Result<(), StoreError> {
        self.mutate(|records| {
            records.insert(identity.to_string(), record);
        })
    }

    fn remove(&self, identity: &str) -> Result<bool, StoreError> {
        self.mutate(|records| records.remove(identity).is_some())
    }

    fn list_all(&self) -> Result<Vec<AttemptRecord>, StoreError> {
        with_open(&self.state, |records| records.values().cloned().collect())
    }

    fn remove_all(&self) -> Result<usize, StoreError> {
        self.mutate(|records| {
            let removed = records.len();
            records.clear();
            removed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(identity: &str) -> AttemptRecord {
        let mut record = AttemptRecord::fresh(identity, Utc::now());
        record.attempt_count = 2;
        record
    }

    #[test]
    fn closed_store_rejects_access() {
        let store = MemoryStore::new();
        assert!(matches!(store.get("a"), Err(StoreError::NotOpen)));
        store.open().unwrap();
        store.put("a", record("a")).unwrap();
        assert_eq!(store.get("a").unwrap().unwrap().attempt_count, 2);
        store.close().unwrap();
        assert!(matches!(store.list_all(), Err(StoreError::NotOpen)));
    }

    #[test]
    fn memory_store_removes() {
        let store = MemoryStore::new();
        store.open().unwrap();
        store.put("a", record("a")).unwrap();
        store.put("b", record("b")).unwrap();
        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
        assert_eq!(store.remove_all().unwrap(), 1);
        assert!(store.list_all().unwrap().is_empty());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("attempts.json");

        let store = JsonFileStore::new(&path);
        store.open().unwrap();
        store.put("a@b.com", record("a@b.com")).unwrap();
        store.close().unwrap();

        let reopened = JsonFileStore::new(&path);
        reopened.open().unwrap();
        let loaded = reopened.get("a@b.com").unwrap().expect("record should persist");
        assert_eq!(loaded.attempt_count, 2);
        assert_eq!(reopened.remove_all().unwrap(), 1);
    }

    #[test]
    fn file_store_writes_through_without_leftovers() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("attempts.json");
        let store = JsonFileStore::new(&path);
        store.open().unwrap();
        store.put("a@b.com", record("a@b.com")).unwrap();

        // visible on disk before close, and the temp file is gone
        let on_disk: HashMap<String, AttemptRecord> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["a@b.com"].attempt_count, 2);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn file_store_reports_corruption() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("attempts.json");
        fs::write(&path, "{not json").unwrap();
        let store = JsonFileStore::new(&path);
        assert!(matches!(store.open(), Err(StoreError::Corrupt(_))));
    }
}
