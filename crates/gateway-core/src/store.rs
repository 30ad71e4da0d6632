//! Key-Value Storage
//!
//! The mint history and the claim mailbox sit on top of [`Repository`], a
//! string-keyed store whose only mutating primitive is [`Repository::modify`]:
//! a read-check-write run under the store's writer lock. Every
//! implementation must make the write durable before `modify` returns, and
//! must leave the previous value in place when persistence fails.

use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{MintError, Result};

/// Storage trait for mint history and pending claims
pub trait Repository<V>: Send + Sync {
    /// Get the value stored under `key`
    fn get(&self, key: &str) -> Result<Option<V>>;

    /// Atomically inspect and optionally replace the value under `key`
    ///
    /// `f` sees the current value while the writer lock is held. Returning
    /// `Some` stores the new value; returning `None` leaves the entry as is.
    /// Returns whether a write happened.
    fn modify(&self, key: &str, f: &mut dyn FnMut(Option<&V>) -> Option<V>) -> Result<bool>;

    /// Remove and return the value under `key`
    fn take(&self, key: &str) -> Result<Option<V>>;

    /// Number of stored entries
    fn len(&self) -> Result<usize>;

    /// Copy of every entry, ordered by key
    fn entries(&self) -> Result<Vec<(String, V)>>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Insert or overwrite
    fn upsert(&self, key: &str, value: V) -> Result<()> {
        let mut value = Some(value);
        self.modify(key, &mut |_| value.take()).map(|_| ())
    }

    /// Insert only when `key` is absent; returns whether the insert happened
    fn insert_if_absent(&self, key: &str, value: V) -> Result<bool> {
        let mut value = Some(value);
        self.modify(key, &mut |current| {
            if current.is_none() { value.take() } else { None }
        })
    }
}

/// In-memory store (for tests and development)
pub struct MemoryStore<V> {
    entries: Mutex<BTreeMap<String, V>>,
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> MemoryStore<V> {
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<V: Clone + Send + Sync> Repository<V> for MemoryStore<V> {
    fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn modify(&self, key: &str, f: &mut dyn FnMut(Option<&V>) -> Option<V>) -> Result<bool> {
        let mut entries = self.entries.lock();
        let next = f(entries.get(key));
        match next {
            Some(value) => {
                entries.insert(key.to_string(), value);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn take(&self, key: &str) -> Result<Option<V>> {
        Ok(self.entries.lock().remove(key))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.entries.lock().len())
    }

    fn entries(&self) -> Result<Vec<(String, V)>> {
        Ok(self
            .entries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// JSON-file store
///
/// Keeps the whole map in memory and rewrites the file on every mutation
/// (temp file, fsync, rename, directory fsync) while holding the lock.
pub struct JsonFileStore<V> {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, V>>,
}

impl<V> JsonFileStore<V>
where
    V: Serialize + DeserializeOwned,
{
    /// Open the store at `path`, loading existing entries
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| MintError::Storage(format!("create {}: {e}", parent.display())))?;
        }

        let entries = if path.exists() {
            let bytes = fs::read(&path)
                .map_err(|e| MintError::Storage(format!("read {}: {e}", path.display())))?;
            if bytes.is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_slice(&bytes)
                    .map_err(|e| MintError::Storage(format!("parse {}: {e}", path.display())))?
            }
        } else {
            BTreeMap::new()
        };

        tracing::debug!(path = %path.display(), entries = entries.len(), "Opened JSON store");

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, V>) -> Result<()> {
        let payload = serde_json::to_vec(entries)?;
        write_file_atomic_durable(&self.path, &payload).map_err(|e| {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to persist store");
            MintError::Storage(format!("write {}: {e}", self.path.display()))
        })
    }
}

impl<V> Repository<V> for JsonFileStore<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn modify(&self, key: &str, f: &mut dyn FnMut(Option<&V>) -> Option<V>) -> Result<bool> {
        let mut entries = self.entries.lock();
        let Some(value) = f(entries.get(key)) else {
            return Ok(false);
        };

        let previous = entries.insert(key.to_string(), value);
        if let Err(e) = self.persist(&entries) {
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(true)
    }

    fn take(&self, key: &str) -> Result<Option<V>> {
        let mut entries = self.entries.lock();
        let Some(value) = entries.remove(key) else {
            return Ok(None);
        };

        if let Err(e) = self.persist(&entries) {
            entries.insert(key.to_string(), value);
            return Err(e);
        }
        Ok(Some(value))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.entries.lock().len())
    }

    fn entries(&self) -> Result<Vec<(String, V)>> {
        Ok(self
            .entries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(unix)]
fn sync_directory(path: &Path) -> std::io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn write_file_atomic_durable(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut f = File::create(&tmp)?;
    f.write_all(bytes)?;
    f.sync_all()?;
    fs::rename(&tmp, path)?;

    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => sync_directory(parent),
        None => sync_directory(Path::new(".")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_insert_if_absent_first_wins() {
        let store = MemoryStore::new();
        assert!(store.insert_if_absent("dep1", 1u64).unwrap());
        assert!(!store.insert_if_absent("dep1", 2u64).unwrap());
        assert_eq!(store.get("dep1").unwrap(), Some(1));
    }

    #[test]
    fn test_take_removes_entry() {
        let store = MemoryStore::new();
        store.upsert("k", "v".to_string()).unwrap();
        assert_eq!(store.take("k").unwrap().as_deref(), Some("v"));
        assert_eq!(store.take("k").unwrap(), None);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_json_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");

        {
            let store = JsonFileStore::open(&path).unwrap();
            store.upsert("a", 1u64).unwrap();
            store.upsert("b", 2u64).unwrap();
            store.take("a").unwrap();
        }

        let reopened: JsonFileStore<u64> = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.get("a").unwrap(), None);
        assert_eq!(reopened.get("b").unwrap(), Some(2));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_failed_persist_leaves_state_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("claims.json");
        let store = JsonFileStore::open(&path).unwrap();
        store.upsert("kept", 1u64).unwrap();

        // Replace the parent directory with a file so the next write fails.
        fs::remove_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path.parent().unwrap(), b"blocker").unwrap();

        let err = store.upsert("new", 2u64).unwrap_err();
        assert!(matches!(err, MintError::Storage(_)));
        assert_eq!(store.get("new").unwrap(), None);

        let err = store.take("kept").unwrap_err();
        assert!(matches!(err, MintError::Storage(_)));
        assert_eq!(store.get("kept").unwrap(), Some(1));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        fs::write(&path, b"{not json").unwrap();

        let result: Result<JsonFileStore<u64>> = JsonFileStore::open(&path);
        assert!(matches!(result, Err(MintError::Storage(_))));
    }
}
