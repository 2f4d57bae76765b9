//! JSON file backend

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::types::{RelayError, Result};

use super::KeyValueStore;

/// Store persisted as a single JSON object.
///
/// The whole map is held in memory; each mutation rewrites the file through
/// a temporary sibling and a rename so a crash never leaves half a record.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    items: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open (or create) the store at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let items = match fs::read_to_string(path) {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        let store = Self {
            path: path.to_path_buf(),
            items: Mutex::new(items),
        };
        // Probe writability up front so a read-only location is detected at startup
        {
            let items = store.lock()?;
            store.persist(&items)?;
        }
        debug!(path = %path.display(), "Opened file store");
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.items
            .lock()
            .map_err(|_| RelayError::Storage("file store lock poisoned".into()))
    }

    fn persist(&self, items: &BTreeMap<String, String>) -> Result<()> {
        let serialized = serde_json::to_string_pretty(items)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serialized)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut items = self.lock()?;
        items.insert(key.to_string(), value.to_string());
        self.persist(&items)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut items = self.lock()?;
        if items.remove(key).is_some() {
            self.persist(&items)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = FileStore::open(&path).unwrap();
        store.set("trusted", "{\"nonce\":\"00\"}").unwrap();
        store.set("autoSession", "auto").unwrap();
        store.remove("autoSession").unwrap();
        drop(store);

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(
            reopened.get("trusted").unwrap().as_deref(),
            Some("{\"nonce\":\"00\"}")
        );
        assert_eq!(reopened.get("autoSession").unwrap(), None);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "not json").unwrap();

        assert!(FileStore::open(&path).is_err());
    }
}
