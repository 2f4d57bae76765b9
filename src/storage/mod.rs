//! Key-value persistence backends
//!
//! The trusted-key record and its flags live behind [`KeyValueStore`] so the
//! credential logic never depends on where bytes end up. Two backends ship:
//!
//! - [`MemoryStore`]: process-lifetime only, used in tests and as the fallback
//!   when persistent storage is unavailable
//! - [`FileStore`]: a JSON object on disk, rewritten atomically on every change

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::path::Path;
use std::sync::Arc;

use tracing::warn;

use crate::types::Result;

/// Minimal string key-value interface
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` if the key is absent
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or overwrite a value
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a key. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

/// A store together with whether persistence had to be abandoned
#[derive(Clone)]
pub struct StorageHandle {
    pub store: Arc<dyn KeyValueStore>,
    /// True when the persistent backend could not be opened and the
    /// in-memory fallback is in use
    pub blocked: bool,
}

impl StorageHandle {
    /// Wrap an already opened store
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            blocked: false,
        }
    }

    /// Fresh in-memory store
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }
}

/// Open the file store at `path`, falling back to memory-only mode.
///
/// The failure is reported exactly once here; callers only see the
/// `blocked` flag afterwards.
pub fn open_persistent(path: &Path) -> StorageHandle {
    match FileStore::open(path) {
        Ok(store) => StorageHandle::new(Arc::new(store)),
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "Persistent storage unavailable, continuing without trusted-session persistence"
            );
            StorageHandle {
                store: Arc::new(MemoryStore::new()),
                blocked: true,
            }
        }
    }
}
