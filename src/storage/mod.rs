//! Chunk-organized persistent storage: pages, chunks, the
//! copy-on-write tree store, and garbage compaction.

pub mod btree;
pub mod chunk;
pub mod chunk_manager;
pub mod compactor;
pub mod maintenance;
pub mod page;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

pub use btree::BTreeStore;
pub use chunk::Chunk;
pub use chunk_manager::ChunkManager;
pub use compactor::ChunkCompactor;

use crate::config::StorageConfig;
use crate::types::{Result, StrataError};

/// A directory of named stores sharing one configuration.
///
/// Opening the same name twice returns the same store; each store lives
/// in its own subdirectory of the base path.
pub struct Storage {
    base_dir: PathBuf,
    config: StorageConfig,
    maps: Mutex<HashMap<String, Arc<BTreeStore>>>,
}

impl Storage {
    /// Opens (creating if needed) the storage root.
    pub fn open(dir: impl AsRef<Path>, config: StorageConfig) -> Result<Storage> {
        let base_dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)?;
        Ok(Storage {
            base_dir,
            config,
            maps: Mutex::new(HashMap::new()),
        })
    }

    /// Root directory holding every store's subdirectory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Opens (creating if needed) the named store.
    pub fn open_map(&self, name: &str) -> Result<Arc<BTreeStore>> {
        validate_map_name(name)?;
        let mut maps = self.maps.lock();
        if let Some(store) = maps.get(name) {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(BTreeStore::open(
            &self.base_dir.join(name),
            name,
            &self.config,
        )?);
        maps.insert(name.to_string(), Arc::clone(&store));
        Ok(store)
    }

    /// Every store opened so far.
    pub fn maps(&self) -> Vec<Arc<BTreeStore>> {
        self.maps.lock().values().cloned().collect()
    }

    /// Configuration shared by this storage root.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Saves every opened store. Returns how many actually wrote a
    /// chunk.
    pub fn save_all(&self) -> Result<usize> {
        let mut saved = 0;
        for store in self.maps() {
            if store.save()? {
                saved += 1;
            }
        }
        Ok(saved)
    }
}

pub(crate) fn validate_map_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(StrataError::Invalid("map name must be 1..=64 characters"));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(StrataError::Invalid(
            "map name may only contain [A-Za-z0-9_-]",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_map_is_memoized() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path(), StorageConfig::default()).unwrap();
        let a = storage.open_map("users").unwrap();
        let b = storage.open_map("users").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(storage.maps().len(), 1);
    }

    #[test]
    fn map_names_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path(), StorageConfig::default()).unwrap();
        assert!(storage.open_map("ok_name-1").is_ok());
        assert!(matches!(
            storage.open_map(""),
            Err(StrataError::Invalid(_))
        ));
        assert!(matches!(
            storage.open_map("../escape"),
            Err(StrataError::Invalid(_))
        ));
    }
}
