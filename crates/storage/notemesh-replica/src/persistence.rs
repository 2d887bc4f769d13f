//! Snapshot persistence gateway
//!
//! The replica writes its whole record set after every mutation. Backends only
//! implement `save`, `load` and `clear`; a failure is reported to the caller
//! and never rolls back in-memory state.

use crate::{error::StorageError, types::NoteRecord};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Result type for persistence operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Durable snapshot store
pub trait PersistenceGateway: Send + Sync {
    /// Replace the snapshot stored under `key`
    fn save(&self, key: &str, records: &[NoteRecord]) -> StorageResult<()>;

    /// Load the snapshot stored under `key`, `None` if nothing was saved
    fn load(&self, key: &str) -> StorageResult<Option<Vec<NoteRecord>>>;

    /// Remove every stored snapshot
    fn clear(&self) -> StorageResult<()>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

/// Volatile backend; snapshots are deep copies so callers cannot alias them
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<String, Vec<NoteRecord>>>,
}

impl MemorySnapshotStore {
    /// Create empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceGateway for MemorySnapshotStore {
    fn save(&self, key: &str, records: &[NoteRecord]) -> StorageResult<()> {
        self.snapshots.lock().insert(key.to_string(), records.to_vec());
        debug!(key, count = records.len(), "saved in-memory snapshot");
        Ok(())
    }

    fn load(&self, key: &str) -> StorageResult<Option<Vec<NoteRecord>>> {
        Ok(self.snapshots.lock().get(key).cloned())
    }

    fn clear(&self) -> StorageResult<()> {
        self.snapshots.lock().clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

/// JSON file per key inside a directory
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    /// Use `dir` for snapshots, creating it if needed
    pub fn open(dir: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !key.starts_with('.');
        if !valid {
            return Err(StorageError::Unavailable(format!("invalid snapshot key: {key:?}")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl PersistenceGateway for FileSnapshotStore {
    fn save(&self, key: &str, records: &[NoteRecord]) -> StorageResult<()> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(records)?;

        // Write-then-rename keeps the previous snapshot intact on a crash
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), count = records.len(), "saved snapshot");
        Ok(())
    }

    fn load(&self, key: &str) -> StorageResult<Option<Vec<NoteRecord>>> {
        let path = self.path_for(key)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn clear(&self) -> StorageResult<()> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "failed to remove snapshot");
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
