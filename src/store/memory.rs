//! In-memory snapshot store.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::SnapshotError;
use crate::store::traits::SnapshotStore;

/// Keeps blobs in a map. Useful for tests and for hosts that do not want
/// anything on disk.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    blobs: Mutex<HashMap<String, String>>,
    writes: Mutex<usize>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a blob, e.g. a snapshot left behind by a previous process.
    pub fn with_blob(key: &str, blob: impl Into<String>) -> Self {
        let store = Self::new();
        store
            .blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), blob.into());
        store
    }

    /// Number of `save` calls so far.
    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, key: &str, blob: &str) -> Result<(), SnapshotError> {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), blob.to_string());
        *self.writes.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<String>, SnapshotError> {
        Ok(self
            .blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }
}
