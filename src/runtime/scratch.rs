//! Job-scoped scratch space.

use std::sync::{Arc, Mutex};

type Map = serde_json::Map<String, serde_json::Value>;

/// Scratch state for one job attempt: private `memory` plus `shared_state`
/// that tools and the agent both see. Clones share the same maps; a new
/// context starts empty.
#[derive(Debug, Clone, Default)]
pub struct ScratchContext {
    memory: Arc<Mutex<Map>>,
    shared_state: Arc<Mutex<Map>>,
}

impl ScratchContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&self, key: impl Into<String>, value: serde_json::Value) {
        self.memory
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), value);
    }

    pub fn recall(&self, key: &str) -> Option<serde_json::Value> {
        self.memory
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn set_shared(&self, key: impl Into<String>, value: serde_json::Value) {
        self.shared_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), value);
    }

    pub fn shared(&self, key: &str) -> Option<serde_json::Value> {
        self.shared_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn memory_snapshot(&self) -> Map {
        self.memory.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn shared_snapshot(&self) -> Map {
        self.shared_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
