//! Memory collaborator contract.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A fact handed to long-term memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// External memory. Failures are logged by the caller and never surfaced.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Persist an event and return its id.
    async fn save_event(&self, event: MemoryEvent) -> anyhow::Result<String>;
}

/// Keeps events in a vector.
#[derive(Debug, Default)]
pub struct InMemoryMemoryStore {
    events: Mutex<Vec<(String, MemoryEvent)>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MemoryEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, e)| e.clone())
            .collect()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn save_event(&self, event: MemoryEvent) -> anyhow::Result<String> {
        let id = Uuid::new_v4().to_string();
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id.clone(), event));
        Ok(id)
    }
}
