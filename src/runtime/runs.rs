//! Agent run history.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Failure;
use crate::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// One execution of an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunRecord {
    pub id: Uuid,
    pub agent_id: String,
    pub prompt: String,
    pub status: RunStatus,
    pub task_id: Option<TaskId>,
    pub result: Option<serde_json::Value>,
    pub error: Option<Failure>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

/// Bounded history, oldest evicted first.
#[derive(Debug)]
pub(crate) struct RunHistory {
    records: Mutex<VecDeque<AgentRunRecord>>,
    limit: usize,
}

impl RunHistory {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            limit: limit.max(1),
        }
    }

    pub(crate) fn begin(&self, agent_id: &str, prompt: &str) -> Uuid {
        let record = AgentRunRecord {
            id: Uuid::new_v4(),
            agent_id: agent_id.to_string(),
            prompt: prompt.to_string(),
            status: RunStatus::Pending,
            task_id: None,
            result: None,
            error: None,
            started_at: None,
            ended_at: None,
            duration_ms: None,
        };
        let id = record.id;
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.push_back(record);
        while records.len() > self.limit {
            records.pop_front();
        }
        id
    }

    pub(crate) fn update<F>(&self, id: Uuid, f: F)
    where
        F: FnOnce(&mut AgentRunRecord),
    {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = records.iter_mut().find(|r| r.id == id) {
            f(record);
        }
    }

    pub(crate) fn get(&self, id: Uuid) -> Option<AgentRunRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Oldest first.
    pub(crate) fn all(&self) -> Vec<AgentRunRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Most recent finished runs of one agent, newest first.
    pub(crate) fn recent(&self, agent_id: &str, n: usize) -> Vec<AgentRunRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .filter(|r| r.agent_id == agent_id && matches!(r.status, RunStatus::Succeeded | RunStatus::Failed))
            .take(n)
            .cloned()
            .collect()
    }
}
