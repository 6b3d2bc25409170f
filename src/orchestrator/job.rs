//! Orchestrator jobs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Failure;
use crate::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A queued request to run an agent. `retry_count` never exceeds
/// `max_retries`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub agent_id: Option<String>,
    pub prompt: String,
    pub context: serde_json::Value,
    /// Higher runs first.
    pub priority: i32,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Position in enqueue order; refreshed on every re-enqueue.
    pub seq: u64,
    /// Task of the most recent attempt.
    pub task_id: Option<TaskId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<Failure>,
}

/// What callers hand to [`AgentOrchestrator::enqueue`](crate::orchestrator::AgentOrchestrator::enqueue).
#[derive(Debug, Clone, Default)]
pub struct JobRequest {
    pub agent_id: Option<String>,
    pub prompt: String,
    pub context: serde_json::Value,
    pub priority: i32,
    /// Overrides the orchestrator default.
    pub max_retries: Option<u32>,
    /// Overrides the orchestrator default.
    pub timeout: Option<Duration>,
}

impl JobRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
