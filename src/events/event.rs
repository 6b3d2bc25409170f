//! Event topics and payloads.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::executor::AuditLogEntry;
use crate::orchestrator::Job;
use crate::task::{LogEntry, Task, TaskId};

/// Topic an event is published under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "task:created")]
    TaskCreated,
    #[serde(rename = "task:updated")]
    TaskUpdated,
    #[serde(rename = "task:log")]
    TaskLog,
    #[serde(rename = "task:output")]
    TaskOutput,
    #[serde(rename = "task:completed")]
    TaskCompleted,
    #[serde(rename = "task:cancelled")]
    TaskCancelled,
    #[serde(rename = "task:frozen")]
    TaskFrozen,
    #[serde(rename = "task:progress")]
    TaskProgress,
    #[serde(rename = "agent:run:started")]
    RunStarted,
    #[serde(rename = "agent:run:completed")]
    RunCompleted,
    #[serde(rename = "agent:run:failed")]
    RunFailed,
    #[serde(rename = "agent:run:cancelled")]
    RunCancelled,
    #[serde(rename = "agent:action:executed")]
    ActionExecuted,
    #[serde(rename = "agent:action:failed")]
    ActionFailed,
    #[serde(rename = "agent:job:enqueued")]
    JobEnqueued,
    #[serde(rename = "agent:job:started")]
    JobStarted,
    #[serde(rename = "agent:job:completed")]
    JobCompleted,
    #[serde(rename = "agent:job:failed")]
    JobFailed,
    #[serde(rename = "agent:job:cancelled")]
    JobCancelled,
    #[serde(rename = "agent:event")]
    AgentEvent,
    #[serde(rename = "worker:result")]
    WorkerResult,
    #[serde(rename = "worker:error")]
    WorkerError,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCreated => "task:created",
            Self::TaskUpdated => "task:updated",
            Self::TaskLog => "task:log",
            Self::TaskOutput => "task:output",
            Self::TaskCompleted => "task:completed",
            Self::TaskCancelled => "task:cancelled",
            Self::TaskFrozen => "task:frozen",
            Self::TaskProgress => "task:progress",
            Self::RunStarted => "agent:run:started",
            Self::RunCompleted => "agent:run:completed",
            Self::RunFailed => "agent:run:failed",
            Self::RunCancelled => "agent:run:cancelled",
            Self::ActionExecuted => "agent:action:executed",
            Self::ActionFailed => "agent:action:failed",
            Self::JobEnqueued => "agent:job:enqueued",
            Self::JobStarted => "agent:job:started",
            Self::JobCompleted => "agent:job:completed",
            Self::JobFailed => "agent:job:failed",
            Self::JobCancelled => "agent:job:cancelled",
            Self::AgentEvent => "agent:event",
            Self::WorkerResult => "worker:result",
            Self::WorkerError => "worker:error",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event published on the bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TaskCreated { task: Task },
    TaskUpdated { task: Task },
    TaskLog { task_id: TaskId, entry: LogEntry },
    TaskOutput { task_id: TaskId, chunk: String },
    TaskCompleted { task: Task },
    TaskCancelled { task: Task, reason: String },
    TaskFrozen { task_id: TaskId, running_for_ms: u64, reason: String },
    TaskProgress { task_id: TaskId, progress: serde_json::Value },

    RunStarted { run_id: Uuid, action_count: usize },
    RunCompleted { run_id: Uuid, steps: usize, truncated: bool },
    RunFailed { run_id: Uuid, error: String, blocked: bool },
    RunCancelled { run_id: Uuid },
    ActionExecuted { run_id: Uuid, entry: AuditLogEntry },
    ActionFailed { run_id: Uuid, entry: AuditLogEntry },

    JobEnqueued { job: Job },
    JobStarted { job: Job },
    JobCompleted { job: Job },
    JobFailed { job: Job },
    JobCancelled { job: Job },

    /// Free-form event dispatched by an agent entry point.
    Agent {
        agent_id: String,
        name: String,
        payload: serde_json::Value,
    },

    WorkerResult { task_id: TaskId, result: serde_json::Value },
    WorkerError { task_id: TaskId, error: String },
}

impl Event {
    /// The topic this event is delivered under.
    pub fn topic(&self) -> Topic {
        match self {
            Self::TaskCreated { .. } => Topic::TaskCreated,
            Self::TaskUpdated { .. } => Topic::TaskUpdated,
            Self::TaskLog { .. } => Topic::TaskLog,
            Self::TaskOutput { .. } => Topic::TaskOutput,
            Self::TaskCompleted { .. } => Topic::TaskCompleted,
            Self::TaskCancelled { .. } => Topic::TaskCancelled,
            Self::TaskFrozen { .. } => Topic::TaskFrozen,
            Self::TaskProgress { .. } => Topic::TaskProgress,
            Self::RunStarted { .. } => Topic::RunStarted,
            Self::RunCompleted { .. } => Topic::RunCompleted,
            Self::RunFailed { .. } => Topic::RunFailed,
            Self::RunCancelled { .. } => Topic::RunCancelled,
            Self::ActionExecuted { .. } => Topic::ActionExecuted,
            Self::ActionFailed { .. } => Topic::ActionFailed,
            Self::JobEnqueued { .. } => Topic::JobEnqueued,
            Self::JobStarted { .. } => Topic::JobStarted,
            Self::JobCompleted { .. } => Topic::JobCompleted,
            Self::JobFailed { .. } => Topic::JobFailed,
            Self::JobCancelled { .. } => Topic::JobCancelled,
            Self::Agent { .. } => Topic::AgentEvent,
            Self::WorkerResult { .. } => Topic::WorkerResult,
            Self::WorkerError { .. } => Topic::WorkerError,
        }
    }
}
