//! Task entity.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Failure;
use crate::task::state::TaskStatus;

/// Opaque unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// One timestamped log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

impl LogEntry {
    pub fn new(message: impl Into<String>) -> Self {
        Self::at(Utc::now(), message)
    }

    pub fn at(at: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            at,
            message: message.into(),
        }
    }
}

/// A tracked unit of work. Only the task registry mutates these; everything
/// else sees clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Type tag, also used for heavy-work classification.
    pub task_type: String,
    pub status: TaskStatus,
    /// Append-only streamed output.
    pub output: Vec<String>,
    /// Append-only log.
    pub logs: Vec<LogEntry>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Value returned by the work, once done.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Why the task failed or was cancelled.
    #[serde(default)]
    pub error: Option<Failure>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Task {
    pub(crate) fn new(
        task_type: impl Into<String>,
        metadata: serde_json::Map<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            task_type: task_type.into(),
            status: TaskStatus::Created,
            output: Vec::new(),
            logs: Vec::new(),
            created_at: now,
            started_at: None,
            ended_at: None,
            result: None,
            error: None,
            metadata,
        }
    }

    /// Time spent running, up to `now` if still in flight.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.started_at.map(|start| {
            let end = self.ended_at.unwrap_or(now);
            crate::clock::elapsed_between(start, end)
        })
    }

    /// Apply a status change and stamp the matching timestamp. Callers check
    /// `can_transition_to` first.
    pub(crate) fn apply_status(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        self.status = status;
        match status {
            TaskStatus::Running if self.started_at.is_none() => self.started_at = Some(now),
            s if s.is_terminal() => self.ended_at = Some(now),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_is_created_and_empty() {
        let task = Task::new("summarize", Default::default(), Utc::now());
        assert_eq!(task.status, TaskStatus::Created);
        assert!(task.output.is_empty());
        assert!(task.logs.is_empty());
        assert!(task.started_at.is_none());
    }

    #[test]
    fn apply_status_stamps_timestamps() {
        let now = Utc::now();
        let mut task = Task::new("x", Default::default(), now);
        task.apply_status(TaskStatus::Running, now);
        assert_eq!(task.started_at, Some(now));

        let later = now + chrono::Duration::seconds(3);
        task.apply_status(TaskStatus::Partial, later);
        task.apply_status(TaskStatus::Running, later);
        assert_eq!(task.started_at, Some(now), "resuming keeps the first start");

        task.apply_status(TaskStatus::Done, later);
        assert_eq!(task.ended_at, Some(later));
        assert_eq!(task.elapsed(later), Some(Duration::from_secs(3)));
    }

    #[test]
    fn task_snapshot_roundtrip_keeps_status() {
        let task = Task::new("parse", Default::default(), Utc::now());
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["status"], "CREATED");
        let back: Task = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, task.id);
    }
}
