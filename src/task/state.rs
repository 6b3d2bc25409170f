//! Task state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Registered, not yet started.
    Created,
    /// Work is in flight.
    Running,
    /// Work is in flight and has streamed partial output.
    Partial,
    /// Work finished successfully.
    Done,
    /// Work failed, was frozen, or was interrupted by a restart.
    Failed,
    /// Work was cancelled.
    Canceled,
}

impl TaskStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // From Created
            (Created, Running) | (Created, Canceled) |
            // Streaming toggles
            (Running, Partial) | (Partial, Running) |
            // Settling
            (Running, Done) | (Running, Failed) | (Running, Canceled) |
            (Partial, Done) | (Partial, Failed) | (Partial, Canceled)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Canceled)
    }

    /// Work is in flight (running or streaming).
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running | Self::Partial)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Partial => "PARTIAL",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        };
        write!(f, "{s}")
    }
}
