//! Error types for the task core.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::task::{TaskId, TaskStatus};

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Enforcement error: {0}")]
    Enforcement(#[from] EnforcementError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Task registry errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: TaskId },

    #[error("Task {id} is {state}, cannot {operation}")]
    InvalidState {
        id: TaskId,
        state: TaskStatus,
        operation: &'static str,
    },
}

/// Snapshot persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Runtime enforcement errors.
#[derive(Debug, thiserror::Error)]
pub enum EnforcementError {
    #[error("Tracked work '{context}' attempted without an associated task")]
    MissingTask { context: String },

    #[error("Tracked work '{context}' references unknown task {id}")]
    UnknownTask { context: String, id: TaskId },
}

/// Worker bridge errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("No worker available to run heavy task {task_id}")]
    Unavailable { task_id: TaskId },

    #[error("Worker call for task {task_id} timed out after {timeout:?}")]
    Timeout { task_id: TaskId, timeout: Duration },

    #[error("Worker call for task {task_id} was cancelled")]
    Cancelled { task_id: TaskId },

    #[error("Worker failed task {task_id}: {message}")]
    Failed { task_id: TaskId, message: String },
}

/// Agent executor errors (for failures outside a run's own audit trail).
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Run {run_id} is not active")]
    RunNotActive { run_id: uuid::Uuid },
}

/// Agent runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Agent {id} is already registered")]
    DuplicateAgent { id: String },

    #[error("Agent {agent} references unknown tool {tool}")]
    UnknownTool { agent: String, tool: String },

    #[error("Tool {id} is already registered")]
    DuplicateTool { id: String },

    #[error("Agent {id} not found")]
    AgentNotFound { id: String },

    #[error("No agent matches the request and no default agent is configured")]
    NoAgentSelected,

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Orchestrator errors.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Job {id} not found")]
    NotFound { id: uuid::Uuid },

    #[error("Job {id} is {state}, cannot {operation}")]
    InvalidState {
        id: uuid::Uuid,
        state: String,
        operation: &'static str,
    },
}

/// Classification of a terminal failure, shared by tasks, runs, and jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Operation on an entity in the wrong lifecycle state.
    InvalidState,
    /// A gated action was refused by the consent gate.
    ConsentDenied,
    /// A navigation target violated the domain policy.
    DomainBlocked,
    /// A wall-clock or step budget was exceeded.
    Timeout,
    /// The underlying primitive or entry point failed.
    Execution,
    /// The watchdog force-terminated a stuck task.
    Frozen,
    /// The work was cancelled.
    Cancelled,
}

impl FailureKind {
    /// Whether the orchestrator may retry a job that failed this way.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution | Self::Timeout)
    }

    /// Classify an error returned by work or an entry point.
    pub fn classify(err: &anyhow::Error) -> Self {
        if let Some(failure) = err.downcast_ref::<Failure>() {
            return failure.kind;
        }
        if let Some(TaskError::InvalidState { .. }) = err.downcast_ref::<TaskError>() {
            return Self::InvalidState;
        }
        if let Some(worker) = err.downcast_ref::<WorkerError>() {
            return match worker {
                WorkerError::Timeout { .. } => Self::Timeout,
                WorkerError::Cancelled { .. } => Self::Cancelled,
                _ => Self::Execution,
            };
        }
        Self::Execution
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidState => "invalid_state",
            Self::ConsentDenied => "consent_denied",
            Self::DomainBlocked => "domain_blocked",
            Self::Timeout => "timeout",
            Self::Execution => "execution_error",
            Self::Frozen => "frozen",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A classified, user-visible failure: a kind plus a human-readable message.
///
/// Agents return this through `anyhow` when they want the orchestrator to see
/// something other than a plain execution error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Execution, message)
    }

    pub fn consent_denied(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ConsentDenied, message)
    }

    pub fn domain_blocked(message: impl Into<String>) -> Self {
        Self::new(FailureKind::DomainBlocked, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    /// Build a failure from an arbitrary error, keeping its classification.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        if let Some(failure) = err.downcast_ref::<Failure>() {
            return failure.clone();
        }
        Self::new(FailureKind::classify(err), format!("{err:#}"))
    }
}

/// Result type alias for the task core.
pub type Result<T> = std::result::Result<T, Error>;
