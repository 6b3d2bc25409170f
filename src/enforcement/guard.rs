//! Execution guard: tracked work must name a live task.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::EnforcementError;
use crate::task::{TaskId, TaskRegistry};

/// How the guard reacts to untracked work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardMode {
    /// Reject the attempt.
    #[default]
    Strict,
    /// Log a warning and let it through.
    Permissive,
}

impl FromStr for GuardMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "permissive" => Ok(Self::Permissive),
            other => Err(format!("unknown guard mode '{other}' (expected strict or permissive)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionGuard {
    registry: TaskRegistry,
    mode: GuardMode,
}

impl ExecutionGuard {
    pub fn new(registry: TaskRegistry, mode: GuardMode) -> Self {
        Self { registry, mode }
    }

    pub fn mode(&self) -> GuardMode {
        self.mode
    }

    /// Check that `task_id` is present and known to the registry.
    pub fn require_task(&self, task_id: Option<TaskId>, context: &str) -> Result<(), EnforcementError> {
        let violation = match task_id {
            None => EnforcementError::MissingTask {
                context: context.to_string(),
            },
            Some(id) if self.registry.get_task(id).is_none() => EnforcementError::UnknownTask {
                context: context.to_string(),
                id,
            },
            Some(_) => return Ok(()),
        };

        match self.mode {
            GuardMode::Strict => Err(violation),
            GuardMode::Permissive => {
                warn!(context, error = %violation, "Untracked work allowed in permissive mode");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::SystemClock;
    use crate::events::EventBus;
    use crate::store::MemorySnapshotStore;

    fn registry() -> TaskRegistry {
        TaskRegistry::new(
            EventBus::new(),
            Arc::new(MemorySnapshotStore::new()),
            Arc::new(SystemClock),
        )
    }

    #[test]
    fn strict_rejects_missing_and_unknown_tasks() {
        let registry = registry();
        let guard = ExecutionGuard::new(registry.clone(), GuardMode::Strict);

        assert!(matches!(
            guard.require_task(None, "fetch"),
            Err(EnforcementError::MissingTask { .. })
        ));
        assert!(matches!(
            guard.require_task(Some(TaskId::new()), "fetch"),
            Err(EnforcementError::UnknownTask { .. })
        ));

        let task = registry.create_task("fetch", Default::default());
        assert!(guard.require_task(Some(task.id), "fetch").is_ok());
    }

    #[test]
    fn permissive_only_warns() {
        let guard = ExecutionGuard::new(registry(), GuardMode::Permissive);
        assert!(guard.require_task(None, "fetch").is_ok());
        assert!(guard.require_task(Some(TaskId::new()), "fetch").is_ok());
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("Strict".parse::<GuardMode>().unwrap(), GuardMode::Strict);
        assert_eq!(" permissive ".parse::<GuardMode>().unwrap(), GuardMode::Permissive);
        assert!("lenient".parse::<GuardMode>().is_err());
    }
}
