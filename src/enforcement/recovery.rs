//! Startup crash recovery.
//!
//! Tasks loaded from the previous process's snapshot are never resumed. Any
//! that were mid-flight are reclassified FAILED before they are imported.

use tracing::{info, warn};

use crate::error::{Failure, SnapshotError};
use crate::events::Event;
use crate::store::{SnapshotStore, TASK_SNAPSHOT_KEY};
use crate::task::{LogEntry, TaskId, TaskRegistry, TaskSnapshot, TaskStatus};

/// Log line attached to every task cut short by a restart.
pub const INTERRUPTED_MESSAGE: &str = "interrupted by process restart";

/// What recovery found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Tasks present in the snapshot.
    pub loaded: usize,
    /// Tasks added to the registry (ids already live are skipped).
    pub imported: usize,
    /// Tasks that were RUNNING or PARTIAL and are now FAILED.
    pub interrupted: Vec<TaskId>,
}

/// Load the last snapshot from `store` and fold it into `registry`.
///
/// A missing snapshot is not an error. An unreadable one is returned as an
/// error and the registry is left untouched.
pub fn recover(registry: &TaskRegistry, store: &dyn SnapshotStore) -> Result<RecoveryReport, SnapshotError> {
    let Some(blob) = store.load(TASK_SNAPSHOT_KEY)? else {
        info!("No task snapshot found, starting fresh");
        return Ok(RecoveryReport::default());
    };
    let snapshot: TaskSnapshot = serde_json::from_str(&blob)?;
    let now = registry.clock().now();

    let mut report = RecoveryReport {
        loaded: snapshot.tasks.len(),
        ..Default::default()
    };
    let mut tasks = snapshot.tasks;
    for task in tasks.iter_mut().filter(|t| t.status.is_running()) {
        task.apply_status(TaskStatus::Failed, now);
        task.logs.push(LogEntry::at(now, INTERRUPTED_MESSAGE));
        task.error = Some(Failure::execution(INTERRUPTED_MESSAGE));
        report.interrupted.push(task.id);
    }

    let reclassified: Vec<_> = tasks
        .iter()
        .filter(|t| report.interrupted.contains(&t.id))
        .cloned()
        .collect();
    report.imported = registry.import(tasks);

    for task in reclassified {
        if registry.get_task(task.id).is_some_and(|t| t.status == TaskStatus::Failed) {
            registry.bus().emit(Event::TaskUpdated { task });
        }
    }

    if let Err(e) = registry.persist() {
        warn!(error = %e, "Failed to persist snapshot after recovery");
    }

    info!(
        loaded = report.loaded,
        imported = report.imported,
        interrupted = report.interrupted.len(),
        saved_at = %snapshot.saved_at,
        "Recovered tasks from snapshot"
    );
    Ok(report)
}
