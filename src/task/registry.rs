//! Task registry: the sole owner and mutator of task state.
//!
//! Every transition is validated against the state machine, stamped with the
//! injected clock, persisted as a full snapshot, and then announced on the
//! event bus. Nothing that goes wrong inside task work escapes as an error:
//! it lands on the task as a terminal status plus a message.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Failure, FailureKind, SnapshotError, TaskError, WorkerError};
use crate::events::{Event, EventBus};
use crate::store::{SnapshotStore, TASK_SNAPSHOT_KEY};
use crate::task::model::{LogEntry, Task, TaskId};
use crate::task::state::TaskStatus;
use crate::worker::{WorkerBridge, should_use_worker};

/// Future produced by inline task work.
pub type TaskFuture = BoxFuture<'static, anyhow::Result<serde_json::Value>>;

/// Serialized form of every task, written under [`TASK_SNAPSHOT_KEY`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub saved_at: DateTime<Utc>,
    pub tasks: Vec<Task>,
}

struct TaskEntry {
    task: Task,
    cancel: CancellationToken,
}

#[derive(Default)]
struct TaskTable {
    entries: HashMap<TaskId, TaskEntry>,
    /// Creation order, for stable listing and snapshots.
    order: Vec<TaskId>,
}

impl TaskTable {
    fn get_mut(&mut self, id: TaskId) -> Result<&mut TaskEntry, TaskError> {
        self.entries.get_mut(&id).ok_or(TaskError::NotFound { id })
    }

    fn snapshot(&self, now: DateTime<Utc>) -> TaskSnapshot {
        TaskSnapshot {
            saved_at: now,
            tasks: self
                .order
                .iter()
                .filter_map(|id| self.entries.get(id))
                .map(|e| e.task.clone())
                .collect(),
        }
    }
}

struct Inner {
    table: Mutex<TaskTable>,
    bus: EventBus,
    store: Arc<dyn SnapshotStore>,
    clock: Arc<dyn Clock>,
    bridge: Option<Arc<WorkerBridge>>,
}

/// Handle to the task registry. Clones share state.
#[derive(Clone)]
pub struct TaskRegistry {
    inner: Arc<Inner>,
}

/// What inline work gets to see of its task.
#[derive(Clone)]
pub struct TaskContext {
    id: TaskId,
    cancel: CancellationToken,
    registry: TaskRegistry,
}

impl TaskContext {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Cancellation handle; work should check it at every suspension point.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Append an output chunk (moves RUNNING to PARTIAL).
    pub fn stream(&self, chunk: impl Into<String>) -> Result<(), TaskError> {
        self.registry.stream_output(self.id, chunk)
    }

    /// Append a log line.
    pub fn log(&self, message: impl Into<String>) -> Result<(), TaskError> {
        self.registry.log_task(self.id, message)
    }

    /// Leave PARTIAL and go back to RUNNING.
    pub fn resume(&self) -> Result<(), TaskError> {
        self.registry.resume_task(self.id).map(|_| ())
    }

    /// Publish a progress update.
    pub fn progress(&self, progress: serde_json::Value) {
        self.registry.report_progress(self.id, progress);
    }
}

enum Outcome {
    Done(serde_json::Value),
    Failed(Failure),
    Cancelled,
}

impl TaskRegistry {
    /// Create a registry without heavy-work offload.
    pub fn new(bus: EventBus, store: Arc<dyn SnapshotStore>, clock: Arc<dyn Clock>) -> Self {
        Self::build(bus, store, clock, None)
    }

    /// Create a registry that routes heavy task types to `bridge`.
    pub fn with_worker_bridge(
        bus: EventBus,
        store: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
        bridge: Arc<WorkerBridge>,
    ) -> Self {
        Self::build(bus, store, clock, Some(bridge))
    }

    fn build(
        bus: EventBus,
        store: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
        bridge: Option<Arc<WorkerBridge>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(TaskTable::default()),
                bus,
                store,
                clock,
                bridge,
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, TaskTable> {
        self.inner.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Register a new task. `task:created` is emitted before this returns,
    /// so observers always learn about a task before any of its work runs.
    pub fn create_task(
        &self,
        task_type: impl Into<String>,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Task {
        self.insert_task(task_type.into(), metadata, CancellationToken::new())
    }

    /// Like [`create_task`](Self::create_task), but the task's cancellation
    /// handle is a child of `parent`: cancelling the parent cancels the task.
    pub fn create_child_task(
        &self,
        task_type: impl Into<String>,
        metadata: serde_json::Map<String, serde_json::Value>,
        parent: &CancellationToken,
    ) -> Task {
        self.insert_task(task_type.into(), metadata, parent.child_token())
    }

    fn insert_task(
        &self,
        task_type: String,
        metadata: serde_json::Map<String, serde_json::Value>,
        cancel: CancellationToken,
    ) -> Task {
        let task = Task::new(task_type, metadata, self.now());
        {
            let mut table = self.table();
            table.order.push(task.id);
            table.entries.insert(
                task.id,
                TaskEntry {
                    task: task.clone(),
                    cancel,
                },
            );
        }
        self.persist_logged();
        debug!(task_id = %task.id, task_type = %task.task_type, "Task created");
        self.inner.bus.emit(Event::TaskCreated { task: task.clone() });
        task
    }

    /// Run a CREATED task to completion.
    ///
    /// Heavy task types go to the worker bridge (payload is
    /// `metadata["payload"]`, or the whole metadata when absent) and fail
    /// without running `work` when no bridge is attached; everything else
    /// runs `work` inline. Returns the settled task. Only lifecycle
    /// misuse (unknown id, task not CREATED) is reported as an error.
    pub async fn execute_task<F>(&self, id: TaskId, work: F) -> Result<Task, TaskError>
    where
        F: FnOnce(TaskContext) -> TaskFuture + Send + 'static,
    {
        let (task, cancel) = {
            let mut table = self.table();
            let now = self.now();
            let entry = table.get_mut(id)?;
            if entry.task.status != TaskStatus::Created {
                return Err(TaskError::InvalidState {
                    id,
                    state: entry.task.status,
                    operation: "execute",
                });
            }
            entry.task.apply_status(TaskStatus::Running, now);
            (entry.task.clone(), entry.cancel.clone())
        };
        self.persist_logged();
        info!(task_id = %id, task_type = %task.task_type, "Task started");
        self.inner.bus.emit(Event::TaskUpdated { task: task.clone() });

        let heavy = should_use_worker(&task.task_type);
        let future: TaskFuture = match &self.inner.bridge {
            Some(bridge) if heavy => {
                let bridge = Arc::clone(bridge);
                let payload = task
                    .metadata
                    .get("payload")
                    .cloned()
                    .unwrap_or_else(|| serde_json::Value::Object(task.metadata.clone()));
                let task_type = task.task_type.clone();
                let token = cancel.clone();
                debug!(task_id = %id, "Routing heavy task to worker pool");
                async move {
                    bridge
                        .execute_in_worker(id, &task_type, payload, token)
                        .await
                        .map_err(anyhow::Error::from)
                }
                .boxed()
            }
            None if heavy => {
                let err = WorkerError::Unavailable { task_id: id };
                warn!(task_id = %id, task_type = %task.task_type, "No worker pool for heavy task");
                self.inner.bus.emit(Event::WorkerError {
                    task_id: id,
                    error: err.to_string(),
                });
                async move { Err(err.into()) }.boxed()
            }
            _ => work(TaskContext {
                id,
                cancel: cancel.clone(),
                registry: self.clone(),
            }),
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Cancelled,
            settled = AssertUnwindSafe(future).catch_unwind() => match settled {
                Ok(Ok(value)) => Outcome::Done(value),
                Ok(Err(_)) if cancel.is_cancelled() => Outcome::Cancelled,
                Ok(Err(err)) => Outcome::Failed(Failure::from_anyhow(&err)),
                Err(_) => Outcome::Failed(Failure::execution("task work panicked")),
            },
        };

        Ok(self.settle(id, outcome))
    }

    fn settle(&self, id: TaskId, outcome: Outcome) -> Task {
        match outcome {
            Outcome::Cancelled => match self.cancel_task(id, "cancelled") {
                Ok(task) => task,
                Err(_) => self.get_task(id).unwrap_or_else(|| unreachable_task(id)),
            },
            Outcome::Done(value) => self.finish(id, TaskStatus::Done, |task, _| {
                task.result = Some(value);
            }),
            Outcome::Failed(failure) => {
                warn!(task_id = %id, error = %failure, "Task failed");
                self.finish(id, TaskStatus::Failed, |task, now| {
                    task.logs.push(LogEntry::at(now, format!("error: {}", failure.message)));
                    task.error = Some(failure);
                })
            }
        }
    }

    /// Move a running task to a terminal state. A task that already settled
    /// (cancelled or frozen meanwhile) is returned untouched.
    fn finish<F>(&self, id: TaskId, status: TaskStatus, mutate: F) -> Task
    where
        F: FnOnce(&mut Task, DateTime<Utc>),
    {
        let task = {
            let mut table = self.table();
            let now = self.now();
            let Ok(entry) = table.get_mut(id) else {
                return unreachable_task(id);
            };
            if !entry.task.status.can_transition_to(status) {
                debug!(task_id = %id, status = %entry.task.status, "Task already settled");
                return entry.task.clone();
            }
            mutate(&mut entry.task, now);
            entry.task.apply_status(status, now);
            entry.task.clone()
        };
        self.persist_logged();
        info!(task_id = %id, status = %task.status, "Task finished");
        self.inner.bus.emit(Event::TaskCompleted { task: task.clone() });
        task
    }

    /// Cancel a task. Idempotent: cancelling a settled task returns it as is.
    ///
    /// The state flips to CANCELED immediately and `task:cancelled` is
    /// emitted before this returns, whether or not the work has noticed.
    pub fn cancel_task(&self, id: TaskId, reason: impl Into<String>) -> Result<Task, TaskError> {
        self.terminate(id, Failure::new(FailureKind::Cancelled, reason), TaskStatus::Canceled)
    }

    /// Force-terminate a stuck task on behalf of the watchdog.
    pub(crate) fn freeze_task(&self, id: TaskId, reason: impl Into<String>) -> Result<Task, TaskError> {
        self.terminate(id, Failure::new(FailureKind::Frozen, reason), TaskStatus::Canceled)
    }

    fn terminate(&self, id: TaskId, failure: Failure, status: TaskStatus) -> Result<Task, TaskError> {
        let task = {
            let mut table = self.table();
            let now = self.now();
            let entry = table.get_mut(id)?;
            if entry.task.status.is_terminal() {
                return Ok(entry.task.clone());
            }
            entry.cancel.cancel();
            entry
                .task
                .logs
                .push(LogEntry::at(now, format!("cancelled: {}", failure.message)));
            entry.task.error = Some(failure);
            entry.task.apply_status(status, now);
            entry.task.clone()
        };
        self.persist_logged();
        let reason = task
            .error
            .as_ref()
            .map(|f| f.message.clone())
            .unwrap_or_default();
        info!(task_id = %id, reason = %reason, "Task cancelled");
        self.inner.bus.emit(Event::TaskCancelled {
            task: task.clone(),
            reason,
        });
        Ok(task)
    }

    /// Append an output chunk. The first chunk moves RUNNING to PARTIAL.
    pub fn stream_output(&self, id: TaskId, chunk: impl Into<String>) -> Result<(), TaskError> {
        let chunk = chunk.into();
        let transitioned = {
            let mut table = self.table();
            let now = self.now();
            let entry = table.get_mut(id)?;
            if entry.task.status.is_terminal() {
                return Err(TaskError::InvalidState {
                    id,
                    state: entry.task.status,
                    operation: "stream output",
                });
            }
            entry.task.output.push(chunk.clone());
            if entry.task.status == TaskStatus::Running {
                entry.task.apply_status(TaskStatus::Partial, now);
                Some(entry.task.clone())
            } else {
                None
            }
        };
        if let Some(task) = transitioned {
            self.persist_logged();
            self.inner.bus.emit(Event::TaskUpdated { task });
        }
        self.inner.bus.emit(Event::TaskOutput { task_id: id, chunk });
        Ok(())
    }

    /// Append a log line.
    pub fn log_task(&self, id: TaskId, message: impl Into<String>) -> Result<(), TaskError> {
        let entry = {
            let mut table = self.table();
            let now = self.now();
            let entry = table.get_mut(id)?;
            if entry.task.status.is_terminal() {
                return Err(TaskError::InvalidState {
                    id,
                    state: entry.task.status,
                    operation: "log",
                });
            }
            let line = LogEntry::at(now, message);
            entry.task.logs.push(line.clone());
            line
        };
        self.inner.bus.emit(Event::TaskLog { task_id: id, entry });
        Ok(())
    }

    /// PARTIAL back to RUNNING.
    pub fn resume_task(&self, id: TaskId) -> Result<Task, TaskError> {
        let task = {
            let mut table = self.table();
            let now = self.now();
            let entry = table.get_mut(id)?;
            if entry.task.status != TaskStatus::Partial {
                return Err(TaskError::InvalidState {
                    id,
                    state: entry.task.status,
                    operation: "resume",
                });
            }
            entry.task.apply_status(TaskStatus::Running, now);
            entry.task.clone()
        };
        self.persist_logged();
        self.inner.bus.emit(Event::TaskUpdated { task: task.clone() });
        Ok(task)
    }

    /// Relay a progress update for a task.
    pub fn report_progress(&self, id: TaskId, progress: serde_json::Value) {
        self.inner.bus.emit(Event::TaskProgress {
            task_id: id,
            progress,
        });
    }

    pub fn get_task(&self, id: TaskId) -> Option<Task> {
        self.table().entries.get(&id).map(|e| e.task.clone())
    }

    /// All tasks in creation order.
    pub fn list_tasks(&self) -> Vec<Task> {
        let table = self.table();
        table
            .order
            .iter()
            .filter_map(|id| table.entries.get(id))
            .map(|e| e.task.clone())
            .collect()
    }

    /// Tasks whose work is in flight.
    pub fn running_tasks(&self) -> Vec<Task> {
        self.list_tasks()
            .into_iter()
            .filter(|t| t.status.is_running())
            .collect()
    }

    /// Insert tasks restored from a previous process. Ids already present are
    /// skipped. Returns how many were added.
    pub(crate) fn import(&self, tasks: Vec<Task>) -> usize {
        let mut added = 0;
        {
            let mut table = self.table();
            for task in tasks {
                if table.entries.contains_key(&task.id) {
                    continue;
                }
                let cancel = CancellationToken::new();
                if task.status.is_terminal() {
                    cancel.cancel();
                }
                table.order.push(task.id);
                table.entries.insert(task.id, TaskEntry { task, cancel });
                added += 1;
            }
        }
        if added > 0 {
            self.persist_logged();
        }
        added
    }

    /// Write a full snapshot of every task.
    pub fn persist(&self) -> Result<(), SnapshotError> {
        let snapshot = self.table().snapshot(self.now());
        let blob = serde_json::to_string(&snapshot)?;
        self.inner.store.save(TASK_SNAPSHOT_KEY, &blob)
    }

    fn persist_logged(&self) {
        if let Err(e) = self.persist() {
            warn!(error = %e, "Failed to persist task snapshot");
        }
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.table().entries.len())
            .field("offload", &self.inner.bridge.is_some())
            .finish()
    }
}

/// Tasks are never removed, so a settled id is always present.
fn unreachable_task(id: TaskId) -> Task {
    warn!(task_id = %id, "Settled task vanished from the registry");
    Task::new("unknown", Default::default(), Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::events::Topic;
    use crate::store::MemorySnapshotStore;

    fn registry() -> (TaskRegistry, EventBus, Arc<MemorySnapshotStore>) {
        let bus = EventBus::new();
        let store = Arc::new(MemorySnapshotStore::new());
        let registry = TaskRegistry::new(bus.clone(), store.clone(), Arc::new(SystemClock));
        (registry, bus, store)
    }

    fn record_topics(bus: &EventBus) -> Arc<Mutex<Vec<Topic>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.on_any(move |e| {
            sink.lock().unwrap().push(e.topic());
            Ok(())
        });
        seen
    }

    #[test]
    fn create_emits_before_returning() {
        let (registry, bus, _) = registry();
        let created = Arc::new(Mutex::new(None));
        {
            let created = Arc::clone(&created);
            bus.on(Topic::TaskCreated, move |e| {
                if let Event::TaskCreated { task } = e {
                    assert!(task.output.is_empty() && task.logs.is_empty());
                    *created.lock().unwrap() = Some(task.id);
                }
                Ok(())
            });
        }
        let task = registry.create_task("summarize", Default::default());
        assert_eq!(*created.lock().unwrap(), Some(task.id));
    }

    #[tokio::test]
    async fn execute_runs_inline_work_to_done() {
        let (registry, bus, store) = registry();
        let topics = record_topics(&bus);
        let task = registry.create_task("summarize", Default::default());

        let done = registry
            .execute_task(task.id, |ctx| {
                async move {
                    ctx.stream("hello ")?;
                    ctx.stream("world")?;
                    ctx.log("wrote greeting")?;
                    Ok(serde_json::json!({"ok": true}))
                }
                .boxed()
            })
            .await
            .unwrap();

        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.output, vec!["hello ", "world"]);
        assert_eq!(done.logs.len(), 1);
        assert_eq!(done.result, Some(serde_json::json!({"ok": true})));
        assert!(done.started_at.is_some() && done.ended_at.is_some());
        assert!(store.write_count() >= 4, "created, running, partial, done");

        let topics = topics.lock().unwrap();
        assert_eq!(topics.first(), Some(&Topic::TaskCreated));
        assert_eq!(topics.last(), Some(&Topic::TaskCompleted));
        assert!(topics.contains(&Topic::TaskOutput));
    }

    #[tokio::test]
    async fn created_event_precedes_any_work() {
        let (registry, bus, _) = registry();
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let order = Arc::clone(&order);
            bus.on(Topic::TaskCreated, move |_| {
                order.lock().unwrap().push("created");
                Ok(())
            });
        }
        let task = registry.create_task("render", Default::default());
        let order_in_work = Arc::clone(&order);
        registry
            .execute_task(task.id, move |_| {
                async move {
                    order_in_work.lock().unwrap().push("work");
                    Ok(serde_json::Value::Null)
                }
                .boxed()
            })
            .await
            .unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["created", "work"]);
    }

    #[tokio::test]
    async fn work_error_fails_task_with_log() {
        let (registry, _, _) = registry();
        let task = registry.create_task("render", Default::default());
        let failed = registry
            .execute_task(task.id, |_| async { anyhow::bail!("disk on fire") }.boxed())
            .await
            .unwrap();

        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_ref().unwrap().kind, FailureKind::Execution);
        assert!(failed.logs.last().unwrap().message.contains("disk on fire"));
    }

    #[tokio::test]
    async fn panicking_work_fails_task() {
        let (registry, _, _) = registry();
        let task = registry.create_task("render", Default::default());
        let failed = registry
            .execute_task(task.id, |_| async { panic!("oops") }.boxed())
            .await
            .unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn re_executing_is_invalid_state() {
        let (registry, _, _) = registry();
        let task = registry.create_task("render", Default::default());
        registry
            .execute_task(task.id, |_| async { Ok(serde_json::Value::Null) }.boxed())
            .await
            .unwrap();

        let err = registry
            .execute_task(task.id, |_| async { Ok(serde_json::Value::Null) }.boxed())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidState { state: TaskStatus::Done, .. }));
    }

    #[tokio::test]
    async fn cancel_flips_state_without_cooperation() {
        let (registry, bus, _) = registry();
        let topics = record_topics(&bus);
        let id = registry.create_task("render", Default::default()).id;

        let handle = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .execute_task(id, |_| {
                        // Never looks at its cancellation handle.
                        async {
                            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                            Ok(serde_json::Value::Null)
                        }
                        .boxed()
                    })
                    .await
            })
        };

        while registry.get_task(id).unwrap().status != TaskStatus::Running {
            tokio::task::yield_now().await;
        }

        let cancelled = registry.cancel_task(id, "user pressed stop").unwrap();
        assert_eq!(cancelled.status, TaskStatus::Canceled);
        assert!(topics.lock().unwrap().contains(&Topic::TaskCancelled));

        // Idempotent.
        let again = registry.cancel_task(id, "again").unwrap();
        assert_eq!(again.status, TaskStatus::Canceled);

        let settled = handle.await.unwrap().unwrap();
        assert_eq!(settled.status, TaskStatus::Canceled);
        assert_eq!(settled.error.unwrap().kind, FailureKind::Cancelled);
    }

    #[tokio::test]
    async fn work_observing_cancellation_ends_cancelled() {
        let (registry, _, _) = registry();
        let parent = CancellationToken::new();
        let task = registry.create_child_task("render", Default::default(), &parent);
        parent.cancel();

        let settled = registry
            .execute_task(task.id, |ctx| {
                async move {
                    ctx.cancel_token().cancelled().await;
                    anyhow::bail!("stopped")
                }
                .boxed()
            })
            .await
            .unwrap();
        assert_eq!(settled.status, TaskStatus::Canceled);
    }

    #[test]
    fn cancel_before_start_is_allowed() {
        let (registry, _, _) = registry();
        let task = registry.create_task("render", Default::default());
        let cancelled = registry.cancel_task(task.id, "never mind").unwrap();
        assert_eq!(cancelled.status, TaskStatus::Canceled);
        assert!(cancelled.started_at.is_none());
    }

    #[test]
    fn output_and_logs_rejected_after_terminal() {
        let (registry, _, _) = registry();
        let task = registry.create_task("render", Default::default());
        registry.cancel_task(task.id, "stop").unwrap();

        assert!(matches!(
            registry.stream_output(task.id, "late"),
            Err(TaskError::InvalidState { .. })
        ));
        assert!(matches!(
            registry.log_task(task.id, "late"),
            Err(TaskError::InvalidState { .. })
        ));
    }

    #[test]
    fn unknown_task_is_not_found() {
        let (registry, _, _) = registry();
        let id = TaskId::new();
        assert!(matches!(registry.cancel_task(id, "x"), Err(TaskError::NotFound { .. })));
    }

    #[tokio::test]
    async fn heavy_task_without_bridge_fails_fast() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let (registry, bus, _) = registry();
        let topics = record_topics(&bus);
        let ran = Arc::new(AtomicBool::new(false));
        let task = registry.create_task("analyze", Default::default());

        let flag = Arc::clone(&ran);
        let settled = registry
            .execute_task(task.id, move |_| {
                flag.store(true, Ordering::SeqCst);
                async { Ok(serde_json::Value::Null) }.boxed()
            })
            .await
            .unwrap();

        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(settled.status, TaskStatus::Failed);
        let error = settled.error.unwrap();
        assert_eq!(error.kind, FailureKind::Execution);
        assert!(error.message.contains("No worker available"));
        assert!(topics.lock().unwrap().contains(&Topic::WorkerError));
    }

    #[test]
    fn persist_writes_all_tasks() {
        let (registry, _, store) = registry();
        registry.create_task("a", Default::default());
        registry.create_task("b", Default::default());
        registry.persist().unwrap();

        let blob = store.load(TASK_SNAPSHOT_KEY).unwrap().unwrap();
        let snapshot: TaskSnapshot = serde_json::from_str(&blob).unwrap();
        let types: Vec<_> = snapshot.tasks.iter().map(|t| t.task_type.as_str()).collect();
        assert_eq!(types, vec!["a", "b"]);
    }
}
