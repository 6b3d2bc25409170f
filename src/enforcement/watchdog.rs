//! Watchdog: force-terminates tasks that run past a duration threshold and
//! keeps the task snapshot fresh on a timer.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::Event;
use crate::task::{TaskId, TaskRegistry};

/// Watchdog timing.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// How often running tasks are checked.
    pub interval: Duration,
    /// Running longer than this counts as frozen.
    pub frozen_threshold: Duration,
    /// How often the full snapshot is rewritten.
    pub backup_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            frozen_threshold: Duration::from_secs(300),
            backup_interval: Duration::from_secs(30),
        }
    }
}

/// Polls the registry's running tasks. Time comes from the registry's clock.
#[derive(Debug, Clone)]
pub struct Watchdog {
    registry: TaskRegistry,
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(registry: TaskRegistry, config: WatchdogConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// One sweep: cancel every running task older than the threshold and
    /// announce it on `task:frozen`. Returns the ids that were frozen.
    pub fn check_once(&self) -> Vec<TaskId> {
        let now = self.registry.clock().now();
        let mut frozen = Vec::new();

        for task in self.registry.running_tasks() {
            let Some(running_for) = task.elapsed(now) else {
                continue;
            };
            if running_for <= self.config.frozen_threshold {
                continue;
            }

            let reason = format!(
                "frozen: exceeded {}s (running for {}s)",
                self.config.frozen_threshold.as_secs(),
                running_for.as_secs()
            );
            match self.registry.freeze_task(task.id, reason.clone()) {
                Ok(_) => {
                    warn!(task_id = %task.id, task_type = %task.task_type, running_for = ?running_for, "Watchdog froze task");
                    self.registry.bus().emit(Event::TaskFrozen {
                        task_id: task.id,
                        running_for_ms: u64::try_from(running_for.as_millis()).unwrap_or(u64::MAX),
                        reason,
                    });
                    frozen.push(task.id);
                }
                Err(e) => debug!(task_id = %task.id, error = %e, "Task settled before watchdog could freeze it"),
            }
        }
        frozen
    }

    /// Rewrite the snapshot now.
    pub fn backup(&self) {
        if let Err(e) = self.registry.persist() {
            warn!(error = %e, "Watchdog backup failed");
        }
    }

    /// Spawn the polling loop. The first check fires after one interval.
    pub fn start(self) -> WatchdogHandle {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let watchdog = self.clone();

        let join = tokio::spawn(async move {
            info!(
                interval = ?watchdog.config.interval,
                frozen_threshold = ?watchdog.config.frozen_threshold,
                "Watchdog started"
            );
            let start = tokio::time::Instant::now();
            let mut check = tokio::time::interval_at(start + watchdog.config.interval, watchdog.config.interval);
            check.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut backup =
                tokio::time::interval_at(start + watchdog.config.backup_interval, watchdog.config.backup_interval);
            backup.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = check.tick() => {
                        let frozen = watchdog.check_once();
                        if !frozen.is_empty() {
                            info!(count = frozen.len(), "Watchdog sweep froze tasks");
                        }
                    }
                    _ = backup.tick() => watchdog.backup(),
                }
            }
            debug!("Watchdog loop exited");
        });

        WatchdogHandle {
            shutdown,
            join,
            watchdog: self,
        }
    }
}

/// Running watchdog. Dropping it without `stop` leaves the loop running.
#[derive(Debug)]
pub struct WatchdogHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
    watchdog: Watchdog,
}

impl WatchdogHandle {
    /// Stop the loop and take a final teardown backup.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.join.await {
            warn!(error = %e, "Watchdog loop ended abnormally");
        }
        self.watchdog.backup();
        info!("Watchdog stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::Utc;
    use futures::FutureExt;

    use super::*;
    use crate::clock::ManualClock;
    use crate::error::FailureKind;
    use crate::events::{EventBus, Topic};
    use crate::store::MemorySnapshotStore;
    use crate::task::TaskStatus;

    fn setup() -> (TaskRegistry, Arc<ManualClock>, Arc<MemorySnapshotStore>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemorySnapshotStore::new());
        let registry = TaskRegistry::new(EventBus::new(), store.clone(), clock.clone());
        (registry, clock, store)
    }

    fn config(threshold_secs: u64) -> WatchdogConfig {
        WatchdogConfig {
            interval: Duration::from_secs(1),
            frozen_threshold: Duration::from_secs(threshold_secs),
            backup_interval: Duration::from_secs(10),
        }
    }

    /// Start work that never finishes and never looks at its token.
    async fn start_stuck_task(registry: &TaskRegistry) -> TaskId {
        let id = registry.create_task("stuck", Default::default()).id;
        let r = registry.clone();
        tokio::spawn(async move {
            r.execute_task(id, |_ctx| futures::future::pending().boxed())
                .await
        });
        for _ in 0..100 {
            if registry.get_task(id).map(|t| t.status) == Some(TaskStatus::Running) {
                break;
            }
            tokio::task::yield_now().await;
        }
        id
    }

    #[tokio::test]
    async fn freezes_tasks_past_threshold() {
        let (registry, clock, _) = setup();
        let id = start_stuck_task(&registry).await;

        let frozen_events = Arc::new(Mutex::new(Vec::new()));
        {
            let frozen_events = frozen_events.clone();
            registry.bus().on(Topic::TaskFrozen, move |e| {
                frozen_events.lock().unwrap().push(e.clone());
                Ok(())
            });
        }

        let watchdog = Watchdog::new(registry.clone(), config(60));
        assert!(watchdog.check_once().is_empty());

        clock.advance(Duration::from_secs(61));
        assert_eq!(watchdog.check_once(), vec![id]);

        let task = registry.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        assert_eq!(task.error.as_ref().map(|f| f.kind), Some(FailureKind::Frozen));
        assert!(task.logs.iter().any(|l| l.message.contains("frozen: exceeded")));
        assert_eq!(frozen_events.lock().unwrap().len(), 1);

        // Already terminal, nothing more to do.
        clock.advance(Duration::from_secs(61));
        assert!(watchdog.check_once().is_empty());
    }

    #[tokio::test]
    async fn leaves_young_and_idle_tasks_alone() {
        let (registry, clock, _) = setup();
        let created = registry.create_task("never-started", Default::default()).id;
        let running = start_stuck_task(&registry).await;

        clock.advance(Duration::from_secs(30));
        let watchdog = Watchdog::new(registry.clone(), config(60));
        assert!(watchdog.check_once().is_empty());
        assert_eq!(registry.get_task(created).unwrap().status, TaskStatus::Created);
        assert_eq!(registry.get_task(running).unwrap().status, TaskStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_backs_up_and_stop_takes_final_backup() {
        let (registry, _, store) = setup();
        registry.create_task("idle", Default::default());
        let writes_before = store.write_count();

        let handle = Watchdog::new(registry.clone(), config(60)).start();
        assert!(handle.is_running());
        tokio::time::sleep(Duration::from_secs(25)).await;
        let periodic = store.write_count() - writes_before;
        assert_eq!(periodic, 2);

        handle.stop().await;
        assert_eq!(store.write_count() - writes_before, periodic + 1);
    }
}
