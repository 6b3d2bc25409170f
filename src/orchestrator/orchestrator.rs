//! Job orchestration above the agent runtime.
//!
//! Jobs wait in a priority queue and start while fewer than
//! `max_concurrent_jobs` are running. Each start takes a slot from the target
//! agent's rate window; a job that finds the window full is demoted by one
//! priority step and put back, and a wakeup is scheduled for when the window
//! reopens. Retryable failures go back to the queue until `max_retries` is
//! used up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Failure, FailureKind, OrchestratorError, RuntimeError};
use crate::events::{Event, EventBus};
use crate::orchestrator::job::{Job, JobRequest, JobStatus};
use crate::orchestrator::queue::JobQueue;
use crate::orchestrator::rate_limit::{RateLimitConfig, RateLimiter};
use crate::runtime::{AgentRequest, AgentRunResult, AgentRuntime, ScratchContext};

/// Rate-limit key for jobs whose agent cannot be resolved up front.
const UNRESOLVED_AGENT_KEY: &str = "<unresolved>";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_concurrent_jobs: usize,
    /// Default retry budget per job.
    pub max_retries: u32,
    pub rate_limit: RateLimitConfig,
    /// Default wall-clock budget per attempt. `None` disables it.
    pub job_timeout: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            max_retries: 2,
            rate_limit: RateLimitConfig::default(),
            job_timeout: Some(Duration::from_secs(300)),
        }
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

struct JobEntry {
    job: Job,
    cancel: CancellationToken,
    timeout: Option<Duration>,
}

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, JobEntry>,
    order: Vec<Uuid>,
    queue: JobQueue,
    running: usize,
    next_seq: u64,
    wakeup_scheduled: bool,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn requeue(&mut self, id: Uuid) {
        let seq = self.next_seq();
        if let Some(entry) = self.jobs.get_mut(&id) {
            entry.job.seq = seq;
            self.queue.push(id, entry.job.priority);
        }
    }
}

struct Inner {
    state: Mutex<State>,
    limiter: Mutex<RateLimiter>,
    runtime: AgentRuntime,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    settled: Notify,
}

/// Queue, concurrency cap, rate limiting and retries. Cheap to clone.
///
/// Must be used from within a Tokio runtime: jobs run on spawned tasks.
#[derive(Clone)]
pub struct AgentOrchestrator {
    inner: Arc<Inner>,
}

struct Launch {
    id: Uuid,
    request: AgentRequest,
    timeout: Option<Duration>,
    attempt: CancellationToken,
}

impl AgentOrchestrator {
    pub fn new(runtime: AgentRuntime, bus: EventBus, clock: Arc<dyn Clock>, config: OrchestratorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                limiter: Mutex::new(RateLimiter::new(config.rate_limit.clone())),
                runtime,
                bus,
                clock,
                config,
                settled: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Queue a job and try to start work.
    pub fn enqueue(&self, request: JobRequest) -> Job {
        let now = self.inner.clock.now();
        let job = {
            let mut state = self.state();
            let job = Job {
                id: Uuid::new_v4(),
                agent_id: request.agent_id,
                prompt: request.prompt,
                context: request.context,
                priority: request.priority,
                status: JobStatus::Pending,
                retry_count: 0,
                max_retries: request.max_retries.unwrap_or(self.inner.config.max_retries),
                seq: state.next_seq(),
                task_id: None,
                created_at: now,
                started_at: None,
                ended_at: None,
                result: None,
                error: None,
            };
            state.order.push(job.id);
            state.queue.push(job.id, job.priority);
            state.jobs.insert(
                job.id,
                JobEntry {
                    job: job.clone(),
                    cancel: CancellationToken::new(),
                    timeout: request.timeout.or(self.inner.config.job_timeout),
                },
            );
            job
        };
        info!(job_id = %job.id, priority = job.priority, agent = ?job.agent_id, "Job enqueued");
        self.inner.bus.emit(Event::JobEnqueued { job: job.clone() });
        self.process_queue();
        self.get_job(job.id).unwrap_or(job)
    }

    /// Start queued jobs while below the concurrency cap. Each queued job is
    /// looked at once per call.
    pub fn process_queue(&self) {
        let now = self.inner.clock.now();
        let mut started = Vec::new();
        let mut launches = Vec::new();
        let mut earliest_reopen: Option<Duration> = None;
        {
            let mut state = self.state();
            let mut deferred = Vec::new();
            let mut budget = state.queue.len();

            while budget > 0 && state.running < self.inner.config.max_concurrent_jobs {
                budget -= 1;
                let Some(id) = state.queue.pop() else {
                    break;
                };
                let Some(entry) = state.jobs.get(&id) else {
                    continue;
                };
                if entry.job.status != JobStatus::Pending {
                    continue;
                }

                let key = self.rate_key(&entry.job);
                let acquired = self
                    .inner
                    .limiter
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .try_acquire(&key, now);
                if let Err(retry_after) = acquired {
                    deferred.push(id);
                    earliest_reopen = Some(earliest_reopen.map_or(retry_after, |d| d.min(retry_after)));
                    continue;
                }

                let Some(entry) = state.jobs.get_mut(&id) else {
                    continue;
                };
                entry.job.status = JobStatus::Running;
                entry.job.started_at = Some(now);
                let attempt = entry.cancel.child_token();
                let job = &entry.job;
                let mut request = AgentRequest::new(job.prompt.clone())
                    .context(job.context.clone())
                    .scratch(ScratchContext::new())
                    .cancel(attempt.clone());
                request.agent_id = job.agent_id.clone();
                launches.push(Launch {
                    id,
                    request,
                    timeout: entry.timeout,
                    attempt,
                });
                started.push(job.clone());
                state.running += 1;
            }

            for id in deferred {
                if let Some(entry) = state.jobs.get_mut(&id) {
                    entry.job.priority = entry.job.priority.saturating_sub(1);
                    debug!(job_id = %id, priority = entry.job.priority, "Rate limited, job demoted");
                }
                state.requeue(id);
            }

            if earliest_reopen.is_some() && state.wakeup_scheduled {
                earliest_reopen = None;
            } else if earliest_reopen.is_some() {
                state.wakeup_scheduled = true;
            }
        }

        for job in started {
            info!(job_id = %job.id, attempt = job.retry_count + 1, "Job started");
            self.inner.bus.emit(Event::JobStarted { job });
        }
        for launch in launches {
            tokio::spawn(self.clone().run_attempt(launch));
        }
        if let Some(delay) = earliest_reopen {
            let this = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                this.state().wakeup_scheduled = false;
                this.process_queue();
            });
        }
    }

    fn rate_key(&self, job: &Job) -> String {
        self.inner
            .runtime
            .select_agent(job.agent_id.as_deref(), &job.prompt)
            .map(|a| a.id)
            .unwrap_or_else(|_| UNRESOLVED_AGENT_KEY.to_string())
    }

    async fn run_attempt(self, launch: Launch) {
        let Launch {
            id,
            request,
            timeout,
            attempt,
        } = launch;

        let run = self.inner.runtime.run(request);
        tokio::pin!(run);
        let mut timed_out = None;
        let outcome = match timeout {
            Some(limit) => tokio::select! {
                outcome = &mut run => outcome,
                _ = tokio::time::sleep(limit) => {
                    warn!(job_id = %id, timeout = ?limit, "Job attempt timed out, cancelling");
                    timed_out = Some(limit);
                    attempt.cancel();
                    run.await
                }
            },
            None => run.await,
        };
        self.settle(id, outcome, timed_out);
    }

    fn settle(&self, id: Uuid, outcome: Result<AgentRunResult, RuntimeError>, timed_out: Option<Duration>) {
        let now = self.inner.clock.now();
        let mut events = Vec::new();
        {
            let mut state = self.state();
            state.running = state.running.saturating_sub(1);
            let mut retry = false;

            if let Some(entry) = state.jobs.get_mut(&id) {
                let job = &mut entry.job;
                if let Ok(run) = &outcome {
                    job.task_id = Some(run.task_id);
                }

                if job.status == JobStatus::Cancelled {
                    debug!(job_id = %id, "Cancelled job finished its attempt");
                } else {
                    let failure = match outcome {
                        Ok(run) if run.success => {
                            job.status = JobStatus::Completed;
                            job.ended_at = Some(now);
                            job.result = run.output;
                            job.error = None;
                            info!(job_id = %id, "Job completed");
                            events.push(Event::JobCompleted { job: job.clone() });
                            None
                        }
                        Ok(run) => Some(
                            run.error
                                .unwrap_or_else(|| Failure::execution("agent run failed without an error")),
                        ),
                        Err(e) => Some(Failure::new(FailureKind::InvalidState, e.to_string())),
                    };

                    if let Some(mut failure) = failure {
                        if let Some(limit) = timed_out {
                            failure = Failure::timeout(format!("job attempt exceeded {limit:?}"));
                        }
                        if failure.kind.is_retryable() && job.retry_count < job.max_retries {
                            job.retry_count += 1;
                            job.status = JobStatus::Pending;
                            job.started_at = None;
                            job.ended_at = None;
                            info!(job_id = %id, retry = job.retry_count, max = job.max_retries, error = %failure, "Job failed, retrying");
                            job.error = Some(failure);
                            retry = true;
                        } else {
                            job.status = JobStatus::Failed;
                            job.ended_at = Some(now);
                            warn!(job_id = %id, retries = job.retry_count, error = %failure, "Job failed");
                            job.error = Some(failure);
                            events.push(Event::JobFailed { job: job.clone() });
                        }
                    }
                }
            }

            if retry {
                state.requeue(id);
                if let Some(entry) = state.jobs.get(&id) {
                    events.push(Event::JobEnqueued { job: entry.job.clone() });
                }
            }
        }

        for event in events {
            self.inner.bus.emit(event);
        }
        self.inner.settled.notify_waiters();
        self.process_queue();
    }

    /// Cancel a pending or running job. A running job's task is cancelled
    /// and its slot is freed once the attempt winds down.
    pub fn cancel_job(&self, id: Uuid) -> Result<Job, OrchestratorError> {
        let now = self.inner.clock.now();
        let job = {
            let mut state = self.state();
            let entry = state.jobs.get_mut(&id).ok_or(OrchestratorError::NotFound { id })?;
            if entry.job.status.is_terminal() {
                return Err(OrchestratorError::InvalidState {
                    id,
                    state: entry.job.status.to_string(),
                    operation: "cancel",
                });
            }
            let was_pending = entry.job.status == JobStatus::Pending;
            entry.cancel.cancel();
            entry.job.status = JobStatus::Cancelled;
            entry.job.ended_at = Some(now);
            entry.job.error = Some(Failure::new(FailureKind::Cancelled, "job cancelled"));
            let job = entry.job.clone();
            if was_pending {
                state.queue.remove(id);
            }
            job
        };
        info!(job_id = %id, "Job cancelled");
        self.inner.bus.emit(Event::JobCancelled { job: job.clone() });
        self.inner.settled.notify_waiters();
        Ok(job)
    }

    /// Wait until a job reaches a terminal status.
    pub async fn wait_for(&self, id: Uuid) -> Result<Job, OrchestratorError> {
        loop {
            let settled = self.inner.settled.notified();
            let job = self.get_job(id).ok_or(OrchestratorError::NotFound { id })?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            settled.await;
        }
    }

    pub fn get_job(&self, id: Uuid) -> Option<Job> {
        self.state().jobs.get(&id).map(|e| e.job.clone())
    }

    /// Every job, in enqueue order.
    pub fn jobs(&self) -> Vec<Job> {
        let state = self.state();
        state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .map(|e| e.job.clone())
            .collect()
    }

    /// Pending jobs in the order they would start.
    pub fn pending_jobs(&self) -> Vec<Job> {
        let state = self.state();
        state
            .queue
            .ids()
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .map(|e| e.job.clone())
            .collect()
    }

    pub fn running_jobs(&self) -> Vec<Job> {
        self.jobs()
            .into_iter()
            .filter(|j| j.status == JobStatus::Running)
            .collect()
    }

    pub fn stats(&self) -> OrchestratorStats {
        let state = self.state();
        let mut stats = OrchestratorStats::default();
        for entry in state.jobs.values() {
            match entry.job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }
}

impl std::fmt::Debug for AgentOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentOrchestrator")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::enforcement::{ExecutionGuard, GuardMode};
    use crate::events::Topic;
    use crate::runtime::{AgentConfig, InMemoryMemoryStore, RuntimeConfig, entry_fn};
    use crate::store::MemorySnapshotStore;
    use crate::task::TaskRegistry;

    struct Harness {
        orchestrator: AgentOrchestrator,
        runtime: AgentRuntime,
        bus: EventBus,
        clock: Arc<ManualClock>,
    }

    fn harness(config: OrchestratorConfig) -> Harness {
        let bus = EventBus::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let tasks = TaskRegistry::new(bus.clone(), Arc::new(MemorySnapshotStore::new()), clock.clone());
        let guard = ExecutionGuard::new(tasks.clone(), GuardMode::Strict);
        let runtime = AgentRuntime::new(
            tasks,
            Arc::new(InMemoryMemoryStore::new()),
            guard,
            RuntimeConfig::default(),
        );
        let orchestrator = AgentOrchestrator::new(runtime.clone(), bus.clone(), clock.clone(), config);
        Harness {
            orchestrator,
            runtime,
            bus,
            clock,
        }
    }

    /// Agent that blocks until `gate` is cancelled.
    fn gated(id: &str, gate: CancellationToken) -> AgentConfig {
        AgentConfig::new(
            id,
            entry_fn(move |input, _| {
                let gate = gate.clone();
                async move {
                    gate.cancelled().await;
                    Ok(serde_json::json!(input.prompt))
                }
            }),
        )
    }

    #[tokio::test]
    async fn cap_limits_running_jobs_and_queue_is_ordered() {
        let h = harness(OrchestratorConfig::default());
        let gate = CancellationToken::new();
        h.runtime.register_agent(gated("worker", gate.clone())).unwrap();

        let mut ids = Vec::new();
        for (prompt, priority) in [("a", 1), ("b", 1), ("c", 1), ("d", 0), ("e", 5)] {
            ids.push(h.orchestrator.enqueue(JobRequest::new(prompt).agent("worker").priority(priority)).id);
        }

        assert_eq!(h.orchestrator.running_jobs().len(), 3);
        let pending: Vec<_> = h.orchestrator.pending_jobs().into_iter().map(|j| j.prompt).collect();
        assert_eq!(pending, vec!["e", "d"]);

        gate.cancel();
        for id in ids {
            let job = h.orchestrator.wait_for(id).await.unwrap();
            assert_eq!(job.status, JobStatus::Completed);
            assert_eq!(job.result, Some(serde_json::json!(job.prompt)));
        }
        assert_eq!(h.orchestrator.stats().completed, 5);
    }

    #[tokio::test]
    async fn retryable_failures_retry_then_fail_once() {
        let h = harness(OrchestratorConfig::default());
        let attempts = Arc::new(AtomicUsize::new(0));
        {
            let attempts = attempts.clone();
            h.runtime
                .register_agent(AgentConfig::new(
                    "flaky",
                    entry_fn(move |_, _| {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        async { anyhow::bail!("upstream unavailable") }
                    }),
                ))
                .unwrap();
        }

        let enqueued = Arc::new(Mutex::new(Vec::new()));
        let failed = Arc::new(AtomicUsize::new(0));
        {
            let enqueued = enqueued.clone();
            h.bus.on(Topic::JobEnqueued, move |e| {
                if let Event::JobEnqueued { job } = e {
                    enqueued.lock().unwrap().push(job.retry_count);
                }
                Ok(())
            });
            let failed = failed.clone();
            h.bus.on(Topic::JobFailed, move |_| {
                failed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let job = h.orchestrator.enqueue(JobRequest::new("x").agent("flaky").max_retries(2));
        let done = h.orchestrator.wait_for(job.id).await.unwrap();

        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.retry_count, 2);
        assert_eq!(done.error.unwrap().kind, FailureKind::Execution);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(*enqueued.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_retryable_failures_fail_immediately() {
        let h = harness(OrchestratorConfig::default());
        h.runtime
            .register_agent(AgentConfig::new(
                "strict",
                entry_fn(|_, _| async { Err(Failure::consent_denied("user declined").into()) }),
            ))
            .unwrap();
        let job = h.orchestrator.enqueue(JobRequest::new("x").agent("strict"));
        let done = h.orchestrator.wait_for(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.retry_count, 0);

        let unknown = h.orchestrator.enqueue(JobRequest::new("x").agent("ghost"));
        let done = h.orchestrator.wait_for(unknown.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.error.unwrap().kind, FailureKind::InvalidState);
    }

    #[tokio::test]
    async fn rate_limited_jobs_are_demoted_not_rejected() {
        let h = harness(OrchestratorConfig {
            rate_limit: RateLimitConfig {
                max_requests: 1,
                window: Duration::from_secs(60),
                ..Default::default()
            },
            ..Default::default()
        });
        h.runtime
            .register_agent(AgentConfig::new("echo", entry_fn(|_, _| async { Ok(serde_json::Value::Null) })))
            .unwrap();

        let first = h.orchestrator.enqueue(JobRequest::new("1").agent("echo").priority(3));
        let second = h.orchestrator.enqueue(JobRequest::new("2").agent("echo").priority(3));
        h.orchestrator.wait_for(first.id).await.unwrap();

        let waiting = h.orchestrator.get_job(second.id).unwrap();
        assert_eq!(waiting.status, JobStatus::Pending);
        assert!(waiting.priority < 3);

        h.clock.advance(Duration::from_secs(61));
        h.orchestrator.process_queue();
        let done = h.orchestrator.wait_for(second.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_pending_and_running_jobs() {
        let h = harness(OrchestratorConfig {
            max_concurrent_jobs: 1,
            ..Default::default()
        });
        let gate = CancellationToken::new();
        h.runtime.register_agent(gated("worker", gate.clone())).unwrap();

        let running = h.orchestrator.enqueue(JobRequest::new("a").agent("worker"));
        let pending = h.orchestrator.enqueue(JobRequest::new("b").agent("worker"));
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(pending.status, JobStatus::Pending);

        let cancelled = h.orchestrator.cancel_job(pending.id).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(h.orchestrator.pending_jobs().is_empty());
        assert!(matches!(
            h.orchestrator.cancel_job(pending.id),
            Err(OrchestratorError::InvalidState { .. })
        ));

        h.orchestrator.cancel_job(running.id).unwrap();
        let job = h.orchestrator.wait_for(running.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        assert!(matches!(
            h.orchestrator.cancel_job(Uuid::new_v4()),
            Err(OrchestratorError::NotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_is_a_retryable_timeout() {
        let h = harness(OrchestratorConfig {
            job_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        h.runtime.register_agent(gated("stuck", CancellationToken::new())).unwrap();

        let job = h.orchestrator.enqueue(JobRequest::new("x").agent("stuck").max_retries(1));
        let done = h.orchestrator.wait_for(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.retry_count, 1);
        assert_eq!(done.error.unwrap().kind, FailureKind::Timeout);
    }
}
