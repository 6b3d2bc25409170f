//! The agent runtime: registry, selection and one-run execution.

use std::sync::{Arc, RwLock};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::enforcement::ExecutionGuard;
use crate::error::{Failure, FailureKind, RuntimeError};
use crate::runtime::agent::{AgentConfig, AgentInput};
use crate::runtime::env::AgentEnv;
use crate::runtime::memory::{MemoryEvent, MemoryStore};
use crate::runtime::runs::{AgentRunRecord, RunHistory, RunStatus};
use crate::runtime::scratch::ScratchContext;
use crate::runtime::tool::{Tool, ToolRegistry};
use crate::task::{TaskId, TaskRegistry, TaskStatus};

/// Task type of every agent run.
pub const AGENT_TASK_TYPE: &str = "agent";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Finished runs handed to an agent as `recent_runs`.
    pub recent_runs: usize,
    /// Run records kept in memory.
    pub history_limit: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            recent_runs: 5,
            history_limit: 200,
        }
    }
}

/// A request to run one agent.
#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    /// Explicit target; otherwise chosen by keyword, then the default agent.
    pub agent_id: Option<String>,
    pub prompt: String,
    pub context: serde_json::Value,
    pub scratch: ScratchContext,
    /// Cancelling this cancels the run's task.
    pub cancel: CancellationToken,
}

impl AgentRequest {
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

    pub fn context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn scratch(mut self, scratch: ScratchContext) -> Self {
        self.scratch = scratch;
        self
    }

    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Outcome of one agent run. Entry-point failures land here, never as `Err`.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRunResult {
    pub run_id: Uuid,
    pub agent_id: String,
    pub task_id: TaskId,
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<Failure>,
    pub duration_ms: u64,
}

struct Inner {
    agents: RwLock<Vec<AgentConfig>>,
    default_agent: RwLock<Option<String>>,
    tools: ToolRegistry,
    tasks: TaskRegistry,
    memory: Arc<dyn MemoryStore>,
    history: RunHistory,
    guard: ExecutionGuard,
    config: RuntimeConfig,
}

/// Agent registry and executor of single runs. Cheap to clone.
#[derive(Clone)]
pub struct AgentRuntime {
    inner: Arc<Inner>,
}

impl AgentRuntime {
    pub fn new(
        tasks: TaskRegistry,
        memory: Arc<dyn MemoryStore>,
        guard: ExecutionGuard,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                agents: RwLock::new(Vec::new()),
                default_agent: RwLock::new(None),
                tools: ToolRegistry::new(),
                history: RunHistory::new(config.history_limit),
                tasks,
                memory,
                guard,
                config,
            }),
        }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.inner.tools
    }

    pub fn register_tool(&self, tool: Arc<dyn Tool>) -> Result<(), RuntimeError> {
        self.inner.tools.register(tool)
    }

    /// Register an agent. Its id must be new and every tool it names must
    /// already be registered.
    pub fn register_agent(&self, agent: AgentConfig) -> Result<(), RuntimeError> {
        self.inner.tools.validate(&agent)?;
        let mut agents = self.inner.agents.write().unwrap_or_else(|e| e.into_inner());
        if agents.iter().any(|a| a.id == agent.id) {
            return Err(RuntimeError::DuplicateAgent { id: agent.id });
        }
        info!(agent = %agent.id, tools = agent.allowed_tools.len(), "Registered agent");
        agents.push(agent);
        Ok(())
    }

    /// Agent used when neither an id nor a keyword picks one.
    pub fn set_default_agent(&self, id: &str) -> Result<(), RuntimeError> {
        if self.agent(id).is_none() {
            return Err(RuntimeError::AgentNotFound { id: id.to_string() });
        }
        *self
            .inner
            .default_agent
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(id.to_string());
        Ok(())
    }

    pub fn agent(&self, id: &str) -> Option<AgentConfig> {
        self.inner
            .agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|a| a.id == id)
            .cloned()
    }

    /// Registered agent ids, in registration order.
    pub fn agent_ids(&self) -> Vec<String> {
        self.inner
            .agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|a| a.id.clone())
            .collect()
    }

    /// Explicit id, else the first agent whose keywords match, else the
    /// default agent.
    pub fn select_agent(&self, agent_id: Option<&str>, prompt: &str) -> Result<AgentConfig, RuntimeError> {
        if let Some(id) = agent_id {
            return self
                .agent(id)
                .ok_or_else(|| RuntimeError::AgentNotFound { id: id.to_string() });
        }
        let matched = self
            .inner
            .agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|a| a.matches_prompt(prompt))
            .cloned();
        if let Some(agent) = matched {
            debug!(agent = %agent.id, "Agent selected by keyword");
            return Ok(agent);
        }
        let default = self
            .inner
            .default_agent
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        default
            .and_then(|id| self.agent(&id))
            .ok_or(RuntimeError::NoAgentSelected)
    }

    /// Run one agent against `request`.
    ///
    /// Only selection problems are returned as errors. Anything the entry
    /// point does wrong, including panicking, is a failed [`AgentRunResult`].
    pub async fn run(&self, request: AgentRequest) -> Result<AgentRunResult, RuntimeError> {
        let agent = self.select_agent(request.agent_id.as_deref(), &request.prompt)?;
        let inner = &self.inner;
        let clock = Arc::clone(inner.tasks.clock());
        let run_id = inner.history.begin(&agent.id, &request.prompt);

        let mut metadata = serde_json::Map::new();
        metadata.insert("agent_id".into(), agent.id.clone().into());
        metadata.insert("run_id".into(), run_id.to_string().into());
        metadata.insert("prompt".into(), request.prompt.clone().into());
        let task = inner
            .tasks
            .create_child_task(AGENT_TASK_TYPE, metadata, &request.cancel);

        let started_at = clock.now();
        inner.history.update(run_id, |r| {
            r.status = RunStatus::Running;
            r.task_id = Some(task.id);
            r.started_at = Some(started_at);
        });
        info!(run_id = %run_id, agent = %agent.id, task_id = %task.id, "Agent run started");

        let entry = Arc::clone(&agent.entry);
        let input = AgentInput {
            prompt: request.prompt.clone(),
            context: request.context,
        };
        let agent_id = agent.id.clone();
        let tools = inner.tools.toolset_for(&agent);
        let capabilities = agent.capabilities.clone();
        let recent_runs = inner.history.recent(&agent.id, inner.config.recent_runs);
        let scratch = request.scratch;
        let bus = inner.tasks.bus().clone();
        let guard = inner.guard.clone();

        let settled = inner
            .tasks
            .execute_task(task.id, move |ctx| {
                let env = AgentEnv {
                    agent_id,
                    tools,
                    capabilities,
                    recent_runs,
                    scratch,
                    task: ctx,
                    bus,
                    guard,
                };
                async move { entry.run(input, env).await }.boxed()
            })
            .await;

        let (output, error) = match settled {
            Ok(task) if task.status == TaskStatus::Done => (task.result, None),
            Ok(task) => {
                let failure = task
                    .error
                    .unwrap_or_else(|| Failure::execution(format!("agent task ended {}", task.status)));
                (None, Some(failure))
            }
            Err(e) => (None, Some(Failure::new(FailureKind::InvalidState, e.to_string()))),
        };
        let success = error.is_none();
        let ended_at = clock.now();
        let duration_ms =
            u64::try_from(crate::clock::elapsed_between(started_at, ended_at).as_millis()).unwrap_or(u64::MAX);

        inner.history.update(run_id, |r| {
            r.status = if success { RunStatus::Succeeded } else { RunStatus::Failed };
            r.result = output.clone();
            r.error = error.clone();
            r.ended_at = Some(ended_at);
            r.duration_ms = Some(duration_ms);
        });

        match &error {
            None => info!(run_id = %run_id, agent = %agent.id, duration_ms, "Agent run succeeded"),
            Some(f) => warn!(run_id = %run_id, agent = %agent.id, error = %f, "Agent run failed"),
        }

        self.remember(&agent.id, run_id, task.id, &request.prompt, &output, &error, duration_ms)
            .await;

        Ok(AgentRunResult {
            run_id,
            agent_id: agent.id,
            task_id: task.id,
            success,
            output,
            error,
            duration_ms,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn remember(
        &self,
        agent_id: &str,
        run_id: Uuid,
        task_id: TaskId,
        prompt: &str,
        output: &Option<serde_json::Value>,
        error: &Option<Failure>,
        duration_ms: u64,
    ) {
        let mut value = serde_json::json!({
            "prompt": prompt,
            "success": error.is_none(),
            "duration_ms": duration_ms,
        });
        match (output, error) {
            (_, Some(f)) => value["error"] = serde_json::Value::String(f.to_string()),
            (Some(out), None) => value["output"] = out.clone(),
            (None, None) => {}
        }
        let mut metadata = serde_json::Map::new();
        metadata.insert("agent_id".into(), agent_id.into());
        metadata.insert("run_id".into(), run_id.to_string().into());
        metadata.insert("task_id".into(), task_id.to_string().into());

        let event = MemoryEvent {
            event_type: "agent_run".into(),
            value,
            metadata,
        };
        match self.inner.memory.save_event(event).await {
            Ok(id) => debug!(run_id = %run_id, memory_id = %id, "Saved agent run to memory"),
            Err(e) => warn!(run_id = %run_id, error = %e, "Failed to save agent run to memory"),
        }
    }

    pub fn run_record(&self, run_id: Uuid) -> Option<AgentRunRecord> {
        self.inner.history.get(run_id)
    }

    /// All retained run records, oldest first.
    pub fn runs(&self) -> Vec<AgentRunRecord> {
        self.inner.history.all()
    }

    /// Latest finished runs of one agent, newest first.
    pub fn recent_runs(&self, agent_id: &str, n: usize) -> Vec<AgentRunRecord> {
        self.inner.history.recent(agent_id, n)
    }
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("agents", &self.agent_ids())
            .field("tools", &self.inner.tools)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::clock::SystemClock;
    use crate::enforcement::GuardMode;
    use crate::events::{EventBus, Topic};
    use crate::executor::{AgentExecutor, ExecutorOptions, InMemorySurface, StaticConsent};
    use crate::runtime::agent::{Capability, entry_fn};
    use crate::runtime::builtin::{BROWSER_ACTIONS_TOOL, BrowserActionsTool};
    use crate::runtime::memory::InMemoryMemoryStore;
    use crate::store::MemorySnapshotStore;

    struct Failing;

    #[async_trait]
    impl MemoryStore for Failing {
        async fn save_event(&self, _event: MemoryEvent) -> anyhow::Result<String> {
            anyhow::bail!("memory offline")
        }
    }

    fn runtime_with(memory: Arc<dyn MemoryStore>) -> (AgentRuntime, TaskRegistry) {
        let tasks = TaskRegistry::new(
            EventBus::new(),
            Arc::new(MemorySnapshotStore::new()),
            Arc::new(SystemClock),
        );
        let guard = ExecutionGuard::new(tasks.clone(), GuardMode::Strict);
        let runtime = AgentRuntime::new(tasks.clone(), memory, guard, RuntimeConfig::default());
        (runtime, tasks)
    }

    fn echo(id: &str) -> AgentConfig {
        AgentConfig::new(
            id,
            entry_fn(|input, _env| async move { Ok(serde_json::json!({ "echo": input.prompt })) }),
        )
    }

    #[test]
    fn selection_order() {
        let (runtime, _) = runtime_with(Arc::new(InMemoryMemoryStore::new()));
        runtime.register_agent(echo("general")).unwrap();
        runtime
            .register_agent(echo("weather").keywords(["forecast"]))
            .unwrap();
        runtime
            .register_agent(echo("weather2").keywords(["forecast"]))
            .unwrap();

        assert!(matches!(
            runtime.select_agent(None, "hello"),
            Err(RuntimeError::NoAgentSelected)
        ));
        runtime.set_default_agent("general").unwrap();

        assert_eq!(runtime.select_agent(Some("weather2"), "hi").unwrap().id, "weather2");
        assert_eq!(runtime.select_agent(None, "Forecast please").unwrap().id, "weather");
        assert_eq!(runtime.select_agent(None, "hello").unwrap().id, "general");
        assert!(matches!(
            runtime.select_agent(Some("nope"), "hi"),
            Err(RuntimeError::AgentNotFound { .. })
        ));
    }

    #[test]
    fn registration_is_validated() {
        let (runtime, _) = runtime_with(Arc::new(InMemoryMemoryStore::new()));
        runtime.register_agent(echo("a")).unwrap();
        assert!(matches!(
            runtime.register_agent(echo("a")),
            Err(RuntimeError::DuplicateAgent { .. })
        ));
        assert!(matches!(
            runtime.register_agent(echo("b").tools(["missing"])),
            Err(RuntimeError::UnknownTool { .. })
        ));
        assert!(matches!(
            runtime.set_default_agent("zzz"),
            Err(RuntimeError::AgentNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn successful_run_is_recorded_and_remembered() {
        let memory = Arc::new(InMemoryMemoryStore::new());
        let (runtime, tasks) = runtime_with(memory.clone());
        runtime.register_agent(echo("echo")).unwrap();

        let result = runtime
            .run(AgentRequest::new("hi there").agent("echo"))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output, Some(serde_json::json!({"echo": "hi there"})));

        let task = tasks.get_task(result.task_id).unwrap();
        assert_eq!(task.task_type, AGENT_TASK_TYPE);
        assert_eq!(task.status, TaskStatus::Done);

        let record = runtime.run_record(result.run_id).unwrap();
        assert_eq!(record.status, RunStatus::Succeeded);
        assert_eq!(record.task_id, Some(result.task_id));

        let events = memory.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].value["success"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn entry_errors_and_panics_become_failed_results() {
        let memory = Arc::new(InMemoryMemoryStore::new());
        let (runtime, _) = runtime_with(memory.clone());
        runtime
            .register_agent(AgentConfig::new(
                "broken",
                entry_fn(|_, _| async { Err(Failure::consent_denied("nope").into()) }),
            ))
            .unwrap();
        runtime
            .register_agent(AgentConfig::new(
                "panicky",
                entry_fn(|_, _| async { panic!("entry exploded") }),
            ))
            .unwrap();

        let broken = runtime.run(AgentRequest::new("x").agent("broken")).await.unwrap();
        assert!(!broken.success);
        assert_eq!(broken.error.as_ref().unwrap().kind, FailureKind::ConsentDenied);

        let panicky = runtime.run(AgentRequest::new("x").agent("panicky")).await.unwrap();
        assert!(!panicky.success);
        assert_eq!(panicky.error.as_ref().unwrap().kind, FailureKind::Execution);

        assert_eq!(runtime.run_record(broken.run_id).unwrap().status, RunStatus::Failed);
        assert_eq!(memory.events().len(), 2);
        assert_eq!(memory.events()[0].value["success"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn memory_failure_is_not_surfaced() {
        let (runtime, _) = runtime_with(Arc::new(Failing));
        runtime.register_agent(echo("echo")).unwrap();
        let result = runtime.run(AgentRequest::new("hi").agent("echo")).await.unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn env_exposes_tools_events_and_history() {
        let (runtime, tasks) = runtime_with(Arc::new(InMemoryMemoryStore::new()));
        let surface = Arc::new(InMemorySurface::new().with_element("#title", "Docs"));
        let executor = AgentExecutor::new(
            tasks.bus().clone(),
            surface.clone(),
            surface,
            Arc::new(StaticConsent::allow_all()),
        );
        runtime
            .register_tool(Arc::new(BrowserActionsTool::new(executor, ExecutorOptions::default())))
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            tasks.bus().on(Topic::AgentEvent, move |e| {
                seen.lock().unwrap().push(e.clone());
                Ok(())
            });
        }

        let reader = AgentConfig::new(
            "reader",
            entry_fn(|_, env| async move {
                env.dispatch_event("reading", serde_json::json!({"recent": env.recent_runs().len()}));
                env.task().stream("reading page")?;
                let out = env
                    .call_tool(BROWSER_ACTIONS_TOOL, serde_json::json!([{"type": "read", "selector": "#title"}]))
                    .await?;
                Ok(out["outputs"][0].clone())
            }),
        )
        .capabilities([Capability::Dom, Capability::Navigation])
        .tools([BROWSER_ACTIONS_TOOL]);
        runtime.register_agent(reader).unwrap();

        let blind = AgentConfig::new(
            "blind",
            entry_fn(|_, env| async move { env.call_tool(BROWSER_ACTIONS_TOOL, serde_json::json!([])).await }),
        )
        .tools([BROWSER_ACTIONS_TOOL]);
        runtime.register_agent(blind).unwrap();

        let first = runtime.run(AgentRequest::new("go").agent("reader")).await.unwrap();
        assert!(first.success, "{:?}", first.error);
        assert_eq!(first.output, Some(serde_json::json!("Docs")));
        assert_eq!(tasks.get_task(first.task_id).unwrap().output, vec!["reading page"]);

        runtime.run(AgentRequest::new("again").agent("reader")).await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(matches!(&seen[1], crate::events::Event::Agent { payload, .. } if payload["recent"] == 1));

        // Capability check left the tool out of the blind agent's toolset.
        let blind = runtime.run(AgentRequest::new("x").agent("blind")).await.unwrap();
        assert!(!blind.success);
        assert!(blind.error.unwrap().message.contains("not available"));
    }

    #[tokio::test]
    async fn cancelling_the_request_cancels_the_run() {
        let (runtime, tasks) = runtime_with(Arc::new(InMemoryMemoryStore::new()));
        runtime
            .register_agent(AgentConfig::new(
                "slow",
                entry_fn(|_, env| async move {
                    env.cancel_token().cancelled().await;
                    Ok(serde_json::Value::Null)
                }),
            ))
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = {
            let runtime = runtime.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { runtime.run(AgentRequest::new("x").agent("slow").cancel(cancel)).await })
        };
        while tasks.running_tasks().is_empty() {
            tokio::task::yield_now().await;
        }
        cancel.cancel();

        let result = handle.await.unwrap().unwrap();
        assert!(!result.success);
        assert_eq!(result.error.unwrap().kind, FailureKind::Cancelled);
        assert_eq!(tasks.get_task(result.task_id).unwrap().status, TaskStatus::Canceled);
    }
}
