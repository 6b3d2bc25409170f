//! What an agent's entry point sees during a run.

use std::collections::BTreeSet;

use tokio_util::sync::CancellationToken;

use crate::enforcement::ExecutionGuard;
use crate::error::Failure;
use crate::events::{Event, EventBus};
use crate::runtime::agent::Capability;
use crate::runtime::runs::AgentRunRecord;
use crate::runtime::scratch::ScratchContext;
use crate::runtime::tool::{ToolContext, Toolset};
use crate::task::{TaskContext, TaskId};

/// Per-run environment handed to [`AgentEntry::run`](crate::runtime::AgentEntry::run).
#[derive(Clone)]
pub struct AgentEnv {
    pub(crate) agent_id: String,
    pub(crate) tools: Toolset,
    pub(crate) capabilities: BTreeSet<Capability>,
    pub(crate) recent_runs: Vec<AgentRunRecord>,
    pub(crate) scratch: ScratchContext,
    pub(crate) task: TaskContext,
    pub(crate) bus: EventBus,
    pub(crate) guard: ExecutionGuard,
}

impl AgentEnv {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id()
    }

    /// Tools this agent may call.
    pub fn tools(&self) -> &Toolset {
        &self.tools
    }

    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    /// The agent's latest finished runs, newest first.
    pub fn recent_runs(&self) -> &[AgentRunRecord] {
        &self.recent_runs
    }

    pub fn scratch(&self) -> &ScratchContext {
        &self.scratch
    }

    /// Cancellation signal of the run's task.
    pub fn cancel_token(&self) -> &CancellationToken {
        self.task.cancel_token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    /// The run's task, for streaming output and logs.
    pub fn task(&self) -> &TaskContext {
        &self.task
    }

    /// Publish a free-form event on `agent:event`.
    pub fn dispatch_event(&self, name: impl Into<String>, payload: serde_json::Value) {
        self.bus.emit(Event::Agent {
            agent_id: self.agent_id.clone(),
            name: name.into(),
            payload,
        });
    }

    /// Call a tool from this run's toolset.
    pub async fn call_tool(&self, id: &str, input: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        self.guard.require_task(Some(self.task_id()), id)?;
        let tool = self
            .tools
            .get(id)
            .ok_or_else(|| Failure::execution(format!("tool '{id}' is not available to agent '{}'", self.agent_id)))?;
        let ctx = ToolContext {
            agent_id: self.agent_id.clone(),
            task_id: self.task_id(),
            cancel: self.cancel_token().clone(),
        };
        tool.invoke(input, &ctx).await
    }
}

impl std::fmt::Debug for AgentEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentEnv")
            .field("agent_id", &self.agent_id)
            .field("task_id", &self.task_id())
            .field("tools", &self.tools)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}
