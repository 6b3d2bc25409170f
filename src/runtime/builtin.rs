//! Builtin tools.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Failure, FailureKind};
use crate::executor::{Action, AgentExecutor, ExecutorOptions};
use crate::runtime::agent::Capability;
use crate::runtime::tool::{Tool, ToolContext};

pub const BROWSER_ACTIONS_TOOL: &str = "browser_actions";

/// Drives the agent executor. Input is either an action array or
/// `{"actions": [...]}`. Safety options are fixed at construction; callers
/// cannot loosen them.
#[derive(Debug, Clone)]
pub struct BrowserActionsTool {
    executor: AgentExecutor,
    options: ExecutorOptions,
}

impl BrowserActionsTool {
    pub fn new(executor: AgentExecutor, options: ExecutorOptions) -> Self {
        Self { executor, options }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BrowserInput {
    Bare(Vec<Action>),
    Wrapped { actions: Vec<Action> },
}

#[async_trait]
impl Tool for BrowserActionsTool {
    fn id(&self) -> &str {
        BROWSER_ACTIONS_TOOL
    }

    fn description(&self) -> &str {
        "Run an ordered list of page actions (click, fill, read, navigate, extract, save, scroll, wait)"
    }

    fn required_capabilities(&self) -> &[Capability] {
        &[Capability::Dom, Capability::Navigation]
    }

    async fn invoke(&self, input: serde_json::Value, ctx: &ToolContext) -> anyhow::Result<serde_json::Value> {
        let actions = match serde_json::from_value::<BrowserInput>(input) {
            Ok(BrowserInput::Bare(actions)) | Ok(BrowserInput::Wrapped { actions }) => actions,
            Err(e) => return Err(Failure::new(FailureKind::InvalidState, format!("invalid action list: {e}")).into()),
        };
        debug!(agent = %ctx.agent_id, task_id = %ctx.task_id, actions = actions.len(), "Running browser actions");

        let result = self
            .executor
            .execute_with_cancel(actions, &self.options, &ctx.cancel)
            .await;
        if !result.success
            && let Some(failure) = result.error.clone()
        {
            return Err(failure.into());
        }
        Ok(serde_json::to_value(&result)?)
    }
}
