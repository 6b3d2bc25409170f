//! Tools agents may call, and the registry that validates them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::RuntimeError;
use crate::runtime::agent::{AgentConfig, Capability};
use crate::task::TaskId;

/// Who is calling a tool.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub agent_id: String,
    pub task_id: TaskId,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn id(&self) -> &str;

    fn description(&self) -> &str;

    /// An agent must declare all of these to be given the tool.
    fn required_capabilities(&self) -> &[Capability];

    async fn invoke(&self, input: serde_json::Value, ctx: &ToolContext) -> anyhow::Result<serde_json::Value>;
}

/// All tools known to the runtime, by id.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Ids are unique.
    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<(), RuntimeError> {
        let id = tool.id().to_string();
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        if tools.contains_key(&id) {
            return Err(RuntimeError::DuplicateTool { id });
        }
        debug!(tool = %id, "Registered tool");
        tools.insert(id, tool);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn has(&self, id: &str) -> bool {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    pub fn list(&self) -> Vec<String> {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Every tool id an agent names must exist.
    pub(crate) fn validate(&self, agent: &AgentConfig) -> Result<(), RuntimeError> {
        match agent.allowed_tools.iter().find(|t| !self.has(t)) {
            Some(missing) => Err(RuntimeError::UnknownTool {
                agent: agent.id.clone(),
                tool: missing.clone(),
            }),
            None => Ok(()),
        }
    }

    /// The agent's allowed tools, minus any whose capabilities it lacks.
    pub(crate) fn toolset_for(&self, agent: &AgentConfig) -> Toolset {
        let mut tools = BTreeMap::new();
        for id in &agent.allowed_tools {
            let Some(tool) = self.get(id) else {
                continue;
            };
            let missing: BTreeSet<Capability> = tool
                .required_capabilities()
                .iter()
                .filter(|c| !agent.capabilities.contains(*c))
                .copied()
                .collect();
            if !missing.is_empty() {
                warn!(
                    agent = %agent.id,
                    tool = %id,
                    missing = ?missing,
                    "Omitting tool: agent lacks required capabilities"
                );
                continue;
            }
            tools.insert(id.clone(), tool);
        }
        Toolset { tools }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry").field("tools", &self.list()).finish()
    }
}

/// The tools one agent run may use.
#[derive(Clone, Default)]
pub struct Toolset {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl Toolset {
    pub fn get(&self, id: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tools.contains_key(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for Toolset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.tools.keys()).finish()
    }
}
