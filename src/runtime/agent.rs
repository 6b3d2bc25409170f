//! Agent declarations.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::runtime::env::AgentEnv;

/// A capability an agent declares and a tool may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Reading and interacting with a document.
    Dom,
    Navigation,
    Network,
    Storage,
    Ai,
    Compute,
}

/// Request handed to an agent's entry point.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentInput {
    pub prompt: String,
    #[serde(default)]
    pub context: serde_json::Value,
}

/// An agent's behaviour. Errors (and panics) become failed runs; return a
/// [`Failure`](crate::error::Failure) through `anyhow` to classify them.
#[async_trait]
pub trait AgentEntry: Send + Sync {
    async fn run(&self, input: AgentInput, env: AgentEnv) -> anyhow::Result<serde_json::Value>;
}

struct FnEntry<F>(F);

#[async_trait]
impl<F, Fut> AgentEntry for FnEntry<F>
where
    F: Fn(AgentInput, AgentEnv) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
{
    async fn run(&self, input: AgentInput, env: AgentEnv) -> anyhow::Result<serde_json::Value> {
        (self.0)(input, env).await
    }
}

/// Wrap an async closure as an entry point.
pub fn entry_fn<F, Fut>(f: F) -> Arc<dyn AgentEntry>
where
    F: Fn(AgentInput, AgentEnv) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
{
    Arc::new(FnEntry(f))
}

/// Static description of an agent. Immutable once registered.
#[derive(Clone)]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    pub capabilities: BTreeSet<Capability>,
    pub allowed_tools: Vec<String>,
    /// Matched case-insensitively as substrings of the prompt.
    pub keywords: Vec<String>,
    pub intent_tags: Vec<String>,
    pub entry: Arc<dyn AgentEntry>,
}

impl AgentConfig {
    pub fn new(id: impl Into<String>, entry: Arc<dyn AgentEntry>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            capabilities: BTreeSet::new(),
            allowed_tools: Vec::new(),
            keywords: Vec::new(),
            intent_tags: Vec::new(),
            entry,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn capabilities(mut self, caps: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities.extend(caps);
        self
    }

    pub fn tools<S: Into<String>>(mut self, tools: impl IntoIterator<Item = S>) -> Self {
        self.allowed_tools.extend(tools.into_iter().map(Into::into));
        self
    }

    pub fn keywords<S: Into<String>>(mut self, keywords: impl IntoIterator<Item = S>) -> Self {
        self.keywords.extend(keywords.into_iter().map(Into::into));
        self
    }

    pub fn intent_tags<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.intent_tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Whether any trigger keyword occurs in `prompt`.
    pub fn matches_prompt(&self, prompt: &str) -> bool {
        let prompt = prompt.to_lowercase();
        self.keywords
            .iter()
            .filter(|k| !k.trim().is_empty())
            .any(|k| prompt.contains(&k.to_lowercase()))
    }
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("allowed_tools", &self.allowed_tools)
            .field("keywords", &self.keywords)
            .finish()
    }
}
