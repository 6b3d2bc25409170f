//! Agent runtime: declarative agents, sandboxed tools and per-run context.

pub mod agent;
pub mod builtin;
pub mod env;
pub mod memory;
pub mod runs;
#[allow(clippy::module_inception)]
pub mod runtime;
pub mod scratch;
pub mod tool;

pub use agent::{AgentConfig, AgentEntry, AgentInput, Capability, entry_fn};
pub use builtin::{BROWSER_ACTIONS_TOOL, BrowserActionsTool};
pub use env::AgentEnv;
pub use memory::{InMemoryMemoryStore, MemoryEvent, MemoryStore};
pub use runs::{AgentRunRecord, RunStatus};
pub use runtime::{AGENT_TASK_TYPE, AgentRequest, AgentRunResult, AgentRuntime, RuntimeConfig};
pub use scratch::ScratchContext;
pub use tool::{Tool, ToolContext, ToolRegistry, Toolset};
