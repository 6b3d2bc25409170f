//! Agent orchestrator: priority queue, concurrency cap, per-agent rate
//! limiting and bounded retries.

pub mod job;
#[allow(clippy::module_inception)]
pub mod orchestrator;
pub mod queue;
pub mod rate_limit;

pub use job::{Job, JobRequest, JobStatus};
pub use orchestrator::{AgentOrchestrator, OrchestratorConfig, OrchestratorStats};
pub use rate_limit::{RateLimitConfig, RateLimitTier, RateLimiter};
