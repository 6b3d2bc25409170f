//! Taskcore: tracked tasks, heavy-work offload and agent orchestration.

pub mod clock;
pub mod config;
pub mod enforcement;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod orchestrator;
pub mod runtime;
pub mod store;
pub mod task;
pub mod worker;
