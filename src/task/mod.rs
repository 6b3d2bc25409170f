//! Tasks: tracked units of work with a visible lifecycle.
//!
//! - `state`: status graph (CREATED → RUNNING ⇄ PARTIAL → DONE/FAILED/CANCELED)
//! - `model`: the `Task` entity and its ids/log entries
//! - `registry`: the owner of all task state

pub mod model;
pub mod registry;
pub mod state;

pub use model::{LogEntry, Task, TaskId};
pub use registry::{TaskContext, TaskFuture, TaskRegistry, TaskSnapshot};
pub use state::TaskStatus;
