//! Worker bridge: heavy work offloaded to isolated compute threads.
//!
//! - `classify`: keyword classifier deciding what counts as heavy
//! - `pool`: fixed set of OS threads fed over channels
//! - `bridge`: async dispatch with timeout, cancellation and progress relay

pub mod bridge;
pub mod classify;
pub mod pool;

pub use bridge::WorkerBridge;
pub use classify::{HEAVY_TASK_KEYWORDS, should_use_worker};
pub use pool::{WorkerHandler, WorkerJob, WorkerMessage, WorkerPool, WorkerScope};
