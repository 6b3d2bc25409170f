//! Snapshot persistence.

pub mod file;
pub mod memory;
pub mod traits;

pub use file::FileSnapshotStore;
pub use memory::MemorySnapshotStore;
pub use traits::{SnapshotStore, TASK_SNAPSHOT_KEY};
