//! Key-value blob store used for task snapshots.

use crate::error::SnapshotError;

/// Well-known key the task snapshot is written under.
pub const TASK_SNAPSHOT_KEY: &str = "task_snapshot";

/// Minimal snapshot-on-write persistence: one opaque blob per key.
///
/// Calls are synchronous and expected to be fast; the registry writes after
/// every state transition.
pub trait SnapshotStore: Send + Sync {
    /// Replace the blob stored under `key`.
    fn save(&self, key: &str, blob: &str) -> Result<(), SnapshotError>;

    /// Read the blob stored under `key`, if any.
    fn load(&self, key: &str) -> Result<Option<String>, SnapshotError>;
}
