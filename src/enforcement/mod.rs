//! Runtime enforcement: watchdog, crash recovery and the execution guard.

pub mod guard;
pub mod recovery;
pub mod watchdog;

pub use guard::{ExecutionGuard, GuardMode};
pub use recovery::{INTERRUPTED_MESSAGE, RecoveryReport, recover};
pub use watchdog::{Watchdog, WatchdogConfig, WatchdogHandle};
