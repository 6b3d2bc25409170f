//! Event bus: the only channel components use to talk to each other.

pub mod bus;
pub mod event;

pub use bus::{EventBus, Handler, Subscription};
pub use event::{Event, Topic};
