//! Synchronous in-process publish/subscribe.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use super::event::{Event, Topic};

/// A subscriber callback. Returning an error is logged and never blocks the
/// remaining subscribers.
pub type Handler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    /// Keyed by subscription id, so iteration order is registration order.
    handlers: BTreeMap<u64, (Option<Topic>, Handler)>,
}

/// The event bus. Cheap to clone; all clones share the subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Subscribers>>,
}

/// Handle returned by [`EventBus::on`]; call [`Subscription::unsubscribe`]
/// to detach. Dropping the handle keeps the subscription alive.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: Weak<Mutex<Subscribers>>,
}

impl Subscription {
    /// Remove the handler. Safe to call after the bus is gone.
    pub fn unsubscribe(self) {
        if let Some(bus) = self.bus.upgrade()
            && let Ok(mut subs) = bus.lock()
        {
            subs.handlers.remove(&self.id);
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one topic.
    pub fn on<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(Some(topic), Arc::new(handler))
    }

    /// Subscribe to every topic.
    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(None, Arc::new(handler))
    }

    fn subscribe(&self, topic: Option<Topic>, handler: Handler) -> Subscription {
        let mut subs = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = subs.next_id;
        subs.next_id += 1;
        subs.handlers.insert(id, (topic, handler));
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to all current subscribers of its topic, in
    /// registration order, on the calling thread.
    pub fn emit(&self, event: Event) {
        let topic = event.topic();
        // Copy out so handlers can re-enter the bus.
        let handlers: Vec<Handler> = {
            let subs = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            subs.handlers
                .values()
                .filter(|(t, _)| t.is_none_or(|t| t == topic))
                .map(|(_, h)| Arc::clone(h))
                .collect()
        };

        debug!(topic = %topic, subscribers = handlers.len(), "Emitting event");

        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(topic = %topic, error = %e, "Event handler failed"),
                Err(_) => warn!(topic = %topic, "Event handler panicked"),
            }
        }
    }

    /// Number of handlers that would receive an event on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        let subs = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        subs.handlers
            .values()
            .filter(|(t, _)| t.is_none_or(|t| t == topic))
            .count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .inner
            .lock()
            .map(|s| s.handlers.len())
            .unwrap_or_default();
        f.debug_struct("EventBus").field("subscribers", &count).finish()
    }
}
