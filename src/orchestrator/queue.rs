//! Priority queue with FIFO tie-break.

use std::collections::VecDeque;

use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    id: Uuid,
    priority: i32,
}

/// Highest priority first; equal priorities keep insertion order.
#[derive(Debug, Default)]
pub(crate) struct JobQueue {
    entries: VecDeque<QueueEntry>,
}

impl JobQueue {
    /// Insert behind every entry of equal or higher priority.
    pub(crate) fn push(&mut self, id: Uuid, priority: i32) {
        let at = self
            .entries
            .iter()
            .position(|e| e.priority < priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, QueueEntry { id, priority });
    }

    pub(crate) fn pop(&mut self) -> Option<Uuid> {
        self.entries.pop_front().map(|e| e.id)
    }

    pub(crate) fn remove(&mut self, id: Uuid) -> bool {
        match self.entries.iter().position(|e| e.id == id) {
            Some(at) => {
                self.entries.remove(at);
                true
            }
            None => false,
        }
    }

    pub(crate) fn ids(&self) -> Vec<Uuid> {
        self.entries.iter().map(|e| e.id).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
