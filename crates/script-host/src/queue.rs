//! Event queue shared between host-side producers and the scheduler

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use perch_protocol::Event;

/// Unbounded FIFO of pending events.
///
/// Producers (input, timers, I/O completions, the script itself) push from
/// any thread; only the scheduler pops, once per host tick. Filter drops
/// happen at delivery, never here.
#[derive(Debug, Default)]
pub struct EventQueue {
    inner: Mutex<VecDeque<Event>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: Event) {
        self.lock().push_back(event);
    }

    pub fn pop(&self) -> Option<Event> {
        self.lock().pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything still pending; used across session teardown so a new
    /// stage never sees events addressed to the previous one.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Event>> {
        // A poisoned queue still holds valid events; producers must not
        // take the whole machine down with them.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
