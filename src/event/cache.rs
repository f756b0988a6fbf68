//! Append-only event history with independent read cursors.

use super::Event;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Ordered, append-only in-memory event history.
///
/// Cloning yields another handle to the same history.
#[derive(Clone, Default)]
pub struct EventCache {
    inner: Arc<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    state: Mutex<CacheState>,
    appended: Condvar,
}

#[derive(Default)]
struct CacheState {
    events: Vec<Event>,
    // Bumped by `clear` so cursors restart at the beginning of the new history.
    epoch: u64,
}

impl EventCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append and wake waiting cursors.
    pub fn append(&self, event: Event) {
        self.inner.state.lock().events.push(event);
        self.inner.appended.notify_all();
    }

    /// Number of cached events.
    pub fn len(&self) -> usize {
        self.inner.state.lock().events.len()
    }

    /// True before the first append.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the full history.
    pub fn snapshot(&self) -> Vec<Event> {
        self.inner.state.lock().events.clone()
    }

    /// Drop all cached events.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.events.clear();
        state.epoch += 1;
        self.inner.appended.notify_all();
    }

    /// A new cursor positioned at the start of the history.
    pub fn cursor(&self) -> EventCursor {
        let epoch = self.inner.state.lock().epoch;
        EventCursor {
            cache: self.clone(),
            index: 0,
            epoch,
        }
    }
}

impl std::fmt::Debug for EventCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCache").field("len", &self.len()).finish()
    }
}

/// A monotonic read position into an [`EventCache`].
///
/// Each fetch returns everything appended since the previous fetch, exactly once.
#[derive(Debug)]
pub struct EventCursor {
    cache: EventCache,
    index: usize,
    epoch: u64,
}

impl EventCursor {
    /// Everything appended since the last fetch; empty when nothing is new.
    pub fn next_batch(&mut self) -> Vec<Event> {
        let inner = Arc::clone(&self.cache.inner);
        let state = inner.state.lock();
        self.take_new(&state)
    }

    /// Like [`next_batch`](Self::next_batch) but waits up to `timeout` for at least one
    /// new event.
    pub fn wait_batch(&mut self, timeout: Duration) -> Vec<Event> {
        let deadline = Instant::now() + timeout;
        let inner = Arc::clone(&self.cache.inner);
        let mut state = inner.state.lock();
        while !self.has_new(&state) {
            if inner.appended.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        let batch = self.take_new(&state);
        drop(state);
        batch
    }

    /// Number of events consumed so far in the current history.
    pub fn position(&self) -> usize {
        self.index
    }

    fn has_new(&self, state: &CacheState) -> bool {
        state.epoch != self.epoch || state.events.len() > self.index
    }

    fn take_new(&mut self, state: &CacheState) -> Vec<Event> {
        if state.epoch != self.epoch {
            self.epoch = state.epoch;
            self.index = 0;
        }
        let batch = state.events[self.index..].to_vec();
        self.index = state.events.len();
        batch
    }
}
