//! Controller events and their distribution.
//!
//! Controllers push `(event_type, content)` pairs onto a shared [`EventQueue`]. An
//! [`EventCachingProcess`] drains the queue on its own thread into an append-only
//! [`EventCache`], from which any number of [`EventCursor`]s read independently. The
//! [`EventServer`] streams the cache to network subscribers: full history first, then
//! a live tail.

pub mod cache;
pub mod caching;
pub mod server;

pub use cache::{EventCache, EventCursor};
pub use caching::{EventCallback, EventCachingProcess, EventLog, PassThrough, EVENT_CACHING_ERROR};
pub use server::{EventServer, EventSubscriber, Frame};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A typed, timestamped record emitted by a controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Free-form type tag.
    pub event_type: String,
    /// Payload.
    pub content: Map<String, Value>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Build an event. Object content is used as-is, `null` becomes an empty map, and
    /// any other value is stored under the `"value"` key.
    pub fn new(event_type: impl Into<String>, content: Value) -> Self {
        let content = match content {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            event_type: event_type.into(),
            content,
            timestamp: Utc::now(),
        }
    }

    /// One payload entry.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.content.get(key)
    }
}

/// Unbounded multi-producer queue shared by a controller tree and its consumer.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone, Default)]
pub struct EventQueue {
    inner: Arc<QueueInner>,
}

#[derive(Default)]
struct QueueInner {
    items: Mutex<VecDeque<Event>>,
    ready: Condvar,
}

impl EventQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue and wake one waiter.
    pub fn push(&self, event: Event) {
        self.inner.items.lock().push_back(event);
        self.inner.ready.notify_one();
    }

    /// Dequeue without blocking.
    pub fn try_pop(&self) -> Option<Event> {
        self.inner.items.lock().pop_front()
    }

    /// Wait up to `timeout` for an event.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Event> {
        let deadline = Instant::now() + timeout;
        let mut items = self.inner.items.lock();
        loop {
            if let Some(event) = items.pop_front() {
                return Some(event);
            }
            if self.inner.ready.wait_until(&mut items, deadline).timed_out() {
                return items.pop_front();
            }
        }
    }

    /// Events currently queued.
    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.items.lock().is_empty()
    }

    /// True when both handles refer to the same queue.
    pub fn same_as(&self, other: &EventQueue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue").field("len", &self.len()).finish()
    }
}
