//! Background drain of an [`EventQueue`] into an [`EventCache`].

use super::{Event, EventCache, EventCursor, EventQueue};
use crate::controller::Signal;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Idle wait between queue polls.
pub const WAIT_DELAY: Duration = Duration::from_millis(100);

/// Event type of the wrapper recorded when a callback fails.
pub const EVENT_CACHING_ERROR: &str = "EVENT_CACHING_ERROR";

/// Hook applied to every event before it is cached.
///
/// The returned event is what gets cached. An error is recorded as an
/// [`EVENT_CACHING_ERROR`] event instead; the process keeps running.
pub trait EventCallback: Send + 'static {
    /// Transform or pass through one event.
    fn on_event(&mut self, event: Event) -> anyhow::Result<Event>;
}

impl<F> EventCallback for F
where
    F: FnMut(Event) -> anyhow::Result<Event> + Send + 'static,
{
    fn on_event(&mut self, event: Event) -> anyhow::Result<Event> {
        self(event)
    }
}

/// Caches events unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl EventCallback for PassThrough {
    fn on_event(&mut self, event: Event) -> anyhow::Result<Event> {
        Ok(event)
    }
}

/// Appends every event to a file as one JSON object per line.
pub struct EventLog {
    writer: BufWriter<File>,
}

impl EventLog {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl EventCallback for EventLog {
    fn on_event(&mut self, event: Event) -> anyhow::Result<Event> {
        serde_json::to_writer(&mut self.writer, &event)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(event)
    }
}

/// Owns the drain thread feeding an [`EventCache`] from an [`EventQueue`].
///
/// The thread never exits on its own while events keep arriving; [`shutdown`]
/// requests a stop, after which everything already queued is still cached before the
/// thread exits.
///
/// [`shutdown`]: EventCachingProcess::shutdown
pub struct EventCachingProcess {
    queue: EventQueue,
    cache: EventCache,
    stop: Signal,
    callback: Mutex<Option<Box<dyn EventCallback>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventCachingProcess {
    /// Drain `queue` into a fresh cache.
    pub fn new(queue: EventQueue) -> Self {
        Self::with_callback(queue, PassThrough)
    }

    /// Like [`new`](Self::new), also handing each event to `callback`.
    pub fn with_callback(queue: EventQueue, callback: impl EventCallback) -> Self {
        Self {
            queue,
            cache: EventCache::new(),
            stop: Signal::new(),
            callback: Mutex::new(Some(Box::new(callback))),
            worker: Mutex::new(None),
        }
    }

    /// Cache events and also append them to a JSON-lines file at `path`.
    pub fn with_event_file(queue: EventQueue, path: &Path) -> io::Result<Self> {
        Ok(Self::with_callback(queue, EventLog::open(path)?))
    }

    /// The queue being drained.
    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Everything drained so far.
    pub fn cache(&self) -> &EventCache {
        &self.cache
    }

    /// A fresh cursor over the cached history.
    pub fn cursor(&self) -> EventCursor {
        self.cache.cursor()
    }

    /// Drop the cached history. Existing cursors restart from the new history.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// True between `start` and `shutdown`.
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Spawn the drain thread. Calling it again while running is a no-op.
    pub fn start(&self) -> io::Result<()> {
        let Some(callback) = self.callback.lock().take() else {
            debug!("event caching process already started");
            return Ok(());
        };
        let queue = self.queue.clone();
        let cache = self.cache.clone();
        let stop = self.stop.clone();
        let handle = std::thread::Builder::new()
            .name("event-caching".to_string())
            .spawn(move || drain(queue, cache, callback, stop))?;
        *self.worker.lock() = Some(handle);
        info!("event caching process started");
        Ok(())
    }

    /// Request a stop and wait for the queue to be drained.
    pub fn shutdown(&self) {
        self.stop.set();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("event caching thread panicked");
            }
            info!(cached = self.cache.len(), "event caching process stopped");
        }
    }
}

impl Drop for EventCachingProcess {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drain(queue: EventQueue, cache: EventCache, mut callback: Box<dyn EventCallback>, stop: Signal) {
    loop {
        match queue.try_pop() {
            Some(event) => cache_one(&cache, callback.as_mut(), event),
            None if stop.is_set() => return,
            None => {
                if let Some(event) = queue.pop_timeout(WAIT_DELAY) {
                    cache_one(&cache, callback.as_mut(), event);
                }
            }
        }
    }
}

fn cache_one(cache: &EventCache, callback: &mut dyn EventCallback, event: Event) {
    let original = event.clone();
    match callback.on_event(event) {
        Ok(processed) => cache.append(processed),
        Err(err) => {
            warn!(event_type = %original.event_type, error = %err, "event callback failed");
            let wrapped = caching_error(&original, &err);
            let wrapped = match callback.on_event(wrapped.clone()) {
                Ok(processed) => processed,
                Err(_) => wrapped,
            };
            cache.append(wrapped);
        }
    }
}

fn caching_error(original: &Event, err: &anyhow::Error) -> Event {
    let chain: Vec<Value> = err.chain().map(|cause| json!(cause.to_string())).collect();
    Event::new(
        EVENT_CACHING_ERROR,
        json!({
            "event": serde_json::to_value(original).unwrap_or(Value::Null),
            "error_msg": err.to_string(),
            "error_chain": chain,
        }),
    )
}
