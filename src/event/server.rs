//! TCP distribution of cached events.
//!
//! Every frame on the wire is a 4-byte big-endian length followed by a JSON body. A
//! subscriber first receives one [`Frame::PastEvents`] with the full history at
//! connect time, then one [`Frame::Event`] per newly cached event, in cache order.

use super::{Event, EventCachingProcess, EventCursor};
use crate::controller::Signal;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Concurrent subscriber limit; connections beyond it are closed immediately.
pub const MAX_CONNECTIONS: usize = 5;

const ACCEPT_POLL: Duration = Duration::from_millis(100);
const TAIL_POLL: Duration = Duration::from_millis(100);
const PEER_CHECK: Duration = Duration::from_millis(1);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// One message on the event stream, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// Cached history, sent once on connect.
    PastEvents {
        /// Events in arrival order.
        events: Vec<Event>,
    },
    /// One live event.
    Event {
        /// The event.
        event: Event,
    },
}

/// Write one length-prefixed frame.
pub fn write_frame(writer: &mut impl Write, frame: &Frame) -> io::Result<()> {
    let body = serde_json::to_vec(frame)?;
    let len = u32::try_from(body.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()
}

/// Read one length-prefixed frame, rejecting oversized lengths.
pub fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}

/// Streams the history of an [`EventCachingProcess`] to TCP subscribers.
///
/// The caching process is shared, not owned: starting and stopping it is up to the
/// caller.
pub struct EventServer {
    listener: Arc<TcpListener>,
    caching: Arc<EventCachingProcess>,
    stop: Signal,
    active: Arc<AtomicUsize>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    clients: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl EventServer {
    /// Bind the listening socket. Port 0 picks a free port; see [`local_addr`].
    ///
    /// [`local_addr`]: EventServer::local_addr
    pub fn bind(addr: impl ToSocketAddrs, caching: Arc<EventCachingProcess>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener: Arc::new(listener),
            caching,
            stop: Signal::new(),
            active: Arc::new(AtomicUsize::new(0)),
            accept_thread: Mutex::new(None),
            clients: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Bound address; useful after binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Subscribers currently being served.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Spawn the accept loop.
    pub fn start(&self) -> io::Result<()> {
        let mut slot = self.accept_thread.lock();
        if slot.is_some() {
            return Ok(());
        }
        let listener = Arc::clone(&self.listener);
        let caching = Arc::clone(&self.caching);
        let stop = self.stop.clone();
        let active = Arc::clone(&self.active);
        let clients = Arc::clone(&self.clients);
        *slot = Some(
            std::thread::Builder::new()
                .name("event-server".to_string())
                .spawn(move || accept_loop(&listener, &caching, &stop, &active, &clients))?,
        );
        info!(addr = ?self.local_addr().ok(), "event server listening");
        Ok(())
    }

    /// Stop accepting, close every subscriber connection and wait for all threads.
    pub fn shutdown(&self) {
        self.stop.set();
        if let Some(handle) = self.accept_thread.lock().take() {
            if handle.join().is_err() {
                error!("event server accept thread panicked");
            }
        }
        let clients: Vec<_> = self.clients.lock().drain(..).collect();
        for handle in clients {
            if handle.join().is_err() {
                error!("event server client thread panicked");
            }
        }
        debug!("event server stopped");
    }
}

impl Drop for EventServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: &TcpListener,
    caching: &EventCachingProcess,
    stop: &Signal,
    active: &Arc<AtomicUsize>,
    clients: &Mutex<Vec<JoinHandle<()>>>,
) {
    while !stop.is_set() {
        match listener.accept() {
            Ok((stream, peer)) => {
                if active.load(Ordering::Acquire) >= MAX_CONNECTIONS {
                    warn!(%peer, "subscriber limit reached, closing connection");
                    drop(stream);
                    continue;
                }
                active.fetch_add(1, Ordering::AcqRel);
                let cursor = caching.cursor();
                let stop = stop.clone();
                let counter = Arc::clone(active);
                let spawned = std::thread::Builder::new()
                    .name(format!("event-client-{peer}"))
                    .spawn(move || {
                        match serve_client(stream, cursor, &stop) {
                            Ok(()) => debug!(%peer, "subscriber closed"),
                            Err(e) => debug!(%peer, error = %e, "subscriber disconnected"),
                        }
                        counter.fetch_sub(1, Ordering::AcqRel);
                    });
                match spawned {
                    Ok(handle) => {
                        let mut clients = clients.lock();
                        clients.retain(|h| !h.is_finished());
                        clients.push(handle);
                        info!(%peer, "subscriber connected");
                    }
                    Err(e) => {
                        active.fetch_sub(1, Ordering::AcqRel);
                        error!(%peer, error = %e, "failed to spawn subscriber thread");
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                stop.wait_timeout(ACCEPT_POLL);
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                stop.wait_timeout(ACCEPT_POLL);
            }
        }
    }
}

fn serve_client(stream: TcpStream, mut cursor: EventCursor, stop: &Signal) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    stream.set_read_timeout(Some(PEER_CHECK))?;
    let mut peer = stream.try_clone()?;
    let mut writer = BufWriter::new(stream);
    write_frame(
        &mut writer,
        &Frame::PastEvents {
            events: cursor.next_batch(),
        },
    )?;
    while !stop.is_set() {
        if peer_closed(&mut peer) {
            return Ok(());
        }
        for event in cursor.wait_batch(TAIL_POLL) {
            write_frame(&mut writer, &Frame::Event { event })?;
        }
    }
    Ok(())
}

/// Subscribers never send; a zero-length read or a hard error means the peer is gone.
/// Anything it does send is discarded.
fn peer_closed(peer: &mut TcpStream) -> bool {
    let mut scratch = [0u8; 64];
    match peer.read(&mut scratch) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) => !matches!(
            e.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
        ),
    }
}

/// Client side of the event stream.
pub struct EventSubscriber {
    reader: BufReader<TcpStream>,
}

impl EventSubscriber {
    /// Connect to a running [`EventServer`].
    pub fn connect(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Ok(Self {
            reader: BufReader::new(stream),
        })
    }

    /// Bound every subsequent read; `None` blocks indefinitely.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.reader.get_ref().set_read_timeout(timeout)
    }

    /// Block for the next frame.
    pub fn next_frame(&mut self) -> io::Result<Frame> {
        read_frame(&mut self.reader)
    }

    /// Read the history frame sent on connect.
    pub fn history(&mut self) -> io::Result<Vec<Event>> {
        match self.next_frame()? {
            Frame::PastEvents { events } => Ok(events),
            Frame::Event { .. } => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "expected past events frame",
            )),
        }
    }

    /// Read the next live event.
    pub fn next_event(&mut self) -> io::Result<Event> {
        match self.next_frame()? {
            Frame::Event { event } => Ok(event),
            Frame::PastEvents { .. } => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected past events frame",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_wire_shape() {
        let mut buf = Vec::new();
        let frame = Frame::Event {
            event: Event::new("TICK", json!({"n": 1})),
        };
        write_frame(&mut buf, &frame).unwrap();

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);
        let body: serde_json::Value = serde_json::from_slice(&buf[4..]).unwrap();
        assert_eq!(body["kind"], "event");
        assert_eq!(body["event"]["event_type"], "TICK");

        assert_eq!(read_frame(&mut buf.as_slice()).unwrap(), frame);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = (MAX_FRAME_LEN + 1).to_be_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        let err = read_frame(&mut buf.as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let buf = 10u32.to_be_bytes().to_vec();
        assert!(read_frame(&mut buf.as_slice()).is_err());
    }
}
