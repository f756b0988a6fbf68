//! Integration tests for event caching, cursors and the TCP event stream.

use automat::controller::{ControllerParts, RunResult};
use automat::event::{
    Event, EventCachingProcess, EventQueue, EventServer, EventSubscriber, Frame,
    EVENT_CACHING_ERROR,
};
use automat::Controller;
use serde_json::json;
use serial_test::serial;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn numbers(events: &[Event]) -> Vec<u64> {
    events
        .iter()
        .map(|e| e.content["n"].as_u64().unwrap())
        .collect()
}

#[test]
fn test_cursors_are_gap_free_with_interleaved_appends() {
    let queue = EventQueue::new();
    let caching = EventCachingProcess::new(queue.clone());
    caching.start().unwrap();

    let mut early = caching.cursor();
    let mut seen_early = Vec::new();
    let mut seen_late = Vec::new();
    let mut late = None;

    for n in 0..60u64 {
        queue.push(Event::new("SAMPLE", json!({ "n": n })));
        if n % 7 == 0 {
            seen_early.extend(early.next_batch());
        }
        if n == 20 {
            late = Some(caching.cursor());
        }
        if n % 11 == 0 {
            if let Some(cursor) = late.as_mut() {
                seen_late.extend(cursor.next_batch());
            }
        }
    }
    assert!(wait_until(|| caching.cache().len() == 60));
    seen_early.extend(early.next_batch());
    if let Some(cursor) = late.as_mut() {
        seen_late.extend(cursor.next_batch());
    }

    let expected: Vec<u64> = (0..60).collect();
    assert_eq!(numbers(&seen_early), expected);
    assert_eq!(numbers(&seen_late), expected);
    caching.shutdown();
}

#[test]
fn test_controller_events_keep_submission_order() {
    let queue = EventQueue::new();
    let caching = EventCachingProcess::new(queue.clone());
    caching.start().unwrap();

    let ctl = Controller::new(ControllerParts::new("counter", "test"), |ctl: &Controller| -> RunResult {
        for n in 0..25 {
            ctl.send_event("COUNT", json!({ "n": n }))?;
        }
        Ok(())
    });
    ctl.thread_init(Some(queue), None, None).unwrap();
    ctl.start().unwrap();
    ctl.join().unwrap();
    caching.shutdown();

    assert_eq!(numbers(&caching.cache().snapshot()), (0..25).collect::<Vec<_>>());
}

#[test]
fn test_callback_failure_becomes_error_event() {
    let queue = EventQueue::new();
    let caching = EventCachingProcess::with_callback(queue.clone(), |event: Event| {
        if event.event_type == "BAD" {
            anyhow::bail!("cannot persist {}", event.event_type);
        }
        Ok(event)
    });
    caching.start().unwrap();
    queue.push(Event::new("GOOD", json!({ "n": 1 })));
    queue.push(Event::new("BAD", json!({ "n": 2 })));
    queue.push(Event::new("GOOD", json!({ "n": 3 })));
    caching.shutdown();

    let types: Vec<String> = caching
        .cache()
        .snapshot()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(types, vec!["GOOD", EVENT_CACHING_ERROR, "GOOD"]);
}

#[test]
#[serial]
fn test_server_replays_history_then_tails() {
    let queue = EventQueue::new();
    let caching = Arc::new(EventCachingProcess::new(queue.clone()));
    caching.start().unwrap();
    for n in 0..3u64 {
        queue.push(Event::new("PAST", json!({ "n": n })));
    }
    assert!(wait_until(|| caching.cache().len() == 3));

    let server = EventServer::bind("127.0.0.1:0", Arc::clone(&caching)).unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let mut subscriber = EventSubscriber::connect(addr).unwrap();
    subscriber.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let history = subscriber.history().unwrap();
    assert_eq!(numbers(&history), vec![0, 1, 2]);

    for n in 3..6u64 {
        queue.push(Event::new("LIVE", json!({ "n": n })));
    }
    let live: Vec<Event> = (0..3).map(|_| subscriber.next_event().unwrap()).collect();
    assert_eq!(numbers(&live), vec![3, 4, 5]);
    assert!(live.iter().all(|e| e.event_type == "LIVE"));

    let mut late = EventSubscriber::connect(addr).unwrap();
    late.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    match late.next_frame().unwrap() {
        Frame::PastEvents { events } => assert_eq!(numbers(&events), vec![0, 1, 2, 3, 4, 5]),
        other => panic!("expected history first, got {other:?}"),
    }

    server.shutdown();
    caching.shutdown();
}

#[test]
#[serial]
fn test_server_limits_concurrent_connections() {
    let caching = Arc::new(EventCachingProcess::new(EventQueue::new()));
    caching.start().unwrap();
    let server = EventServer::bind("127.0.0.1:0", Arc::clone(&caching)).unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let mut clients = Vec::new();
    for _ in 0..automat::event::server::MAX_CONNECTIONS {
        let mut client = EventSubscriber::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.history().unwrap();
        clients.push(client);
    }
    assert!(wait_until(|| server.active_connections() == automat::event::server::MAX_CONNECTIONS));

    let mut extra = EventSubscriber::connect(addr).unwrap();
    extra.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    assert!(extra.next_frame().is_err());

    drop(clients);
    server.shutdown();
    caching.shutdown();
}

#[test]
#[serial]
fn test_disconnected_subscribers_free_their_slots() {
    let caching = Arc::new(EventCachingProcess::new(EventQueue::new()));
    caching.start().unwrap();
    let server = EventServer::bind("127.0.0.1:0", Arc::clone(&caching)).unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    for _ in 0..automat::event::server::MAX_CONNECTIONS {
        let mut client = EventSubscriber::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.history().unwrap();
    }
    // No events are pushed: only the closed sockets can release the slots.
    assert!(wait_until(|| server.active_connections() == 0));

    let mut next = EventSubscriber::connect(addr).unwrap();
    next.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    assert!(next.history().unwrap().is_empty());

    server.shutdown();
    caching.shutdown();
}

#[test]
#[serial]
fn test_stalled_subscriber_does_not_block_shutdown() {
    let queue = EventQueue::new();
    let caching = Arc::new(EventCachingProcess::new(queue.clone()));
    caching.start().unwrap();
    let server = EventServer::bind("127.0.0.1:0", Arc::clone(&caching)).unwrap();
    server.start().unwrap();

    // Connected but never reading, so the socket buffers fill up.
    let stalled = std::net::TcpStream::connect(server.local_addr().unwrap()).unwrap();
    assert!(wait_until(|| server.active_connections() == 1));
    let payload = "x".repeat(8 * 1024);
    for n in 0..5000u64 {
        queue.push(Event::new("BULK", json!({ "n": n, "payload": payload })));
    }

    let started = Instant::now();
    let deadline = started + Duration::from_secs(30);
    while server.active_connections() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(server.active_connections(), 0);
    server.shutdown();
    assert!(started.elapsed() < Duration::from_secs(30));

    drop(stalled);
    caching.shutdown();
}
