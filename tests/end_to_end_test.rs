//! End-to-end: configuration file to running controller to event subscriber.

use automat::controller::{Completion, ControllerMode, Heartbeat, NullLogic};
use automat::device::StubDevice;
use automat::event::{EventCachingProcess, EventQueue, EventServer, EventSubscriber};
use automat::registry::{ControllerModule, Modules};
use automat::{Application, Configuration, Controller};
use serde_json::json;
use serial_test::serial;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

const BENCH: &str = r#"
log_level = "debug"

[devices.controller_board]
module = "stub"
name = "board"

[devices.pump]
module = "stub"
name = "pump"
subdevices = { board = "controller_board" }

[controllers.monitor]
module = "heartbeat"
devices = { pump = "pump" }
configuration = { interval_ms = 10 }
metadata = { operator = "test" }
note = "free-form"

[controllers.supervisor]
module = "supervisor"
controllers = { monitor = "monitor" }
"#;

fn write_config(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
    let locks = dir.path().join("locks");
    let data = dir.path().join("data");
    let path = dir.path().join("bench.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "lock_dir = {:?}", locks.display().to_string()).unwrap();
    file.write_all(body.as_bytes()).unwrap();
    writeln!(file, "\n[paths]\ndata = {:?}", data.display().to_string()).unwrap();
    path
}

fn modules() -> Modules {
    let mut modules = Modules::with_builtins();
    modules.register_controller(
        "supervisor",
        ControllerModule::new(|parts| Ok(Controller::new(parts, NullLogic)))
            .with_default_devices(["laser"])
            .with_default_controllers(["backup"])
            .with_default_configuration(json!({ "retries": 3, "mode": "auto" })),
    );
    modules
}

#[test]
fn test_pump_resolves_board_first() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, BENCH);
    let mut config = Configuration::load(&path, modules()).unwrap();
    config.validate().unwrap();

    assert!(dir.path().join("data").is_dir());
    assert_eq!(
        config.system().config_filepath.as_deref(),
        Some(path.canonicalize().unwrap().as_path())
    );

    let pump = config.load_device("pump").unwrap();
    assert!(config.devices().is_loaded("controller_board"));
    let board = config.load_device("controller_board").unwrap();
    assert_eq!(board.downcast::<StubDevice>().unwrap().name(), "board");
    assert_eq!(pump.settings()["subdevices"]["board"], "controller_board");
}

#[test]
fn test_controller_tree_from_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Configuration::load(write_config(&dir, BENCH), modules()).unwrap();

    let supervisor = config.load_controller("supervisor").unwrap();
    let monitor = config.load_controller("monitor").unwrap();
    assert!(supervisor.controller("monitor").unwrap().same_as(&monitor));
    assert_eq!(supervisor.controller("backup").unwrap().module(), "null");
    assert!(supervisor.device("laser").unwrap().is_null());
    assert_eq!(supervisor.configuration()["retries"], 3);

    assert_eq!(monitor.configuration()["interval_ms"], 10);
    assert_eq!(monitor.metadata()["operator"], "test");
    assert_eq!(monitor.extra()["note"], "free-form");
    assert!(Arc::ptr_eq(
        &monitor.device("pump").unwrap(),
        &config.load_device("pump").unwrap()
    ));
}

#[test]
#[serial]
fn test_heartbeat_streams_to_subscriber() {
    let dir = tempfile::tempdir().unwrap();
    let config = Configuration::load(write_config(&dir, BENCH), modules()).unwrap();
    let mut app = Application::new(config);
    app.load_all().unwrap();
    let monitor = app.controller("monitor").unwrap().clone();

    let queue = EventQueue::new();
    let caching = Arc::new(EventCachingProcess::new(queue.clone()));
    caching.start().unwrap();
    let server = EventServer::bind("127.0.0.1:0", Arc::clone(&caching)).unwrap();
    server.start().unwrap();

    monitor.thread_init(Some(queue), None, None).unwrap();
    monitor.start().unwrap();

    let mut subscriber = EventSubscriber::connect(server.local_addr().unwrap()).unwrap();
    subscriber.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut counts: Vec<u64> = subscriber
        .history()
        .unwrap()
        .iter()
        .map(|e| e.content["count"].as_u64().unwrap())
        .collect();
    while counts.len() < 5 {
        let event = subscriber.next_event().unwrap();
        assert_eq!(event.event_type, Heartbeat::EVENT_TYPE);
        assert_eq!(event.content["controller"], "monitor");
        counts.push(event.content["count"].as_u64().unwrap());
    }
    assert_eq!(counts[..5], [0, 1, 2, 3, 4]);

    monitor.stop();
    assert_eq!(monitor.join().unwrap(), Some(Completion::Finished));
    server.shutdown();
    caching.shutdown();
    app.shutdown_all().unwrap();
    assert!(monitor.modes().contains(ControllerMode::ThreadShutdown));

    let pump = app.configuration().devices().get("pump").unwrap();
    let pump = pump.downcast::<StubDevice>().unwrap();
    assert_eq!(pump.initialize_count(), 1);
    assert_eq!(pump.shutdown_count(), 1);
}

#[test]
fn test_broken_reference_fails_validation_with_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let config = Configuration::load(
        write_config(&dir, "[devices.pump]\nmodule = \"stub\"\nsubdevices = { board = \"nowhere\" }\n"),
        Modules::with_builtins(),
    )
    .unwrap();
    let err = config.validate().unwrap_err();
    assert_eq!(err.exit_code(), 2);
    assert!(err.to_string().contains("devices.nowhere"));
}
