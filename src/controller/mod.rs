//! Controllers: threaded automation logic over devices and sub-controllers.
//!
//! A [`Controller`] pairs user logic ([`ControlLogic`]) with the devices and
//! sub-controllers it drives, and tracks a lifecycle over [`ControllerMode`]s. The
//! whole tree shares one [`EventQueue`] and one pair of stop/abort [`Signal`]s, handed
//! down by [`Controller::thread_init`].
//!
//! ## Lifecycle
//!
//! ```text
//! new ──► thread_init ──► initialize_devices ──► start / run ──► join
//!             ▲                                                   │
//!             └──────────── thread_reset ◄── thread_shutdown ◄────┘
//! ```
//!
//! Every operation checks its required modes first and fails with a
//! [`ControllerError`] when they are missing. Stop and abort are cooperative: the
//! logic observes them at [`Controller::check_stop`], [`Controller::check_abort`] and
//! [`Controller::abort_breakout_point`].

pub mod builtin;
mod mode;
mod signal;

pub use builtin::{Heartbeat, NullLogic};
pub use mode::{ControllerMode, ModeSet};
pub use signal::Signal;

use crate::device::DeviceRef;
use crate::error::{AutomatError, AutomatResult, ConfigurationError, ControllerError};
use crate::event::{Event, EventQueue};
use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use ControllerMode::{
    DevicesInitialized, DevicesShutdown, ObjectInitialized, RunningAsBlockingCall,
    RunningAsThread, ThreadInitialized, ThreadShutdown,
};

const READY: ModeSet = ModeSet::of(&[ThreadInitialized, DevicesInitialized]);
const RUNNING: ModeSet = ModeSet::of(&[RunningAsThread, RunningAsBlockingCall]);

/// Why a controller's main routine ended early.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The abort signal was observed at a breakout point.
    #[error("aborted")]
    Aborted,

    /// A checkpoint was used outside a running mode.
    #[error(transparent)]
    Controller(#[from] ControllerError),

    /// The routine failed.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl From<AutomatError> for RunError {
    fn from(err: AutomatError) -> Self {
        match err {
            AutomatError::Controller(e) => RunError::Controller(e),
            other => RunError::Failed(other.into()),
        }
    }
}

/// Return type of [`ControlLogic::main`].
pub type RunResult = Result<(), RunError>;

/// The automation routine of a controller.
pub trait ControlLogic: Send + Sync + 'static {
    /// Run until done, stopped or aborted. `ctl` gives access to devices, events and checkpoints.
    fn main(&self, ctl: &Controller) -> RunResult;
}

impl<F> ControlLogic for F
where
    F: Fn(&Controller) -> RunResult + Send + Sync + 'static,
{
    fn main(&self, ctl: &Controller) -> RunResult {
        self(ctl)
    }
}

/// How a finished main routine ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The routine returned `Ok`.
    Finished,
    /// The routine observed the abort signal.
    Aborted,
    /// The routine returned an error, rendered with its causes.
    Failed(String),
    /// The routine panicked; holds the panic message.
    Panicked(String),
}

/// Everything a controller is built from. Handed to controller factories.
#[derive(Debug, Clone, Default)]
pub struct ControllerParts {
    /// Handle from the configuration.
    pub handle: String,
    /// Module the controller was built from.
    pub module: String,
    /// Devices by slot name.
    pub devices: BTreeMap<String, DeviceRef>,
    /// Sub-controllers by slot name.
    pub controllers: BTreeMap<String, Controller>,
    /// Module defaults overridden by the `configuration` table.
    pub configuration: Map<String, Value>,
    /// Module defaults overridden by the `metadata` table.
    pub metadata: Map<String, Value>,
    /// Keys of the controller section not claimed by any of the above.
    pub extra: Map<String, Value>,
}

impl ControllerParts {
    /// Parts with no devices, sub-controllers or settings.
    pub fn new(handle: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            module: module.into(),
            ..Self::default()
        }
    }

    /// Deserialize a configuration value.
    pub fn config<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        config_value(&self.configuration, &self.handle, key)
    }
}

fn config_value<T: DeserializeOwned>(
    configuration: &Map<String, Value>,
    handle: &str,
    key: &str,
) -> anyhow::Result<T> {
    let value = configuration
        .get(key)
        .with_context(|| format!("controller '{handle}' has no configuration value '{key}'"))?;
    serde_json::from_value(value.clone())
        .with_context(|| format!("invalid configuration value '{key}' for controller '{handle}'"))
}

/// Shared handle to a controller. Clones refer to the same controller.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

struct Inner {
    handle: String,
    module: String,
    logic: Arc<dyn ControlLogic>,
    devices: RwLock<BTreeMap<String, DeviceRef>>,
    controllers: RwLock<BTreeMap<String, Controller>>,
    configuration: RwLock<Map<String, Value>>,
    metadata: RwLock<Map<String, Value>>,
    context: RwLock<Map<String, Value>>,
    extra: Map<String, Value>,
    state: Mutex<ThreadState>,
}

#[derive(Default)]
struct ThreadState {
    modes: ModeSet,
    queue: Option<EventQueue>,
    stop: Option<Signal>,
    abort: Option<Signal>,
    worker: Option<JoinHandle<Completion>>,
    completion: Option<Completion>,
}

impl Controller {
    /// Build a controller in `ObjectInitialized` mode.
    pub fn new(parts: ControllerParts, logic: impl ControlLogic) -> Self {
        Self::with_logic(parts, Arc::new(logic))
    }

    /// Like [`new`](Self::new) with already shared logic.
    pub fn with_logic(parts: ControllerParts, logic: Arc<dyn ControlLogic>) -> Self {
        let state = ThreadState {
            modes: ModeSet::from(ObjectInitialized),
            ..ThreadState::default()
        };
        Self {
            inner: Arc::new(Inner {
                handle: parts.handle,
                module: parts.module,
                logic,
                devices: RwLock::new(parts.devices),
                controllers: RwLock::new(parts.controllers),
                configuration: RwLock::new(parts.configuration),
                metadata: RwLock::new(parts.metadata),
                context: RwLock::new(Map::new()),
                extra: parts.extra,
                state: Mutex::new(state),
            }),
        }
    }

    /// Placeholder that does nothing when run. Fills declared but unconfigured
    /// controller slots.
    pub fn null(handle: impl Into<String>) -> Self {
        Self::new(ControllerParts::new(handle, "null"), NullLogic)
    }

    /// Handle from the configuration.
    pub fn handle(&self) -> &str {
        &self.inner.handle
    }

    /// Module the controller was built from.
    pub fn module(&self) -> &str {
        &self.inner.module
    }

    /// Current lifecycle modes.
    pub fn modes(&self) -> ModeSet {
        self.inner.state.lock().modes
    }

    /// Whether a thread started by [`start`](Self::start) is still executing.
    pub fn is_alive(&self) -> bool {
        self.inner
            .state
            .lock()
            .worker
            .as_ref()
            .is_some_and(|w| !w.is_finished())
    }

    /// Outcome of the last completed run, if any.
    pub fn completion(&self) -> Option<Completion> {
        self.inner.state.lock().completion.clone()
    }

    /// True when both handles refer to the same controller.
    pub fn same_as(&self, other: &Controller) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ---- lifecycle ----

    /// Attach the event queue and signals, cascading the same objects to every
    /// sub-controller. Missing arguments are created fresh.
    pub fn thread_init(
        &self,
        queue: Option<EventQueue>,
        stop: Option<Signal>,
        abort: Option<Signal>,
    ) -> Result<(), ControllerError> {
        self.require_all(ObjectInitialized.into(), "thread_init")?;
        let queue = queue.unwrap_or_default();
        let stop = stop.unwrap_or_default();
        let abort = abort.unwrap_or_default();
        {
            let mut state = self.inner.state.lock();
            state.queue = Some(queue.clone());
            state.stop = Some(stop.clone());
            state.abort = Some(abort.clone());
        }
        for sub in self.sub_controllers() {
            sub.thread_init(Some(queue.clone()), Some(stop.clone()), Some(abort.clone()))?;
        }
        let mut state = self.inner.state.lock();
        state.modes.remove(ThreadShutdown);
        state.modes.insert(ThreadInitialized);
        debug!(controller = %self, "thread initialized");
        Ok(())
    }

    /// Stop and join the running thread (if any), then cascade.
    ///
    /// Blocks until the main routine returns; logic that ignores the stop signal must
    /// be aborted first.
    pub fn thread_shutdown(&self) {
        let (stop, worker) = {
            let mut state = self.inner.state.lock();
            (state.stop.clone(), state.worker.take())
        };
        if let Some(worker) = worker {
            if let Some(stop) = stop {
                stop.set();
            }
            let completion = join_worker(self.handle(), worker);
            self.inner.state.lock().completion = Some(completion);
        }
        for sub in self.sub_controllers() {
            sub.thread_shutdown();
        }
        let mut state = self.inner.state.lock();
        state.modes.remove(RunningAsThread);
        state.modes.remove(RunningAsBlockingCall);
        state.modes.remove(ThreadInitialized);
        state.modes.insert(ThreadShutdown);
        debug!(controller = %self, "thread shut down");
    }

    /// Shut the thread down and re-initialize it with the same queue and signals.
    /// Both signals are cleared so the next run starts fresh.
    pub fn thread_reset(&self) -> Result<(), ControllerError> {
        self.thread_shutdown();
        let (queue, stop, abort) = {
            let state = self.inner.state.lock();
            (state.queue.clone(), state.stop.clone(), state.abort.clone())
        };
        for signal in [&stop, &abort].into_iter().flatten() {
            signal.clear();
        }
        self.thread_init(queue, stop, abort)
    }

    /// Initialize own devices, then cascade. A failure leaves earlier devices
    /// initialized; call [`shutdown_devices`](Self::shutdown_devices) to clean up.
    pub fn initialize_devices(&self) -> AutomatResult<()> {
        for device in self.devices().values() {
            device.initialize()?;
        }
        for sub in self.sub_controllers() {
            sub.initialize_devices()?;
        }
        let mut state = self.inner.state.lock();
        state.modes.remove(DevicesShutdown);
        state.modes.insert(DevicesInitialized);
        info!(controller = %self, "devices initialized");
        Ok(())
    }

    /// Shut down own devices, then cascade. Every device is attempted; the first
    /// failure is returned.
    pub fn shutdown_devices(&self) -> AutomatResult<()> {
        let mut first_error = None;
        for device in self.devices().values() {
            if let Err(e) = device.shutdown() {
                warn!(controller = %self, device = device.handle(), error = %e, "device shutdown failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        for sub in self.sub_controllers() {
            if let Err(e) = sub.shutdown_devices() {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        let mut state = self.inner.state.lock();
        state.modes.remove(DevicesInitialized);
        state.modes.insert(DevicesShutdown);
        info!(controller = %self, "devices shut down");
        Ok(())
    }

    /// Run the main routine on a new thread.
    ///
    /// Devices and the thread are initialized first when needed. Errors raised by the
    /// main routine never surface here; see [`join`](Self::join).
    pub fn start(&self) -> AutomatResult<()> {
        let modes = self.modes();
        if !modes.contains(DevicesInitialized) {
            self.initialize_devices()?;
        }
        if !modes.contains(ThreadInitialized) {
            self.thread_init(None, None, None)?;
        }
        self.require_all(READY, "start")?;

        let mut state = self.inner.state.lock();
        if state.worker.is_some() || state.modes.intersects(RUNNING) {
            return Err(self
                .error(READY, state.modes, "already started, call thread_reset() first")
                .into());
        }
        let this = self.clone();
        let worker = std::thread::Builder::new()
            .name(self.inner.handle.clone())
            .spawn(move || this.execute())?;
        state.modes.insert(RunningAsThread);
        state.completion = None;
        state.worker = Some(worker);
        Ok(())
    }

    /// Run the main routine on the calling thread and return how it ended.
    ///
    /// A lifecycle violation raised inside the routine is returned as an error.
    pub fn run(&self) -> Result<Completion, ControllerError> {
        {
            let mut state = self.inner.state.lock();
            if !state.modes.contains_all(READY) {
                return Err(self.error(READY, state.modes, "run requires an initialized thread and devices"));
            }
            if state.modes.intersects(RUNNING) {
                return Err(self.error(READY, state.modes, "already running"));
            }
            state.modes.insert(RunningAsBlockingCall);
            state.completion = None;
        }
        let outcome = self.inner.logic.main(self);
        let completion = match outcome {
            Err(RunError::Controller(e)) => {
                self.inner.state.lock().modes.remove(RunningAsBlockingCall);
                return Err(e);
            }
            other => self.completion_of(other),
        };
        let mut state = self.inner.state.lock();
        state.modes.remove(RunningAsBlockingCall);
        state.completion = Some(completion.clone());
        Ok(completion)
    }

    /// Wait for the thread started by [`start`](Self::start). Returns the completion
    /// of the last run, or `None` if nothing ran yet.
    pub fn join(&self) -> Result<Option<Completion>, ControllerError> {
        self.require_all(ThreadInitialized.into(), "join")?;
        let worker = self.inner.state.lock().worker.take();
        if let Some(worker) = worker {
            let completion = join_worker(self.handle(), worker);
            self.inner.state.lock().completion = Some(completion);
        }
        Ok(self.completion())
    }

    /// Request a cooperative stop. Non-blocking.
    pub fn stop(&self) {
        match self.inner.state.lock().stop.as_ref() {
            Some(signal) => signal.set(),
            None => debug!(controller = %self, "stop requested before thread_init"),
        }
    }

    /// Request an abort. Non-blocking.
    pub fn abort(&self) {
        match self.inner.state.lock().abort.as_ref() {
            Some(signal) => signal.set(),
            None => debug!(controller = %self, "abort requested before thread_init"),
        }
    }

    /// [`thread_shutdown`](Self::thread_shutdown) then
    /// [`shutdown_devices`](Self::shutdown_devices).
    pub fn shutdown(&self) -> AutomatResult<()> {
        self.thread_shutdown();
        self.shutdown_devices()
    }

    /// Shut everything down and bring it back to a startable state.
    pub fn reset(&self) -> AutomatResult<()> {
        self.shutdown()?;
        self.thread_reset()?;
        self.initialize_devices()
    }

    // ---- inside the main routine ----

    /// Push an event onto the shared queue.
    pub fn send_event(&self, event_type: &str, content: Value) -> Result<(), ControllerError> {
        let queue = {
            let state = self.inner.state.lock();
            match (&state.queue, state.modes.contains(ThreadInitialized)) {
                (Some(queue), true) => queue.clone(),
                _ => {
                    return Err(self.error(
                        ThreadInitialized.into(),
                        state.modes,
                        "send_event requires an initialized thread",
                    ))
                }
            }
        };
        queue.push(Event::new(event_type, content));
        Ok(())
    }

    /// Whether stop was requested. Only valid while running.
    pub fn check_stop(&self) -> Result<bool, ControllerError> {
        let state = self.require_running("check_stop")?;
        Ok(state.0.is_some_and(|s| s.is_set()))
    }

    /// Whether abort was requested. Only valid while running.
    pub fn check_abort(&self) -> Result<bool, ControllerError> {
        let state = self.require_running("check_abort")?;
        Ok(state.1.is_some_and(|s| s.is_set()))
    }

    /// Return [`RunError::Aborted`] when an abort was requested.
    pub fn abort_breakout_point(&self) -> RunResult {
        if self.check_abort()? {
            info!(controller = %self, "abort observed");
            return Err(RunError::Aborted);
        }
        Ok(())
    }

    /// Sleep for `duration`, waking early on abort. Returns whether an abort was
    /// requested.
    pub fn sleep(&self, duration: Duration) -> bool {
        let abort = self.inner.state.lock().abort.clone();
        match abort {
            Some(signal) => signal.wait_timeout(duration),
            None => {
                std::thread::sleep(duration);
                false
            }
        }
    }

    // ---- accessors ----

    /// Devices by slot name.
    pub fn devices(&self) -> BTreeMap<String, DeviceRef> {
        self.inner.devices.read().clone()
    }

    /// The device in slot `role`.
    pub fn device(&self, role: &str) -> Option<DeviceRef> {
        self.inner.devices.read().get(role).cloned()
    }

    /// Replace devices in existing slots. Unknown slot names are rejected.
    pub fn set_devices(&self, devices: BTreeMap<String, DeviceRef>) -> Result<(), ConfigurationError> {
        let mut current = self.inner.devices.write();
        check_slots(current.keys(), devices.keys(), "devices", self.handle())?;
        current.extend(devices);
        Ok(())
    }

    /// Sub-controllers by slot name.
    pub fn controllers(&self) -> BTreeMap<String, Controller> {
        self.inner.controllers.read().clone()
    }

    /// The sub-controller in slot `role`.
    pub fn controller(&self, role: &str) -> Option<Controller> {
        self.inner.controllers.read().get(role).cloned()
    }

    /// Replace sub-controllers in existing slots. Unknown slot names are rejected.
    pub fn set_controllers(
        &self,
        controllers: BTreeMap<String, Controller>,
    ) -> Result<(), ConfigurationError> {
        let mut current = self.inner.controllers.write();
        check_slots(current.keys(), controllers.keys(), "controllers", self.handle())?;
        current.extend(controllers);
        Ok(())
    }

    /// Snapshot of the configuration values.
    pub fn configuration(&self) -> Map<String, Value> {
        self.inner.configuration.read().clone()
    }

    /// Deserialize one configuration value.
    pub fn config<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        config_value(&self.inner.configuration.read(), self.handle(), key)
    }

    /// Update configuration values. Keys not already present are rejected unless
    /// `ignore_extra_fields` is set, in which case they are dropped.
    pub fn set_configuration(
        &self,
        values: Map<String, Value>,
        ignore_extra_fields: bool,
    ) -> Result<(), ConfigurationError> {
        let mut current = self.inner.configuration.write();
        if !ignore_extra_fields {
            check_slots(current.keys(), values.keys(), "configuration", self.handle())?;
        }
        for (key, value) in values {
            if let Some(slot) = current.get_mut(&key) {
                *slot = value;
            }
        }
        Ok(())
    }

    /// Snapshot of the metadata.
    pub fn metadata(&self) -> Map<String, Value> {
        self.inner.metadata.read().clone()
    }

    /// Merge `values` into the metadata.
    pub fn update_metadata(&self, values: Map<String, Value>) {
        self.inner.metadata.write().extend(values);
    }

    /// Merge caller-supplied runtime context.
    pub fn load_context(&self, values: Map<String, Value>) {
        self.inner.context.write().extend(values);
    }

    /// Values stored with [`load_context`](Self::load_context).
    pub fn context(&self) -> Map<String, Value> {
        self.inner.context.read().clone()
    }

    /// Section keys not claimed by the registry.
    pub fn extra(&self) -> &Map<String, Value> {
        &self.inner.extra
    }

    /// The queue set by `thread_init`.
    pub fn event_queue(&self) -> Option<EventQueue> {
        self.inner.state.lock().queue.clone()
    }

    /// The stop signal set by `thread_init`.
    pub fn stop_signal(&self) -> Option<Signal> {
        self.inner.state.lock().stop.clone()
    }

    /// The abort signal set by `thread_init`.
    pub fn abort_signal(&self) -> Option<Signal> {
        self.inner.state.lock().abort.clone()
    }

    // ---- internals ----

    fn sub_controllers(&self) -> Vec<Controller> {
        self.inner.controllers.read().values().cloned().collect()
    }

    fn execute(&self) -> Completion {
        info!(controller = %self, "main routine started");
        let outcome = self.inner.logic.main(self);
        self.completion_of(outcome)
    }

    fn completion_of(&self, outcome: RunResult) -> Completion {
        let completion = match outcome {
            Ok(()) => Completion::Finished,
            Err(RunError::Aborted) => Completion::Aborted,
            Err(RunError::Failed(e)) => {
                error!(controller = %self, error = %format!("{e:#}"), "main routine failed");
                Completion::Failed(format!("{e:#}"))
            }
            Err(RunError::Controller(e)) => {
                error!(controller = %self, error = %e, "main routine violated the lifecycle");
                Completion::Failed(e.to_string())
            }
        };
        info!(controller = %self, ?completion, "main routine ended");
        completion
    }

    fn require_all(&self, required: ModeSet, action: &str) -> Result<(), ControllerError> {
        let current = self.modes();
        if current.contains_all(required) {
            Ok(())
        } else {
            Err(self.error(required, current, &format!("{action} requires modes {required}")))
        }
    }

    fn require_running(
        &self,
        action: &str,
    ) -> Result<(Option<Signal>, Option<Signal>), ControllerError> {
        let state = self.inner.state.lock();
        if !state.modes.intersects(RUNNING) {
            return Err(self.error(
                RUNNING,
                state.modes,
                &format!("{action} requires one of the running modes"),
            ));
        }
        Ok((state.stop.clone(), state.abort.clone()))
    }

    fn error(&self, required: ModeSet, current: ModeSet, message: &str) -> ControllerError {
        ControllerError {
            controller: self.inner.handle.clone(),
            required,
            current,
            message: message.to_string(),
        }
    }
}

fn check_slots<'a>(
    known: impl Iterator<Item = &'a String>,
    requested: impl Iterator<Item = &'a String>,
    section: &str,
    handle: &str,
) -> Result<(), ConfigurationError> {
    let known: Vec<&String> = known.collect();
    for key in requested {
        if !known.contains(&key) {
            return Err(ConfigurationError::new(format!(
                "controller '{handle}' has no {section} slot '{key}'"
            ))
            .with_key(section)
            .with_value(key.clone()));
        }
    }
    Ok(())
}

fn join_worker(handle: &str, worker: JoinHandle<Completion>) -> Completion {
    match worker.join() {
        Ok(completion) => completion,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(controller = handle, panic = %message, "controller thread panicked");
            Completion::Panicked(message)
        }
    }
}

impl fmt::Display for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Controller: {} ({})>", self.inner.handle, self.inner.module)
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("handle", &self.inner.handle)
            .field("module", &self.inner.module)
            .field("modes", &self.modes())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ready(ctl: &Controller) {
        ctl.thread_init(None, None, None).unwrap();
        ctl.initialize_devices().unwrap();
    }

    #[test]
    fn new_controller_is_object_initialized_only() {
        let ctl = Controller::null("idle");
        assert_eq!(ctl.modes(), ModeSet::from(ObjectInitialized));
        assert_eq!(ctl.to_string(), "<Controller: idle (null)>");
    }

    #[test]
    fn send_event_requires_thread_init() {
        let ctl = Controller::null("idle");
        let err = ctl.send_event("X", Value::Null).unwrap_err();
        assert!(err.required.contains(ThreadInitialized));
        assert_eq!(err.controller, "idle");
        assert!(err.to_string().contains("controller 'idle'"));

        ctl.thread_init(None, None, None).unwrap();
        ctl.send_event("X", json!({"a": 1})).unwrap();
        assert_eq!(ctl.event_queue().unwrap().try_pop().unwrap().event_type, "X");
    }

    #[test]
    fn checkpoints_outside_main_are_rejected() {
        let ctl = Controller::null("idle");
        ready(&ctl);
        assert!(ctl.check_stop().is_err());
        assert!(ctl.check_abort().is_err());
        assert!(matches!(ctl.abort_breakout_point(), Err(RunError::Controller(_))));
    }

    #[test]
    fn run_requires_ready_modes() {
        let ctl = Controller::null("idle");
        ctl.thread_init(None, None, None).unwrap();
        assert!(ctl.run().is_err());
        ctl.initialize_devices().unwrap();
        assert_eq!(ctl.run().unwrap(), Completion::Finished);
        assert!(!ctl.modes().contains(RunningAsBlockingCall));
    }

    #[test]
    fn failure_in_main_is_reported_by_join() {
        let ctl = Controller::new(ControllerParts::new("broken", "test"), |_: &Controller| -> RunResult {
            Err(anyhow::anyhow!("sensor saturated").into())
        });
        ctl.start().unwrap();
        match ctl.join().unwrap() {
            Some(Completion::Failed(msg)) => assert!(msg.contains("sensor saturated")),
            other => panic!("unexpected completion: {other:?}"),
        }
    }

    #[test]
    fn second_start_without_reset_fails() {
        let ctl = Controller::null("once");
        ctl.start().unwrap();
        ctl.join().unwrap();
        assert!(ctl.start().is_err());

        ctl.thread_reset().unwrap();
        ctl.start().unwrap();
        assert_eq!(ctl.join().unwrap(), Some(Completion::Finished));
    }

    #[test]
    fn configuration_updates() {
        let mut parts = ControllerParts::new("scan", "test");
        parts.configuration.insert("steps".into(), json!(10));
        let ctl = Controller::new(parts, NullLogic);

        let mut update = Map::new();
        update.insert("steps".into(), json!(20));
        update.insert("unknown".into(), json!(true));
        assert!(ctl.set_configuration(update.clone(), false).is_err());
        ctl.set_configuration(update, true).unwrap();
        assert_eq!(ctl.config::<u32>("steps").unwrap(), 20);
        assert!(!ctl.configuration().contains_key("unknown"));
        assert!(ctl.config::<u32>("missing").is_err());
    }

    #[test]
    fn unknown_device_slot_is_rejected() {
        let ctl = Controller::null("idle");
        let mut devices = BTreeMap::new();
        devices.insert("laser".to_string(), crate::device::LoadedDevice::null("laser"));
        let err = ctl.set_devices(devices).unwrap_err();
        assert_eq!(err.value.as_deref(), Some("laser"));
    }

    #[test]
    fn panicking_main_is_contained() {
        let ctl = Controller::new(ControllerParts::new("panicky", "test"), |_: &Controller| -> RunResult {
            panic!("boom")
        });
        ctl.start().unwrap();
        assert_eq!(ctl.join().unwrap(), Some(Completion::Panicked("boom".into())));
    }
}
