//! # automat
//!
//! Core of a laboratory automation system. Devices (instrument drivers) and
//! controllers (threaded automation logic) are declared in a configuration file,
//! built on demand by registries, and wired together into controller trees that
//! share one event queue and one pair of stop/abort signals.
//!
//! ## Crate Structure
//!
//! - **`error`**: `AutomatError` and the typed errors of each layer, exit codes and
//!   crash dumps.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`config`**: figment-backed `Settings`, the `Configuration` composition root and
//!   the dependency graph used to validate it.
//! - **`mutex`**: cross-process named mutexes over lock files.
//! - **`device`**: the `Device` trait and the shared `LoadedDevice` wrapper.
//! - **`registry`**: module tables and the device/controller registries.
//! - **`controller`**: the `Controller` lifecycle state machine and built-in logic.
//! - **`event`**: event queue, cache, caching thread and the TCP event stream.
//! - **`command`**: declarative instrument command sets and a driver-side interface.
//! - **`app`**: the `Application` driver that loads and tears down a configuration.

pub mod app;
pub mod command;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod event;
pub mod logging;
pub mod mutex;
pub mod registry;

pub use app::Application;
pub use config::{Configuration, Settings};
pub use controller::{Controller, ControllerParts};
pub use device::{Device, DeviceRef};
pub use error::{AutomatError, AutomatResult};
