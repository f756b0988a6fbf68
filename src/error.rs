//! Error types for the automation core.
//!
//! This module defines `AutomatError`, the top-level error for the crate, and the
//! typed errors each layer raises. Using `thiserror`, every layer error converts
//! into `AutomatError` through `#[from]`, so callers can propagate with `?`.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**: a malformed or missing section/key, an unknown handle, or a
//!   dependency cycle. Fatal, never retried.
//! - **`Device`**: a device factory or initialization failure. Carries the handle, a
//!   snapshot of the settings it was built from, and the underlying cause.
//! - **`Controller`**: a lifecycle precondition violation. Always a programming error.
//! - **`ControllerLoad`**: a controller factory failed; carries the handle and module.
//! - **`Command`**: a value out of range or a wire string failing its own regex. Fatal to
//!   that one invocation only.
//! - **`MutexTimeout`**: a named mutex could not be acquired in time. Retryable.
//! - **`Io`** / **`Figment`**: wrapped lower-level failures.
//!
//! Each category maps to its own process exit status (see [`AutomatError::exit_code`])
//! so top-level drivers can report failures distinctly.

use crate::controller::ModeSet;
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default crash dump file written by top-level drivers on fatal errors.
pub const CRASHDUMP_FILENAME: &str = ".crash_dump.txt~";

/// Convenience alias for results using the crate error type.
pub type AutomatResult<T> = std::result::Result<T, AutomatError>;

/// Every failure the crate reports, grouped by category.
#[derive(Error, Debug)]
pub enum AutomatError {
    /// Invalid or missing configuration.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// A device failed to build or initialize.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// A controller method was called in the wrong mode.
    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error("Failed to load controller '{handle}' from module '{module}': {source:#}")]
    /// A controller factory failed.
    ControllerLoad {
        /// Controller handle.
        handle: String,
        /// Module the factory was registered under.
        module: String,
        /// Error returned by the factory.
        #[source]
        source: anyhow::Error,
    },

    /// A protocol command could not be built or parsed.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// A device mutex was not acquired in time.
    #[error(transparent)]
    MutexTimeout(#[from] MutexTimeoutError),

    /// I/O failure outside any device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file could not be read or merged.
    #[error("Configuration loading error: {0}")]
    Figment(#[from] figment::Error),
}

impl AutomatError {
    /// Process exit status for this error category.
    pub fn exit_code(&self) -> i32 {
        match self {
            AutomatError::Configuration(_) | AutomatError::Figment(_) => 2,
            AutomatError::Device(_) | AutomatError::ControllerLoad { .. } => 3,
            AutomatError::Controller(_) => 4,
            AutomatError::Command(_) => 5,
            AutomatError::MutexTimeout(_) => 6,
            AutomatError::Io(_) => 1,
        }
    }

    /// Whether the caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AutomatError::MutexTimeout(_))
    }
}

/// Malformed or missing configuration.
#[derive(Error, Debug, Clone)]
#[error("Configuration error: {message}{}", describe_key(.key, .value))]
pub struct ConfigurationError {
    /// What is wrong.
    pub message: String,
    /// Dotted key of the offending entry.
    pub key: Option<String>,
    /// Offending value, as written.
    pub value: Option<String>,
}

fn describe_key(key: &Option<String>, value: &Option<String>) -> String {
    let mut out = String::new();
    if let Some(key) = key {
        let _ = write!(out, " (key: '{key}'");
        if let Some(value) = value {
            let _ = write!(out, ", value: {value}");
        }
        out.push(')');
    }
    out
}

impl ConfigurationError {
    /// An error with a message only.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            key: None,
            value: None,
        }
    }

    /// Attach the offending key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Attach the offending value.
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// A device could not be constructed or initialized.
#[derive(Error, Debug)]
#[error("Device error: {message} (device handle: '{handle}', settings: {settings})")]
pub struct DeviceError {
    /// What failed.
    pub message: String,
    /// Device handle.
    pub handle: String,
    /// Settings the device was built with.
    pub settings: serde_json::Value,
    /// Underlying cause.
    #[source]
    pub source: anyhow::Error,
}

/// A controller method was called without its required lifecycle modes.
#[derive(Error, Debug, Clone)]
#[error("Controller error: controller '{controller}': {message} (required: {required}, current: {current})")]
pub struct ControllerError {
    /// Handle of the controller.
    pub controller: String,
    /// Modes the method needs.
    pub required: ModeSet,
    /// Modes the controller was in.
    pub current: ModeSet,
    /// What was attempted.
    pub message: String,
}

/// Failures while building or parsing ASCII protocol commands.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    /// A set value fell outside `set_range`.
    #[error("command '{cmd}': value {value} is out of range [{min}, {max}]")]
    OutOfRange {
        /// Command code.
        cmd: String,
        /// Rejected value.
        value: f64,
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },

    /// A ranged command was given a non-numeric value.
    #[error("command '{cmd}': value '{value}' is not numeric but the command declares a range")]
    NotNumeric {
        /// Command code.
        cmd: String,
        /// Rejected value.
        value: String,
    },

    /// The formatted command failed `set_regex`.
    #[error("command '{cmd}': the command string '{output}' does not match the 'set_regex': r'{pattern}'")]
    RegexMismatch {
        /// Command code.
        cmd: String,
        /// Formatted command string.
        output: String,
        /// The `set_regex` pattern.
        pattern: String,
    },

    /// The command has no query form.
    #[error("command '{0}' cannot be queried")]
    NoQuery(String),

    /// `reset` on a command without `reset_val`.
    #[error("command '{0}' has no 'reset_val'")]
    NoReset(String),

    /// Lookup found nothing.
    #[error("no command with code or name '{0}'")]
    UnknownCommand(String),

    /// Two commands share a code.
    #[error("a command with code '{0}' already exists in the set")]
    Duplicate(String),

    /// A reply could not be converted to the declared type.
    #[error("could not convert '{value}' to {target}")]
    Conversion {
        /// Input text.
        value: String,
        /// Target type name.
        target: String,
    },

    /// A `set_regex` or `resp_regex` did not compile.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The pattern as written.
        pattern: String,
        /// Compiler message.
        reason: String,
    },

    /// A malformed command entry.
    #[error("command specification error: {0}")]
    Spec(String),

    /// The link failed during an exchange.
    #[error("exchange with device failed: {0}")]
    Exchange(String),
}

/// Acquiring a named mutex exceeded its timeout.
#[derive(Error, Debug, Clone)]
#[error("acquiring the mutex lock '{name}' has timed-out in {elapsed:?}")]
pub struct MutexTimeoutError {
    /// Mutex name.
    pub name: String,
    /// Time spent waiting.
    pub elapsed: Duration,
}

/// Write the error and its full source chain to a crash dump file.
pub fn write_crash_dump(path: &Path, error: &anyhow::Error) -> std::io::Result<()> {
    let mut dump = String::new();
    let _ = writeln!(dump, "A fatal error has occurred at {}", chrono::Local::now());
    let _ = writeln!(dump, "{error}");
    for (depth, cause) in error.chain().skip(1).enumerate() {
        let _ = writeln!(dump, "    {}: {cause}", depth + 1);
    }
    let _ = writeln!(dump, "\n{error:?}");
    std::fs::write(path, dump)
}
