//! Logging setup.
//!
//! Structured logging goes through `tracing`; this module installs the global
//! `tracing-subscriber` with an environment filter and one formatting layer.
//! `RUST_LOG` takes precedence over the configured level.
//!
//! # Example
//! ```no_run
//! use automat::config::Settings;
//! use automat::logging::{self, LoggingConfig, OutputFormat};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load("config/lab.toml")?;
//! let config = LoggingConfig::from_settings(&settings)?.with_format(OutputFormat::Json);
//! logging::init(config)?;
//! tracing::info!("logging ready");
//! # Ok(())
//! # }
//! ```

use crate::config::Settings;
use crate::error::ConfigurationError;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer,
};

/// Output format of the formatting layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Multi-line, coloured; for interactive use
    #[default]
    Pretty,
    /// One line per event, no colours
    Compact,
    /// One JSON object per event
    Json,
}

/// Subscriber settings for [`init`].
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Most verbose level emitted.
    pub level: Level,
    /// Output layout.
    pub format: OutputFormat,
    /// Emit span open/close events
    pub with_span_events: bool,
    /// Include source locations.
    pub with_file_and_line: bool,
    /// Controller threads are named after their handle, so names are on by default.
    pub with_thread_names: bool,
    /// Only honoured by [`OutputFormat::Pretty`]
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Pretty output at `level` with thread names.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Level taken from the `log_level` setting.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigurationError> {
        Ok(Self::new(parse_log_level(&settings.log_level)?))
    }

    /// Set the output layout.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Toggle span open/close events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Toggle colour codes.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Install the global subscriber.
///
/// Idempotent: when a subscriber is already installed (another test, an
/// embedding application) this returns `Ok(())` and leaves it in place.
pub fn init(config: LoggingConfig) -> Result<(), ConfigurationError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));
    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_thread_names(config.with_thread_names);
    let result = match config.format {
        OutputFormat::Pretty => tracing_subscriber::registry()
            .with(layer.pretty().with_ansi(config.with_ansi).with_filter(env_filter))
            .try_init(),
        OutputFormat::Compact => tracing_subscriber::registry()
            .with(layer.compact().with_ansi(false).with_filter(env_filter))
            .try_init(),
        OutputFormat::Json => tracing_subscriber::registry()
            .with(layer.json().with_filter(env_filter))
            .try_init(),
    };
    result.or_else(already_installed)
}

fn already_installed(e: TryInitError) -> Result<(), ConfigurationError> {
    if e.to_string().contains("already been set") {
        Ok(())
    } else {
        Err(ConfigurationError::new(format!("failed to initialize logging: {e}")))
    }
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> Result<Level, ConfigurationError> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(ConfigurationError::new(
            "invalid log level; must be one of: trace, debug, info, warn, error",
        )
        .with_key("log_level")
        .with_value(level)),
    }
}
