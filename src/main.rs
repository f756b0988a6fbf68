//! CLI entry point for automat.
//!
//! ```bash
//! # load, validate and build everything a configuration declares
//! automat check config/lab.toml
//!
//! # run one controller on its thread and stream its events over TCP
//! automat serve config/lab.toml heartbeat --port 5050
//!
//! # list a command set, or decode a wire string against it
//! automat commands config/commands/syringe_pump.yaml
//! automat commands config/commands/syringe_pump.yaml "SP15"
//! ```

use automat::command::{CommandSet, MatchKind};
use automat::config::Configuration;
use automat::controller::Completion;
use automat::error::{write_crash_dump, AutomatError, AutomatResult, CRASHDUMP_FILENAME};
use automat::event::{EventCachingProcess, EventQueue, EventServer};
use automat::logging::{self, LoggingConfig, OutputFormat};
use automat::registry::Modules;
use automat::Application;
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "automat")]
#[command(about = "Laboratory instrument automation", long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Pretty, global = true)]
    log_format: OutputFormat,

    /// Where to write the crash dump on fatal errors
    #[arg(long, default_value = CRASHDUMP_FILENAME, global = true)]
    crash_dump: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a configuration, building every device and controller
    Check {
        config: PathBuf,
    },

    /// Run a controller with an event server attached until stdin closes
    Serve {
        config: PathBuf,

        /// Controller handle to run
        controller: String,

        /// Event server port; 0 picks a free one
        #[arg(long, default_value = "0")]
        port: u16,

        /// Event server bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,

        /// Append every processed event to this JSON-lines file
        #[arg(long)]
        event_log: Option<PathBuf>,
    },

    /// List a command set, or match a wire string against it
    Commands {
        file: PathBuf,

        /// Wire string to match
        string: Option<String>,

        /// Instrument response to decode with the matched query
        #[arg(long)]
        response: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let log_format = cli.log_format;

    let result = match cli.command {
        Commands::Check { config } => check(&config, log_format),
        Commands::Serve {
            config,
            controller,
            port,
            bind,
            event_log,
        } => serve(&config, &controller, &bind, port, event_log.as_deref(), log_format),
        Commands::Commands {
            file,
            string,
            response,
        } => {
            let _ = logging::init(LoggingConfig::default().with_format(log_format));
            commands(&file, string.as_deref(), response.as_deref())
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            let code = e.exit_code();
            error!(error = %e, "fatal error");
            eprintln!("error: {e}");
            let report = anyhow::Error::from(e);
            if let Err(io) = write_crash_dump(&cli.crash_dump, &report) {
                eprintln!("could not write crash dump to {}: {io}", cli.crash_dump.display());
            }
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn load(path: &Path, format: OutputFormat) -> AutomatResult<Configuration> {
    let config = Configuration::load(path, Modules::with_builtins())?;
    logging::init(LoggingConfig::from_settings(config.settings())?.with_format(format))?;
    Ok(config)
}

fn check(path: &Path, format: OutputFormat) -> AutomatResult<ExitCode> {
    let config = load(path, format)?;
    config.validate()?;

    let mut app = Application::new(config);
    app.load_all()?;
    for device in app.configuration().devices().loaded() {
        let (ok, message) = device.test();
        println!(
            "device {:<24} {:<12} {}  {message}",
            device.handle(),
            device.module(),
            if ok { "ok" } else { "FAILED" },
        );
    }
    for controller in app.controllers() {
        println!("controller {:<20} {}", controller.handle(), controller.module());
    }
    for (handle, reason) in app.skipped() {
        println!("skipped {handle:<23} {reason}");
    }
    app.shutdown_all()?;
    Ok(ExitCode::SUCCESS)
}

fn serve(
    path: &Path,
    handle: &str,
    bind: &str,
    port: u16,
    event_log: Option<&Path>,
    format: OutputFormat,
) -> AutomatResult<ExitCode> {
    let mut app = Application::new(load(path, format)?);
    let controller = app.configuration_mut().load_controller(handle)?;

    let queue = EventQueue::new();
    let caching = Arc::new(match event_log {
        Some(path) => EventCachingProcess::with_event_file(queue.clone(), path)?,
        None => EventCachingProcess::new(queue.clone()),
    });
    caching.start()?;
    let server = EventServer::bind((bind, port), Arc::clone(&caching))?;
    server.start()?;
    let addr = server.local_addr()?;
    info!(%addr, controller = handle, "event server listening");
    println!("events on {addr}; close stdin to stop");

    controller.thread_init(Some(queue), None, None)?;
    controller.start()?;

    let stdin_closed = automat::controller::Signal::new();
    {
        let stdin_closed = stdin_closed.clone();
        std::thread::Builder::new()
            .name("stdin".to_string())
            .spawn(move || {
                for line in std::io::stdin().lock().lines() {
                    if line.is_err() {
                        break;
                    }
                }
                stdin_closed.set();
            })?;
    }
    while controller.is_alive() && !stdin_closed.wait_timeout(Duration::from_millis(200)) {}

    controller.stop();
    let completion = controller.join()?;
    controller.shutdown()?;
    server.shutdown();
    caching.shutdown();
    app.shutdown_all()?;

    match completion {
        Some(Completion::Failed(reason)) | Some(Completion::Panicked(reason)) => {
            warn!(controller = handle, %reason, "controller did not finish cleanly");
            eprintln!("controller '{handle}' failed: {reason}");
            Ok(ExitCode::from(4))
        }
        other => {
            info!(controller = handle, completion = ?other, "controller finished");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn commands(file: &Path, string: Option<&str>, response: Option<&str>) -> AutomatResult<ExitCode> {
    let set = CommandSet::from_yaml_file(file)?;
    let Some(string) = string else {
        println!("{} ({} commands)", set.device().name, set.len());
        for command in set.iter() {
            println!("  {command}");
        }
        return Ok(ExitCode::SUCCESS);
    };

    let Some(matched) = set.match_str(string) else {
        println!("no command matches '{string}'");
        return Ok(ExitCode::from(1));
    };
    let value = match matched.kind() {
        MatchKind::Query => matched.parse(response),
        _ => matched.parse(None),
    }
    .map_err(AutomatError::from)?;
    println!(
        "{} ({:?}) value: {}",
        matched.command().cmd(),
        matched.kind(),
        value.map_or_else(|| "-".to_string(), |v| v.to_string())
    );
    Ok(ExitCode::SUCCESS)
}
