//! Configuration loading and the composition root.
//!
//! Settings are loaded with figment from a TOML file, then overridden by
//! environment variables prefixed with `AUTOMAT_` (nested keys split on `__`,
//! e.g. `AUTOMAT_DEVICES__PUMP__PORT=COM4`).
//!
//! ```toml
//! log_level = "debug"
//! ignore_device_errors = false
//!
//! [paths]
//! data = "~/automat/data"
//!
//! [devices.controller_board]
//! module = "stub"
//! mutex = { timeout = 5.0 }
//!
//! [devices.pump]
//! module = "stub"
//! subdevices = { board = "controller_board" }
//!
//! [controllers.dosing]
//! module = "heartbeat"
//! devices = { pump = "pump" }
//! configuration = { interval_ms = 500 }
//! ```
//!
//! [`Configuration`] ties the parsed [`Settings`] to a module table, a mutex
//! registry and the device/controller registries that build instances on demand.

pub mod dependencies;

use crate::controller::Controller;
use crate::device::DeviceRef;
use crate::error::{AutomatResult, ConfigurationError};
use crate::mutex::MutexRegistry;
use crate::registry::{ControllerRegistry, DeviceRegistry, Modules};
use chrono::{DateTime, Utc};
use dependencies::DependencyGraph;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Prefix of environment variables merged over the configuration file.
pub const ENV_PREFIX: &str = "AUTOMAT_";

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Directory for mutex lock files; a per-user directory when unset
    pub lock_dir: Option<PathBuf>,
    /// Keep loading when a device fails to build
    pub ignore_device_errors: bool,
    /// Named directories created on load
    pub paths: BTreeMap<String, PathBuf>,
    /// Device sections by handle
    pub devices: BTreeMap<String, Map<String, Value>>,
    /// Controller sections by handle
    pub controllers: BTreeMap<String, Map<String, Value>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            lock_dir: None,
            ignore_device_errors: false,
            paths: BTreeMap::new(),
            devices: BTreeMap::new(),
            controllers: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Load from a TOML file merged with `AUTOMAT_` environment variables.
    pub fn load<P: AsRef<Path>>(path: P) -> AutomatResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigurationError::new("configuration file not found")
                .with_key("path")
                .with_value(path.display().to_string())
                .into());
        }
        Ok(Self::figment(Toml::file(path)).extract()?)
    }

    /// Load from TOML text, with the same environment overrides as [`Settings::load`].
    pub fn from_toml_str(text: &str) -> AutomatResult<Self> {
        Ok(Self::figment(Toml::string(text)).extract()?)
    }

    fn figment(source: figment::providers::Data<Toml>) -> Figment {
        Figment::new()
            .merge(source)
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }
}

/// Facts about the host recorded when a configuration is loaded.
#[derive(Debug, Clone, Serialize)]
pub struct SystemParams {
    /// `<os>-<arch>`.
    pub platform: String,
    /// Login name, or `unknown`.
    pub user: String,
    /// Host name, or `unknown`.
    pub hostname: String,
    /// Canonical path of the loaded file; `None` for in-memory settings.
    pub config_filepath: Option<PathBuf>,
    /// When the configuration was loaded.
    pub loaded_at: DateTime<Utc>,
}

impl SystemParams {
    fn collect(config_filepath: Option<PathBuf>) -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            user,
            hostname,
            config_filepath,
            loaded_at: Utc::now(),
        }
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Composition root: settings, module table, mutexes and the two registries.
pub struct Configuration {
    settings: Settings,
    system: SystemParams,
    paths: BTreeMap<String, PathBuf>,
    modules: Arc<Modules>,
    mutexes: Arc<MutexRegistry>,
    devices: DeviceRegistry,
    controllers: ControllerRegistry,
}

impl Configuration {
    /// Load `path` and build a configuration over `modules`.
    pub fn load<P: AsRef<Path>>(path: P, modules: Modules) -> AutomatResult<Self> {
        let path = path.as_ref();
        let settings = Settings::load(path)?;
        let filepath = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        Self::from_settings(settings, Some(filepath), modules)
    }

    /// Build a configuration from already parsed settings. Creates the `[paths]`
    /// directories.
    pub fn from_settings(
        settings: Settings,
        config_filepath: Option<PathBuf>,
        modules: Modules,
    ) -> AutomatResult<Self> {
        let paths = setup_paths(&settings.paths)?;
        let lock_dir = settings
            .lock_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(MutexRegistry::default_lock_dir);
        let modules = Arc::new(modules);
        let mutexes = Arc::new(MutexRegistry::new(lock_dir));
        let devices = DeviceRegistry::new(
            settings.devices.clone(),
            Arc::clone(&modules),
            Arc::clone(&mutexes),
        );
        let controllers = ControllerRegistry::new(settings.controllers.clone(), Arc::clone(&modules));
        let system = SystemParams::collect(config_filepath);

        info!(
            devices = settings.devices.len(),
            controllers = settings.controllers.len(),
            host = %system.hostname,
            "configuration loaded"
        );
        Ok(Self {
            settings,
            system,
            paths,
            modules,
            mutexes,
            devices,
            controllers,
        })
    }

    /// The parsed settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Host facts recorded at load time.
    pub fn system(&self) -> &SystemParams {
        &self.system
    }

    /// Expanded `[paths]` entries.
    pub fn paths(&self) -> &BTreeMap<String, PathBuf> {
        &self.paths
    }

    /// One expanded `[paths]` entry.
    pub fn path(&self, name: &str) -> Option<&Path> {
        self.paths.get(name).map(PathBuf::as_path)
    }

    /// Registered device and controller modules.
    pub fn modules(&self) -> &Arc<Modules> {
        &self.modules
    }

    /// The mutex registry every device mutex is built from.
    pub fn mutexes(&self) -> &Arc<MutexRegistry> {
        &self.mutexes
    }

    /// Device registry, for inspecting loaded devices.
    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    /// Controller registry, for inspecting loaded controllers.
    pub fn controllers(&self) -> &ControllerRegistry {
        &self.controllers
    }

    /// Resolve a device handle or alias, building it on first use.
    pub fn load_device(&mut self, handle: &str) -> AutomatResult<DeviceRef> {
        self.devices.resolve(handle, None)
    }

    /// Load a device with settings merged over its section. Overrides only apply
    /// if the device has not been built yet.
    pub fn load_device_with(
        &mut self,
        handle: &str,
        overrides: &Map<String, Value>,
    ) -> AutomatResult<DeviceRef> {
        self.devices.resolve(handle, Some(overrides))
    }

    /// Resolve a controller handle with its devices and sub-controllers.
    pub fn load_controller(&mut self, handle: &str) -> AutomatResult<Controller> {
        self.controllers.resolve(handle, &mut self.devices)
    }

    /// Edges of every subdevice, device slot and sub-controller slot, with nodes
    /// named `devices.<handle>` and `controllers.<handle>`.
    pub fn dependency_graph(&self) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for (handle, section) in &self.settings.devices {
            let node = device_node(handle);
            graph.add_node(&node);
            for (role, target) in handle_refs(section, "subdevices") {
                graph.add_dependency(&node, &role, &device_node(&target));
            }
        }
        for (handle, section) in &self.settings.controllers {
            let node = controller_node(handle);
            graph.add_node(&node);
            for (role, target) in handle_refs(section, "devices") {
                graph.add_dependency(&node, &role, &device_node(&target));
            }
            for (role, target) in handle_refs(section, "controllers") {
                graph.add_dependency(&node, &role, &controller_node(&target));
            }
        }
        graph
    }

    /// Check modules and references without building anything.
    ///
    /// Fails on the first section naming an unknown module, a reference to an
    /// undeclared handle, or a dependency cycle.
    pub fn validate(&self) -> AutomatResult<()> {
        for (handle, section) in &self.settings.devices {
            let module = section_module(section, "device", handle)?;
            if self.modules.device(module).is_none() {
                return Err(unknown_module("device", handle, module).into());
            }
        }
        for (handle, section) in &self.settings.controllers {
            let module = section_module(section, "controller", handle)?;
            if self.modules.controller(module).is_none() {
                return Err(unknown_module("controller", handle, module).into());
            }
        }

        let aliases: Vec<&str> = self
            .settings
            .devices
            .values()
            .filter_map(|section| section.get("alias").and_then(Value::as_str))
            .collect();
        let graph = self.dependency_graph();
        for node in graph.nodes() {
            let known = match node.split_once('.') {
                Some(("devices", handle)) => {
                    self.settings.devices.contains_key(handle) || aliases.contains(&handle)
                }
                Some(("controllers", handle)) => self.settings.controllers.contains_key(handle),
                _ => false,
            };
            if !known {
                let users: Vec<String> = graph
                    .get_dependents(node)
                    .into_iter()
                    .map(|(dependent, role)| format!("{dependent} ({role})"))
                    .collect();
                return Err(ConfigurationError::new(format!(
                    "'{node}' is referenced by {} but not declared",
                    users.join(", ")
                ))
                .with_value(node)
                .into());
            }
        }

        if let Some(cycle) = graph.find_cycle() {
            return Err(ConfigurationError::new(format!(
                "dependency cycle detected: {}",
                cycle.join(" -> ")
            ))
            .into());
        }
        debug!(nodes = graph.nodes().len(), "configuration validated");
        Ok(())
    }
}

fn device_node(handle: &str) -> String {
    format!("devices.{handle}")
}

fn controller_node(handle: &str) -> String {
    format!("controllers.{handle}")
}

/// `role -> handle` pairs of a reference table; non-string entries are skipped.
fn handle_refs(section: &Map<String, Value>, key: &str) -> Vec<(String, String)> {
    section
        .get(key)
        .and_then(Value::as_object)
        .map(|table| {
            table
                .iter()
                .filter_map(|(role, target)| {
                    target.as_str().map(|t| (role.clone(), t.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn section_module<'a>(
    section: &'a Map<String, Value>,
    kind: &str,
    handle: &str,
) -> Result<&'a str, ConfigurationError> {
    section.get("module").and_then(Value::as_str).ok_or_else(|| {
        ConfigurationError::new(format!("{kind} '{handle}' does not name a module"))
            .with_key("module")
    })
}

fn unknown_module(kind: &str, handle: &str, module: &str) -> ConfigurationError {
    ConfigurationError::new(format!("{kind} '{handle}' refers to unknown module '{module}'"))
        .with_key("module")
        .with_value(module)
}

fn setup_paths(paths: &BTreeMap<String, PathBuf>) -> AutomatResult<BTreeMap<String, PathBuf>> {
    let mut expanded = BTreeMap::new();
    for (name, path) in paths {
        let path = expand_home(path);
        std::fs::create_dir_all(&path).map_err(|e| {
            ConfigurationError::new(format!("could not create path '{name}': {e}"))
                .with_key(format!("paths.{name}"))
                .with_value(path.display().to_string())
        })?;
        let path = path.canonicalize()?;
        debug!(name = %name, path = %path.display(), "path ready");
        expanded.insert(name.clone(), path);
    }
    Ok(expanded)
}
