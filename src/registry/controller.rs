//! Resolution of controller handles into controller trees.

use super::device::DeviceRegistry;
use super::modules::Modules;
use super::take_key;
use crate::controller::{Controller, ControllerParts};
use crate::device::LoadedDevice;
use crate::error::{AutomatError, AutomatResult, ConfigurationError};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Builds each configured controller at most once, resolving its devices through a
/// [`DeviceRegistry`] and its sub-controllers recursively.
pub struct ControllerRegistry {
    sections: BTreeMap<String, Map<String, Value>>,
    modules: Arc<Modules>,
    cache: BTreeMap<String, Controller>,
    resolving: Vec<String>,
}

impl ControllerRegistry {
    /// Registry over the `[controllers]` sections.
    pub fn new(sections: BTreeMap<String, Map<String, Value>>, modules: Arc<Modules>) -> Self {
        Self {
            sections,
            modules,
            cache: BTreeMap::new(),
            resolving: Vec::new(),
        }
    }

    /// Declared handles in key order.
    pub fn declared(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    /// Raw section of `handle`.
    pub fn section(&self, handle: &str) -> Option<&Map<String, Value>> {
        self.sections.get(handle)
    }

    /// The controller, if already resolved.
    pub fn get(&self, handle: &str) -> Option<Controller> {
        self.cache.get(handle).cloned()
    }

    /// Every resolved controller.
    pub fn loaded(&self) -> Vec<Controller> {
        self.cache.values().cloned().collect()
    }

    /// Build `handle` with its devices and sub-controllers, reusing cached instances.
    /// Cycles between sub-controllers are reported as configuration errors.
    pub fn resolve(&mut self, handle: &str, devices: &mut DeviceRegistry) -> AutomatResult<Controller> {
        if let Some(controller) = self.cache.get(handle) {
            debug!(controller = handle, "using cached controller");
            return Ok(controller.clone());
        }
        if self.resolving.iter().any(|h| h == handle) {
            let mut path = self.resolving.clone();
            path.push(handle.to_string());
            return Err(ConfigurationError::new(format!(
                "sub-controller cycle detected: {}",
                path.join(" -> ")
            ))
            .with_key("controllers")
            .with_value(handle)
            .into());
        }

        self.resolving.push(handle.to_string());
        let result = self.build(handle, devices);
        self.resolving.pop();
        let controller = result?;

        self.cache.insert(handle.to_string(), controller.clone());
        Ok(controller)
    }

    fn build(&mut self, handle: &str, devices: &mut DeviceRegistry) -> AutomatResult<Controller> {
        let mut settings = self.sections.get(handle).cloned().ok_or_else(|| {
            ConfigurationError::new(format!(
                "the controller with handle '{handle}' has not been specified in the 'controllers' section"
            ))
            .with_key("controllers")
            .with_value(handle)
        })?;
        let owner = format!("controller '{handle}'");

        let module: String = take_key(&mut settings, "module", &owner)?.ok_or_else(|| {
            ConfigurationError::new(format!("controller '{handle}' does not name a module"))
                .with_key("module")
        })?;
        let device_handles: BTreeMap<String, String> =
            take_key(&mut settings, "devices", &owner)?.unwrap_or_default();
        let controller_handles: BTreeMap<String, String> =
            take_key(&mut settings, "controllers", &owner)?.unwrap_or_default();
        let configuration: Map<String, Value> =
            take_key(&mut settings, "configuration", &owner)?.unwrap_or_default();
        let metadata: Map<String, Value> =
            take_key(&mut settings, "metadata", &owner)?.unwrap_or_default();

        let controller_module = self.modules.controller(&module).cloned().ok_or_else(|| {
            ConfigurationError::new(format!(
                "controller '{handle}' refers to unknown module '{module}'"
            ))
            .with_key("module")
            .with_value(module.clone())
        })?;

        let mut parts = ControllerParts::new(handle, &module);
        for slot in &controller_module.default_devices {
            parts.devices.insert(slot.clone(), LoadedDevice::null(slot));
        }
        for (role, device_handle) in &device_handles {
            parts
                .devices
                .insert(role.clone(), devices.resolve(device_handle, None)?);
        }
        for slot in &controller_module.default_controllers {
            parts.controllers.insert(slot.clone(), Controller::null(slot.clone()));
        }
        for (role, sub_handle) in &controller_handles {
            let sub = self.resolve(sub_handle, devices)?;
            parts.controllers.insert(role.clone(), sub);
        }
        parts.configuration = merged(&controller_module.default_configuration, configuration);
        parts.metadata = merged(&controller_module.default_metadata, metadata);
        parts.extra = settings;

        let controller = (controller_module.factory)(parts).map_err(|source| {
            AutomatError::ControllerLoad {
                handle: handle.to_string(),
                module: module.clone(),
                source,
            }
        })?;
        info!(controller = handle, module = %module, "controller loaded");
        Ok(controller)
    }
}

fn merged(defaults: &Map<String, Value>, configured: Map<String, Value>) -> Map<String, Value> {
    let mut out = defaults.clone();
    out.extend(configured);
    out
}
