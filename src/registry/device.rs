//! Resolution of device handles into shared device instances.

use super::modules::Modules;
use super::take_key;
use crate::device::{DeviceRef, DeviceSettings, LoadedDevice};
use crate::error::{AutomatResult, ConfigurationError, DeviceError};
use crate::mutex::{MutexRegistry, NamedMutex, DEFAULT_MUTEX_TIMEOUT};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Keys of a device section interpreted by the registry rather than the driver.
pub const RESERVED_DEVICE_KEYS: [&str; 4] = ["module", "subdevices", "mutex", "alias"];

/// The optional `mutex` block of a device section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MutexSpec {
    /// Defaults to the device handle.
    pub name: Option<String>,
    /// Seconds. Defaults to [`DEFAULT_MUTEX_TIMEOUT`]; negative waits forever.
    pub timeout: Option<f64>,
}

impl MutexSpec {
    /// Timeout as a duration.
    pub fn timeout(&self) -> Option<Duration> {
        match self.timeout {
            None => Some(DEFAULT_MUTEX_TIMEOUT),
            Some(secs) if secs < 0.0 => None,
            Some(secs) => Some(Duration::from_secs_f64(secs)),
        }
    }
}

/// Builds each configured device at most once and hands out shared references.
///
/// A handle resolves to the same [`DeviceRef`] on every call. Subdevices are
/// resolved depth-first before their parent; a handle reappearing on the current
/// resolution path is a cycle and fails with a [`ConfigurationError`].
pub struct DeviceRegistry {
    sections: BTreeMap<String, Map<String, Value>>,
    modules: Arc<Modules>,
    mutexes: Arc<MutexRegistry>,
    cache: BTreeMap<String, DeviceRef>,
    resolving: Vec<String>,
}

impl DeviceRegistry {
    /// Registry over the `[devices]` sections.
    pub fn new(
        sections: BTreeMap<String, Map<String, Value>>,
        modules: Arc<Modules>,
        mutexes: Arc<MutexRegistry>,
    ) -> Self {
        Self {
            sections,
            modules,
            mutexes,
            cache: BTreeMap::new(),
            resolving: Vec::new(),
        }
    }

    /// Handles declared in the `devices` section.
    pub fn declared(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    /// Raw section of `handle`.
    pub fn section(&self, handle: &str) -> Option<&Map<String, Value>> {
        self.sections.get(handle)
    }

    /// Already loaded instance for a handle or alias.
    pub fn get(&self, handle: &str) -> Option<DeviceRef> {
        self.cache.get(handle).cloned()
    }

    /// Whether `handle` was already built, by name or alias.
    pub fn is_loaded(&self, handle: &str) -> bool {
        self.cache.contains_key(handle)
    }

    /// Every loaded instance once, aliases collapsed.
    pub fn loaded(&self) -> Vec<DeviceRef> {
        let mut unique: Vec<DeviceRef> = Vec::new();
        for device in self.cache.values() {
            if !unique.iter().any(|d| Arc::ptr_eq(d, device)) {
                unique.push(Arc::clone(device));
            }
        }
        unique
    }

    /// Resolve `handle`, building it (and its subdevices) on first use.
    ///
    /// `overrides` are merged over the configured settings; `null` values are
    /// ignored. They only take effect when the device is not cached yet.
    pub fn resolve(
        &mut self,
        handle: &str,
        overrides: Option<&Map<String, Value>>,
    ) -> AutomatResult<DeviceRef> {
        if let Some(device) = self.cache.get(handle) {
            debug!(device = handle, "using cached device");
            return Ok(Arc::clone(device));
        }
        if !self.sections.contains_key(handle) {
            if let Some(owner) = self.alias_owner(handle) {
                debug!(alias = handle, device = %owner, "resolving alias through its owner");
                return self.resolve(&owner, overrides);
            }
        }
        if self.resolving.iter().any(|h| h == handle) {
            let mut path = self.resolving.clone();
            path.push(handle.to_string());
            return Err(ConfigurationError::new(format!(
                "subdevice cycle detected: {}",
                path.join(" -> ")
            ))
            .with_key("subdevices")
            .with_value(handle)
            .into());
        }

        self.resolving.push(handle.to_string());
        let result = self.build(handle, overrides);
        self.resolving.pop();
        let device = result?;

        self.cache.insert(handle.to_string(), Arc::clone(&device));
        Ok(device)
    }

    /// Shut down every loaded device once. All are attempted; the first failure is
    /// returned.
    pub fn shutdown_all(&self) -> AutomatResult<()> {
        let mut first_error = None;
        for device in self.loaded() {
            if let Err(e) = device.shutdown() {
                warn!(device = device.handle(), error = %e, "device shutdown failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn build(
        &mut self,
        handle: &str,
        overrides: Option<&Map<String, Value>>,
    ) -> AutomatResult<DeviceRef> {
        let mut settings = self.sections.get(handle).cloned().ok_or_else(|| {
            ConfigurationError::new(format!(
                "the device with handle '{handle}' has not been specified in the 'devices' section"
            ))
            .with_key("devices")
            .with_value(handle)
        })?;
        let owner = format!("device '{handle}'");

        let subdevice_handles: BTreeMap<String, String> =
            take_key(&mut settings, "subdevices", &owner)?.unwrap_or_default();
        let mut subdevices = BTreeMap::new();
        for (role, sub_handle) in &subdevice_handles {
            subdevices.insert(role.clone(), self.resolve(sub_handle, None)?);
        }

        if let Some(overrides) = overrides {
            for (key, value) in overrides {
                if !value.is_null() {
                    settings.insert(key.clone(), value.clone());
                }
            }
        }

        let module: String = take_key(&mut settings, "module", &owner)?.ok_or_else(|| {
            ConfigurationError::new(format!("device '{handle}' does not name a module"))
                .with_key("module")
        })?;
        let mutex_spec: Option<MutexSpec> = take_key(&mut settings, "mutex", &owner)?;
        let alias: Option<String> = take_key(&mut settings, "alias", &owner)?;

        let factory = self.modules.device(&module).cloned().ok_or_else(|| {
            ConfigurationError::new(format!(
                "device '{handle}' refers to unknown module '{module}'"
            ))
            .with_key("module")
            .with_value(module.clone())
        })?;

        let mutex = mutex_spec
            .map(|spec| self.build_mutex(handle, &spec))
            .transpose()?;

        let snapshot = snapshot(&module, &settings, &subdevice_handles);
        let device_settings = DeviceSettings {
            handle: handle.to_string(),
            module: module.clone(),
            params: settings,
            subdevices,
        };
        let boxed = factory(device_settings).map_err(|source| DeviceError {
            message: format!("factory of module '{module}' failed"),
            handle: handle.to_string(),
            settings: snapshot.clone(),
            source,
        })?;

        let device = Arc::new(LoadedDevice::new(handle, &module, snapshot, boxed, mutex));
        info!(device = handle, module = %module, "device loaded");

        if let Some(alias) = alias {
            if let Some(previous) = self.cache.get(&alias) {
                warn!(alias = %alias, previous = previous.handle(), device = handle, "alias rebound");
            }
            self.cache.insert(alias, Arc::clone(&device));
        }
        Ok(device)
    }

    /// Handle of the declared device whose `alias` is `alias`.
    fn alias_owner(&self, alias: &str) -> Option<String> {
        self.sections
            .iter()
            .find(|(_, section)| section.get("alias").and_then(Value::as_str) == Some(alias))
            .map(|(handle, _)| handle.clone())
    }

    fn build_mutex(&self, handle: &str, spec: &MutexSpec) -> AutomatResult<NamedMutex> {
        let name = spec.name.clone().unwrap_or_else(|| handle.to_string());
        debug!(device = handle, mutex = %name, "attaching mutex");
        Ok(self.mutexes.mutex(&name, spec.timeout())?)
    }
}

fn snapshot(module: &str, params: &Map<String, Value>, subdevices: &BTreeMap<String, String>) -> Value {
    let mut map = params.clone();
    map.insert("module".to_string(), Value::String(module.to_string()));
    if !subdevices.is_empty() {
        let subs = subdevices
            .iter()
            .map(|(role, h)| (role.clone(), Value::String(h.clone())))
            .collect();
        map.insert("subdevices".to_string(), Value::Object(subs));
    }
    Value::Object(map)
}
