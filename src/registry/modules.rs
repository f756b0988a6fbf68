//! Named factories for device and controller modules.
//!
//! Configuration sections refer to implementations by module name. A [`Modules`]
//! table maps those names to factories; applications register their own drivers and
//! controller logic next to the built-ins.

use crate::controller::{Controller, ControllerParts, Heartbeat, NullLogic};
use crate::device::{BoxedDevice, DeviceSettings, NullDevice, StubDevice};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builds a device from its settings.
pub type DeviceFactory = Arc<dyn Fn(DeviceSettings) -> anyhow::Result<BoxedDevice> + Send + Sync>;

/// Builds a controller from its parts.
pub type ControllerFactory = Arc<dyn Fn(ControllerParts) -> anyhow::Result<Controller> + Send + Sync>;

/// A controller implementation plus the defaults it declares.
///
/// Declared device and controller slots missing from the configuration are filled
/// with null placeholders. Declared configuration and metadata values are overridden
/// by configured ones.
#[derive(Clone)]
pub struct ControllerModule {
    /// Constructor.
    pub factory: ControllerFactory,
    /// Device slots filled with null devices when not configured.
    pub default_devices: Vec<String>,
    /// Controller slots filled with null controllers when not configured.
    pub default_controllers: Vec<String>,
    /// Base of the `configuration` table.
    pub default_configuration: Map<String, Value>,
    /// Base of the `metadata` table.
    pub default_metadata: Map<String, Value>,
}

impl ControllerModule {
    /// Module with no defaults.
    pub fn new(
        factory: impl Fn(ControllerParts) -> anyhow::Result<Controller> + Send + Sync + 'static,
    ) -> Self {
        Self {
            factory: Arc::new(factory),
            default_devices: Vec::new(),
            default_controllers: Vec::new(),
            default_configuration: Map::new(),
            default_metadata: Map::new(),
        }
    }

    /// Declare default device slots.
    pub fn with_default_devices<I, S>(mut self, slots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_devices = slots.into_iter().map(Into::into).collect();
        self
    }

    /// Declare default controller slots.
    pub fn with_default_controllers<I, S>(mut self, slots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_controllers = slots.into_iter().map(Into::into).collect();
        self
    }

    /// `defaults` must be a JSON object; anything else is ignored.
    pub fn with_default_configuration(mut self, defaults: Value) -> Self {
        if let Value::Object(map) = defaults {
            self.default_configuration = map;
        }
        self
    }

    /// `defaults` must be a JSON object; anything else is ignored.
    pub fn with_default_metadata(mut self, defaults: Value) -> Self {
        if let Value::Object(map) = defaults {
            self.default_metadata = map;
        }
        self
    }
}

impl std::fmt::Debug for ControllerModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerModule")
            .field("default_devices", &self.default_devices)
            .field("default_controllers", &self.default_controllers)
            .field("default_configuration", &self.default_configuration)
            .field("default_metadata", &self.default_metadata)
            .finish_non_exhaustive()
    }
}

/// Table of known modules.
#[derive(Default, Clone)]
pub struct Modules {
    devices: BTreeMap<String, DeviceFactory>,
    controllers: BTreeMap<String, ControllerModule>,
}

impl Modules {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in modules: devices `stub` and `null`, controllers `null` and `heartbeat`.
    pub fn with_builtins() -> Self {
        let mut modules = Self::new();
        modules.register_device("null", |_| Ok(BoxedDevice::new(NullDevice)));
        modules.register_device("stub", |settings| {
            Ok(BoxedDevice::new(StubDevice::from_settings(&settings)?))
        });
        modules.register_controller(
            "null",
            ControllerModule::new(|parts| Ok(Controller::new(parts, NullLogic))),
        );
        modules.register_controller(
            "heartbeat",
            ControllerModule::new(|parts| {
                let logic = Heartbeat::from_parts(&parts)?;
                Ok(Controller::new(parts, logic))
            })
            .with_default_configuration(serde_json::json!({
                "interval_ms": Heartbeat::DEFAULT_INTERVAL_MS,
            })),
        );
        modules
    }

    /// Register (or replace) a device module.
    pub fn register_device(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(DeviceSettings) -> anyhow::Result<BoxedDevice> + Send + Sync + 'static,
    ) -> &mut Self {
        self.devices.insert(name.into(), Arc::new(factory));
        self
    }

    /// Register (or replace) a controller module.
    pub fn register_controller(
        &mut self,
        name: impl Into<String>,
        module: ControllerModule,
    ) -> &mut Self {
        self.controllers.insert(name.into(), module);
        self
    }

    /// Device factory registered as `name`.
    pub fn device(&self, name: &str) -> Option<&DeviceFactory> {
        self.devices.get(name)
    }

    /// Controller module registered as `name`.
    pub fn controller(&self, name: &str) -> Option<&ControllerModule> {
        self.controllers.get(name)
    }

    /// Registered device module names, sorted.
    pub fn device_modules(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    /// Registered controller module names, sorted.
    pub fn controller_modules(&self) -> impl Iterator<Item = &str> {
        self.controllers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for Modules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Modules")
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .field("controllers", &self.controllers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let modules = Modules::with_builtins();
        assert_eq!(modules.device_modules().collect::<Vec<_>>(), vec!["null", "stub"]);
        assert_eq!(
            modules.controller_modules().collect::<Vec<_>>(),
            vec!["heartbeat", "null"]
        );
        let heartbeat = modules.controller("heartbeat").unwrap();
        assert_eq!(heartbeat.default_configuration["interval_ms"], 1000);
    }

    #[test]
    fn registering_replaces() {
        let mut modules = Modules::with_builtins();
        modules.register_device("stub", |_| anyhow::bail!("replaced"));
        let factory = modules.device("stub").unwrap();
        let settings = DeviceSettings {
            handle: "x".into(),
            module: "stub".into(),
            params: Map::new(),
            subdevices: BTreeMap::new(),
        };
        assert!(factory(settings).is_err());
    }
}
