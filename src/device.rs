//! Device abstraction and loaded device instances.
//!
//! A device module is a factory that turns a [`DeviceSettings`] into a [`BoxedDevice`].
//! The registry wraps the result in a [`LoadedDevice`] carrying its handle, a settings
//! snapshot and, when configured, the [`NamedMutex`] that serialises access to the
//! hardware. Loaded devices are shared as [`DeviceRef`]s: every consumer of a handle
//! holds the same instance.

use crate::error::{AutomatResult, DeviceError};
use crate::mutex::NamedMutex;
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Shared handle to a loaded device.
pub type DeviceRef = Arc<LoadedDevice>;

/// Behaviour every device driver provides.
///
/// All methods take `&self`; drivers that hold mutable state keep it behind their own
/// interior locks. `initialize` and `shutdown` are expected to be idempotent.
pub trait Device: Send + Sync + 'static {
    /// Short human-readable identification, e.g. model and serial number.
    fn identify(&self) -> String;

    /// Bring the hardware into a usable state.
    fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release the hardware.
    fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Self-test. Returns whether it passed and a description.
    fn test(&self) -> (bool, String) {
        (true, "no self-test implemented".to_string())
    }

    /// Placeholder devices report `true`.
    fn is_null(&self) -> bool {
        false
    }
}

/// Type-erased device as produced by a factory.
///
/// Keeps an `Any` view next to the trait object so controllers can recover the
/// concrete driver type with [`LoadedDevice::downcast`].
#[derive(Clone)]
pub struct BoxedDevice {
    device: Arc<dyn Device>,
    any: Arc<dyn Any + Send + Sync>,
}

impl BoxedDevice {
    /// Wrap a driver.
    pub fn new<D: Device>(device: D) -> Self {
        let shared = Arc::new(device);
        Self {
            device: shared.clone(),
            any: shared,
        }
    }
}

/// Everything a device factory receives.
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    /// Device handle.
    pub handle: String,
    /// Module the factory was registered under.
    pub module: String,
    /// Free-form settings left after the reserved keys were consumed.
    pub params: Map<String, Value>,
    /// Resolved subdevices by role name.
    pub subdevices: BTreeMap<String, DeviceRef>,
}

impl DeviceSettings {
    /// Deserialize an optional setting.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .with_context(|| format!("invalid value for setting '{key}' of device '{}'", self.handle))
                .map(Some),
        }
    }

    /// Deserialize a setting that must be present.
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        self.get(key)?
            .with_context(|| format!("device '{}' requires setting '{key}'", self.handle))
    }

    /// The resolved subdevice for `role`.
    pub fn subdevice(&self, role: &str) -> anyhow::Result<DeviceRef> {
        self.subdevices
            .get(role)
            .cloned()
            .with_context(|| format!("device '{}' requires subdevice '{role}'", self.handle))
    }
}

/// A device instance owned by the registry.
pub struct LoadedDevice {
    handle: String,
    module: String,
    settings: Value,
    inner: BoxedDevice,
    mutex: Option<NamedMutex>,
}

impl LoadedDevice {
    /// Wrap a built device with its handle, settings and optional mutex.
    pub fn new(
        handle: impl Into<String>,
        module: impl Into<String>,
        settings: Value,
        device: BoxedDevice,
        mutex: Option<NamedMutex>,
    ) -> Self {
        Self {
            handle: handle.into(),
            module: module.into(),
            settings,
            inner: device,
            mutex,
        }
    }

    /// Placeholder filling a declared but unconfigured device slot.
    pub fn null(slot: &str) -> DeviceRef {
        Arc::new(Self::new(
            slot,
            "null",
            Value::Object(Map::new()),
            BoxedDevice::new(NullDevice),
            None,
        ))
    }

    /// Device handle.
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Module the device was built from.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Snapshot of the settings the device was built from.
    pub fn settings(&self) -> &Value {
        &self.settings
    }

    /// Named mutex guarding the device, when configured.
    pub fn mutex(&self) -> Option<&NamedMutex> {
        self.mutex.as_ref()
    }

    /// The driver as a trait object.
    pub fn device(&self) -> &dyn Device {
        self.inner.device.as_ref()
    }

    /// The concrete driver, if it is a `D`.
    pub fn downcast<D: Device>(&self) -> Option<&D> {
        self.inner.any.downcast_ref::<D>()
    }

    /// See [`Device::identify`].
    pub fn identify(&self) -> String {
        self.device().identify()
    }

    /// See [`Device::is_null`].
    pub fn is_null(&self) -> bool {
        self.device().is_null()
    }

    /// See [`Device::test`].
    pub fn test(&self) -> (bool, String) {
        self.device().test()
    }

    /// Run `f` while holding the device mutex (if any) with its default timeout.
    ///
    /// # Errors
    ///
    /// `AutomatError::MutexTimeout` when the mutex cannot be acquired in time.
    pub fn exclusive<R>(&self, f: impl FnOnce(&dyn Device) -> R) -> AutomatResult<R> {
        let _guard = match &self.mutex {
            Some(mutex) => Some(mutex.lock(None)?),
            None => None,
        };
        Ok(f(self.device()))
    }

    /// Initialize the driver, wrapping failures in [`DeviceError`].
    pub fn initialize(&self) -> AutomatResult<()> {
        debug!(device = %self.handle, "initializing");
        self.exclusive(|dev| dev.initialize())?
            .map_err(|e| self.error("initialization failed", e))?;
        info!(device = %self.handle, "initialized");
        Ok(())
    }

    /// Shut the driver down, wrapping failures in [`DeviceError`].
    pub fn shutdown(&self) -> AutomatResult<()> {
        debug!(device = %self.handle, "shutting down");
        self.exclusive(|dev| dev.shutdown())?
            .map_err(|e| self.error("shutdown failed", e))?;
        Ok(())
    }

    fn error(&self, message: &str, source: anyhow::Error) -> DeviceError {
        DeviceError {
            message: message.to_string(),
            handle: self.handle.clone(),
            settings: self.settings.clone(),
            source,
        }
    }
}

impl std::fmt::Debug for LoadedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedDevice")
            .field("handle", &self.handle)
            .field("module", &self.module)
            .field("mutex", &self.mutex.as_ref().map(NamedMutex::name))
            .finish_non_exhaustive()
    }
}

/// Inert device used for unconfigured slots and the `null` module.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDevice;

impl Device for NullDevice {
    fn identify(&self) -> String {
        "null device".to_string()
    }

    fn is_null(&self) -> bool {
        true
    }
}

/// In-memory device for dry runs and tests.
///
/// Reports its settings through `identify` and counts lifecycle calls. The
/// `fail_on_create` and `fail_on_initialize` settings make construction or
/// `initialize` fail.
#[derive(Debug)]
pub struct StubDevice {
    name: String,
    fail_on_initialize: bool,
    subdevices: Vec<String>,
    initialized: parking_lot::Mutex<u32>,
    shut_down: parking_lot::Mutex<u32>,
}

impl StubDevice {
    /// Honours `name`, `fail_on_create` and `fail_on_initialize`.
    pub fn from_settings(settings: &DeviceSettings) -> anyhow::Result<Self> {
        if settings.get("fail_on_create")?.unwrap_or(false) {
            anyhow::bail!("stub device '{}' configured to fail on creation", settings.handle);
        }
        Ok(Self {
            name: settings
                .get::<String>("name")?
                .unwrap_or_else(|| settings.handle.clone()),
            fail_on_initialize: settings.get("fail_on_initialize")?.unwrap_or(false),
            subdevices: settings.subdevices.keys().cloned().collect(),
            initialized: parking_lot::Mutex::new(0),
            shut_down: parking_lot::Mutex::new(0),
        })
    }

    /// Configured `name`, defaulting to the handle.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Roles of the subdevices it was built with.
    pub fn subdevice_roles(&self) -> &[String] {
        &self.subdevices
    }

    /// Times `initialize` ran.
    pub fn initialize_count(&self) -> u32 {
        *self.initialized.lock()
    }

    /// Times `shutdown` ran.
    pub fn shutdown_count(&self) -> u32 {
        *self.shut_down.lock()
    }
}

impl Device for StubDevice {
    fn identify(&self) -> String {
        format!("stub device '{}'", self.name)
    }

    fn initialize(&self) -> anyhow::Result<()> {
        if self.fail_on_initialize {
            anyhow::bail!("stub device '{}' configured to fail", self.name);
        }
        *self.initialized.lock() += 1;
        Ok(())
    }

    fn shutdown(&self) -> anyhow::Result<()> {
        *self.shut_down.lock() += 1;
        Ok(())
    }

    fn test(&self) -> (bool, String) {
        (true, format!("stub device '{}' ok", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AutomatError;
    use serde_json::json;

    fn settings(params: Value) -> DeviceSettings {
        DeviceSettings {
            handle: "pump".to_string(),
            module: "stub".to_string(),
            params: params.as_object().cloned().unwrap_or_default(),
            subdevices: BTreeMap::new(),
        }
    }

    #[test]
    fn settings_accessors() {
        let s = settings(json!({"rate": 2.5, "port": null}));
        assert_eq!(s.get::<f64>("rate").unwrap(), Some(2.5));
        assert_eq!(s.get::<String>("port").unwrap(), None);
        assert!(s.require::<String>("port").is_err());
        assert!(s.get::<u32>("rate").is_err());
        assert!(s.subdevice("controller_board").is_err());
    }

    #[test]
    fn downcast_recovers_driver() {
        let stub = StubDevice::from_settings(&settings(json!({"name": "P1"}))).unwrap();
        let loaded = LoadedDevice::new("pump", "stub", json!({}), BoxedDevice::new(stub), None);
        assert_eq!(loaded.downcast::<StubDevice>().unwrap().name(), "P1");
        assert!(loaded.downcast::<NullDevice>().is_none());

        loaded.initialize().unwrap();
        loaded.shutdown().unwrap();
        let stub = loaded.downcast::<StubDevice>().unwrap();
        assert_eq!(stub.initialize_count(), 1);
        assert_eq!(stub.shutdown_count(), 1);
    }

    #[test]
    fn initialize_failure_is_device_error() {
        let stub = StubDevice::from_settings(&settings(json!({"fail_on_initialize": true}))).unwrap();
        let loaded = LoadedDevice::new(
            "pump",
            "stub",
            json!({"fail_on_initialize": true}),
            BoxedDevice::new(stub),
            None,
        );
        match loaded.initialize().unwrap_err() {
            AutomatError::Device(err) => {
                assert_eq!(err.handle, "pump");
                assert_eq!(err.settings["fail_on_initialize"], true);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn null_placeholder() {
        let placeholder = LoadedDevice::null("laser");
        assert!(placeholder.is_null());
        assert_eq!(placeholder.handle(), "laser");
        placeholder.initialize().unwrap();
    }

    #[test]
    fn exclusive_holds_the_mutex() {
        let dir = tempfile::tempdir().unwrap();
        let registry = crate::mutex::MutexRegistry::new(dir.path());
        let mutex = registry.mutex("pump", None).unwrap();
        let loaded = LoadedDevice::new(
            "pump",
            "null",
            json!({}),
            BoxedDevice::new(NullDevice),
            Some(mutex),
        );
        let held = loaded
            .exclusive(|_| loaded.mutex().unwrap().is_held())
            .unwrap();
        assert!(held);
        assert!(!loaded.mutex().unwrap().is_held());
    }
}
