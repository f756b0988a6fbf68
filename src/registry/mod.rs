//! Lazy, cached construction of devices and controllers from configuration sections.

pub mod controller;
pub mod device;
pub mod modules;

pub use controller::ControllerRegistry;
pub use device::{DeviceRegistry, MutexSpec, RESERVED_DEVICE_KEYS};
pub use modules::{ControllerFactory, ControllerModule, DeviceFactory, Modules};

use crate::error::ConfigurationError;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Remove a reserved key from a section and deserialize it. `null` counts as absent.
pub(crate) fn take_key<T: DeserializeOwned>(
    section: &mut Map<String, Value>,
    key: &str,
    owner: &str,
) -> Result<Option<T>, ConfigurationError> {
    match section.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
            ConfigurationError::new(format!("invalid '{key}' for {owner}: {e}"))
                .with_key(key)
                .with_value(value.to_string())
        }),
    }
}
