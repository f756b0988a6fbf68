//! Top-level driver: load a whole configuration, then tear it down.
use crate::config::Configuration;
use crate::controller::Controller;
use crate::error::{AutomatError, AutomatResult};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Owns a [`Configuration`] and every controller loaded from it.
pub struct Application {
    config: Configuration,
    controllers: BTreeMap<String, Controller>,
    skipped: Vec<(String, String)>,
}

impl Application {
    /// Wrap a configuration. Nothing is built until [`load_all`](Self::load_all).
    pub fn new(config: Configuration) -> Self {
        Self {
            config,
            controllers: BTreeMap::new(),
            skipped: Vec::new(),
        }
    }

    /// The underlying configuration.
    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    /// Mutable access, for loading more devices or controllers by hand.
    pub fn configuration_mut(&mut self) -> &mut Configuration {
        &mut self.config
    }

    /// Load every declared device, then every declared controller.
    ///
    /// With `ignore_device_errors` set, a device error (including one surfacing
    /// while a controller resolves its devices) is logged and the handle skipped;
    /// any other error stops loading.
    pub fn load_all(&mut self) -> AutomatResult<()> {
        let ignore = self.config.settings().ignore_device_errors;

        let device_handles: Vec<String> = self.config.devices().declared().map(str::to_string).collect();
        for handle in device_handles {
            match self.config.load_device(&handle) {
                Ok(_) => {}
                Err(e) => self.skip_or_fail(ignore, &handle, e)?,
            }
        }

        let controller_handles: Vec<String> =
            self.config.controllers().declared().map(str::to_string).collect();
        for handle in controller_handles {
            match self.config.load_controller(&handle) {
                Ok(controller) => {
                    self.controllers.insert(handle, controller);
                }
                Err(e) => self.skip_or_fail(ignore, &handle, e)?,
            }
        }

        info!(
            devices = self.config.devices().loaded().len(),
            controllers = self.controllers.len(),
            skipped = self.skipped.len(),
            "application loaded"
        );
        Ok(())
    }

    fn skip_or_fail(&mut self, ignore: bool, handle: &str, error: AutomatError) -> AutomatResult<()> {
        match error {
            AutomatError::Device(e) if ignore => {
                warn!(handle, error = %e, "ignoring device error");
                self.skipped.push((handle.to_string(), e.to_string()));
                Ok(())
            }
            other => Err(other),
        }
    }

    /// Handles skipped under `ignore_device_errors`, with the error message.
    pub fn skipped(&self) -> &[(String, String)] {
        &self.skipped
    }

    /// A controller built by `load_all`.
    pub fn controller(&self, handle: &str) -> Option<&Controller> {
        self.controllers.get(handle)
    }

    /// Every controller built by `load_all`, in handle order.
    pub fn controllers(&self) -> impl Iterator<Item = &Controller> {
        self.controllers.values()
    }

    /// Signal abort to every loaded controller.
    pub fn abort_all_controllers(&self) {
        for controller in self.controllers.values() {
            controller.abort();
        }
    }

    /// Stop every controller thread, then shut down every loaded device once.
    pub fn shutdown_all(&self) -> AutomatResult<()> {
        for controller in self.controllers.values() {
            controller.thread_shutdown();
        }
        self.config.devices().shutdown_all()?;
        info!("application shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::device::StubDevice;
    use crate::registry::Modules;

    const TOML: &str = r#"
        [devices.good]
        module = "stub"
        [devices.bad]
        module = "stub"
        fail_on_create = true
        [controllers.uses_bad]
        module = "null"
        devices = { dev = "bad" }
        [controllers.beat]
        module = "heartbeat"
        devices = { dev = "good" }
    "#;

    fn application(ignore: bool) -> Application {
        let mut settings = Settings::from_toml_str(TOML).unwrap();
        settings.ignore_device_errors = ignore;
        let config = Configuration::from_settings(settings, None, Modules::with_builtins()).unwrap();
        Application::new(config)
    }

    #[test]
    fn device_errors_stop_loading_by_default() {
        let mut app = application(false);
        let err = app.load_all().unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn device_errors_are_skipped_when_ignored() {
        let mut app = application(true);
        app.load_all().unwrap();

        let skipped: Vec<&str> = app.skipped().iter().map(|(h, _)| h.as_str()).collect();
        assert_eq!(skipped, vec!["bad", "uses_bad"]);
        assert!(app.controller("beat").is_some());
        assert!(app.controller("uses_bad").is_none());
    }

    #[test]
    fn shutdown_all_reaches_each_device_once() {
        let mut app = application(true);
        app.load_all().unwrap();
        app.abort_all_controllers();
        app.shutdown_all().unwrap();

        let good = app.configuration().devices().get("good").unwrap();
        assert_eq!(good.downcast::<StubDevice>().unwrap().shutdown_count(), 1);
    }
}
