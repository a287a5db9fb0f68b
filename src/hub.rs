//! Composition root.
//!
//! [`LabHub`] owns exactly one serial port manager, one driver registry and one
//! requirement registry, and wires them together. There are no globals: every
//! component receives what it needs from the hub at construction time.
//!
//! ```text
//! AppConfig ──► LabHub::from_config
//!                 ├── SerialPortManager   ([serial])
//!                 ├── DriverRegistry      ([drivers], built-in factories)
//!                 └── RequirementRegistry ([requirements])
//!
//! refresh() ──► ports.refresh() ──► drivers.refresh()
//! auto_link() ─► for each unsatisfied alias:
//!                  query_drivers(category) ──► enumerate_devices ──► link first free
//! ```

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::device::{Device, DeviceCategory};
use crate::driver::{enumerate_devices, DriverRegistry};
use crate::drivers::register_mock_drivers;
use crate::error::DaqResult;
use crate::requirements::RequirementRegistry;
use crate::serial::SerialPortManager;

/// Owner of the registries of one laboratory setup.
pub struct LabHub {
    ports: Arc<SerialPortManager>,
    drivers: DriverRegistry,
    requirements: RequirementRegistry,
}

impl LabHub {
    /// Assemble a hub from already constructed parts.
    pub fn new(
        ports: Arc<SerialPortManager>,
        drivers: DriverRegistry,
        requirements: RequirementRegistry,
    ) -> Self {
        Self {
            ports,
            drivers,
            requirements,
        }
    }

    /// Build a hub from configuration, with the built-in drivers registered.
    ///
    /// Drivers are not constructed until [`LabHub::refresh`].
    pub fn from_config(config: &AppConfig) -> DaqResult<Self> {
        config.validate()?;

        let ports = Arc::new(SerialPortManager::from_config(&config.serial)?);
        let mut drivers = DriverRegistry::with_config(config.drivers.clone());
        register_mock_drivers(&mut drivers, ports.clone())?;
        let requirements =
            RequirementRegistry::with_requirements(config.requirements.clone());

        info!(
            ports = ports.list_ports().len(),
            factories = drivers.factory_types().len(),
            requirements = requirements.len(),
            "lab hub configured"
        );
        Ok(Self::new(ports, drivers, requirements))
    }

    /// Serial port manager.
    pub fn ports(&self) -> &Arc<SerialPortManager> {
        &self.ports
    }

    /// Driver registry.
    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    /// Driver registry, for registering additional factories.
    pub fn drivers_mut(&mut self) -> &mut DriverRegistry {
        &mut self.drivers
    }

    /// Requirement registry.
    pub fn requirements(&self) -> &RequirementRegistry {
        &self.requirements
    }

    /// Re-enumerate ports, then rebuild drivers. Returns the number of live drivers.
    pub async fn refresh(&mut self, force_reload: bool) -> DaqResult<usize> {
        self.ports.refresh()?;
        Ok(self.drivers.refresh(force_reload).await)
    }

    /// Replace the requirement set; see [`RequirementRegistry::update_requirements`].
    pub fn update_requirements<I, S>(&mut self, requirements: I) -> Vec<Arc<Device>>
    where
        I: IntoIterator<Item = (S, DeviceCategory)>,
        S: Into<String>,
    {
        self.requirements.update_requirements(requirements)
    }

    /// Bind `device` to `alias`.
    pub fn link(&mut self, alias: &str, device: Arc<Device>) -> DaqResult<()> {
        self.requirements.link(alias, device)
    }

    /// Clear the binding of `alias` and hand the device back.
    pub fn unlink(&mut self, alias: &str) -> DaqResult<Option<Arc<Device>>> {
        self.requirements.unlink(alias)
    }

    /// True when every requirement has a device.
    pub fn is_satisfied(&self) -> bool {
        self.requirements.is_satisfied()
    }

    /// Enumerate every driver producing `category` and collect the devices of
    /// that category that answered.
    ///
    /// A driver whose enumeration fails is logged and skipped.
    pub async fn find_devices(&self, category: DeviceCategory) -> Vec<Arc<Device>> {
        let mut found = Vec::new();
        for driver in self.drivers.query_drivers(Some(category)) {
            match enumerate_devices(&driver).await {
                Ok(devices) => {
                    found.extend(devices.into_iter().filter(|d| d.category() == category));
                }
                Err(err) => {
                    warn!(driver = driver.name(), %category, error = %err, "enumeration failed");
                }
            }
        }
        debug!(%category, count = found.len(), "devices found");
        found
    }

    /// Link the first free compatible device to every unsatisfied alias.
    ///
    /// Returns the aliases that got a device in this call.
    pub async fn auto_link(&mut self) -> DaqResult<Vec<String>> {
        let mut linked = Vec::new();
        for (alias, category) in self.requirements.unsatisfied() {
            let candidate = self
                .find_devices(category)
                .await
                .into_iter()
                .find(|device| !device.is_claimed());

            match candidate {
                Some(device) => {
                    info!(alias = %alias, device = %device.name(), "auto-linked");
                    self.requirements.link(&alias, device)?;
                    linked.push(alias);
                }
                None => warn!(alias = %alias, %category, "no device available"),
            }
        }
        Ok(linked)
    }

    /// Release every binding and shut all drivers down, closing their devices.
    pub async fn shutdown(&mut self) {
        let aliases: Vec<String> = self
            .requirements
            .iter()
            .filter(|entry| entry.is_bound())
            .map(|entry| entry.alias().to_string())
            .collect();
        for alias in aliases {
            if let Err(err) = self.requirements.unlink(&alias) {
                warn!(alias = %alias, error = %err, "failed to unlink");
            }
        }
        self.drivers.shutdown().await;
        info!("lab hub shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AppConfig {
        AppConfig::from_toml_str(
            r#"
            [serial]
            static_ports = ["COM1", "COM2"]
            read_timeout = "20ms"
            retry_delay = "1ms"

            [drivers.options.mock_mds]
            ports = ["COM2"]
            settle = "1ms"

            [drivers.options.mock_camera]
            count = 2

            [requirements]
            aotf = "AcustoOpticalModulator"
            cam = "Camera"
            "#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_auto_link_satisfies_requirements() {
        let mut hub = LabHub::from_config(&config()).unwrap();
        assert!(!hub.is_satisfied());

        hub.refresh(false).await.unwrap();
        let mut linked = hub.auto_link().await.unwrap();
        linked.sort();
        assert_eq!(linked, ["aotf", "cam"]);
        assert!(hub.is_satisfied());
        assert_eq!(
            hub.requirements().device("aotf").unwrap().name(),
            "mds@COM2"
        );

        // nothing left to do
        assert!(hub.auto_link().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_hardware_leaves_alias_unsatisfied() {
        let config = AppConfig::from_toml_str(
            r#"
            [serial]
            static_ports = ["COM1"]
            read_timeout = "20ms"
            retry_delay = "1ms"

            [requirements]
            power = "PowerSensor"
            "#,
        )
        .unwrap();
        let mut hub = LabHub::from_config(&config).unwrap();
        hub.refresh(false).await.unwrap();

        assert!(hub.auto_link().await.unwrap().is_empty());
        assert_eq!(hub.requirements().unsatisfied().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_releases_bindings() {
        let mut hub = LabHub::from_config(&config()).unwrap();
        hub.refresh(false).await.unwrap();
        hub.auto_link().await.unwrap();

        let aotf = hub.requirements().device("aotf").unwrap();
        aotf.open().await.unwrap();

        hub.shutdown().await;
        assert!(!aotf.is_opened());
        assert!(!aotf.is_claimed());
        assert!(hub.drivers().is_empty());
    }
}
