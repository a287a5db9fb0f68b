//! Simulated drivers.
//!
//! These drivers exercise the orchestration contracts without hardware. Devices
//! behind serial ports go through the shared [`SerialPortManager`]; which ports
//! "answer" is described by each driver's options in the `[drivers.options]`
//! configuration table.
//!
//! - [`MockCameraFactory`] - `mock_camera`: transport-less cameras
//! - [`MockMdsFactory`] - `mock_mds`: acousto-optic synthesizer on a serial port
//! - [`MockOphirFactory`] - `mock_ophir`: power sensor head behind a serial adapter
//!
//! The synthesizer settles with `tokio::time::sleep`; the power sensor talks over an
//! in-memory pipe with the timeouts and retries of the manager's `LineSettings`.
//!
//! ```rust,ignore
//! let ports = Arc::new(SerialPortManager::with_static_ports(["COM1", "COM2"])?);
//! let mut registry = DriverRegistry::new();
//! drivers::register_mock_drivers(&mut registry, ports)?;
//! registry.refresh(false).await;
//! ```

mod mock_camera;
mod mock_mds;
mod mock_ophir;

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::driver::DriverRegistry;
use crate::error::{DaqError, DaqResult};
use crate::serial::SerialPortManager;

pub use mock_camera::{MockCameraConfig, MockCameraFactory};
pub use mock_mds::{MockMdsConfig, MockMdsFactory};
pub use mock_ophir::{MockOphirConfig, MockOphirFactory};

/// Register every simulated driver.
pub fn register_mock_drivers(
    registry: &mut DriverRegistry,
    ports: Arc<SerialPortManager>,
) -> DaqResult<()> {
    registry.register_factory(MockCameraFactory)?;
    registry.register_factory(MockMdsFactory::new(ports.clone()))?;
    registry.register_factory(MockOphirFactory::new(ports))?;
    Ok(())
}

/// Deserialize a driver's options table.
pub(crate) fn parse_options<T: DeserializeOwned>(
    driver_type: &str,
    options: toml::Value,
) -> DaqResult<T> {
    options.try_into().map_err(|err: toml::de::Error| {
        DaqError::Configuration(format!("invalid options for driver '{driver_type}': {err}"))
    })
}

/// Error used by simulated hardware when it is accessed while disconnected.
pub(crate) fn not_connected(device: &str) -> DaqError {
    DaqError::Hardware(anyhow::anyhow!("{device} is not connected"))
}
