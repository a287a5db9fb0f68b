//! Drivers: producers and owners of devices.
//!
//! A [`Driver`] advertises the categories it can produce, hands out candidate
//! devices, and tracks every device that survived a probe. Drivers are constructed
//! through [`DriverFactory`] entries held by the [`DriverRegistry`]; nothing is
//! discovered by reflection.
//!
//! Probing a driver's candidates is done by [`enumerate_devices`]:
//!
//! ```text
//! candidates() ──► drop undeclared categories (error log)
//!              ──► drop candidates already active
//!              ──► test_open() all remaining concurrently
//!                    Ok           -> kept and tracked
//!                    Incompatible -> dropped (debug log)
//!                    other        -> propagated
//! ```

pub mod registry;

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::device::{Device, DeviceCategory};
use crate::error::{DaqError, DaqResult};

pub use registry::{DriverFactory, DriverRegistry};

/// Shared handle to a driver instance.
pub type DriverRef = Arc<dyn Driver>;

/// A source of devices of one or more categories.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Driver name, used in logs and configuration.
    fn name(&self) -> &str;

    /// Categories this driver can produce.
    fn supported_categories(&self) -> &[DeviceCategory];

    /// Prepare vendor libraries or shared resources. Default: nothing to do.
    async fn initialize(&self) -> DaqResult<()> {
        Ok(())
    }

    /// Build candidate devices. They are not opened yet.
    ///
    /// `this` is a weak handle to the driver itself, to be recorded in each
    /// device so it can find its producer.
    async fn candidates(&self, this: Weak<dyn Driver>) -> DaqResult<Vec<Arc<Device>>>;

    /// Devices that passed enumeration.
    fn tracked(&self) -> &DeviceSet;

    /// Close every tracked device and release driver resources.
    ///
    /// Devices are force-closed. Any device still active afterwards makes the
    /// shutdown fail with [`DaqError::DriverShutdown`].
    async fn shutdown(&self) -> DaqResult<()> {
        let tracked = self.tracked();
        tracked.close_all().await;

        let active = tracked.active_names();
        if !active.is_empty() {
            return Err(DaqError::DriverShutdown {
                driver: self.name().to_string(),
                reason: format!("devices still active: {}", active.join(", ")),
            });
        }
        tracked.clear();
        Ok(())
    }

    /// True if any tracked device is active.
    fn is_active(&self) -> bool {
        self.tracked().is_active()
    }
}

/// Devices tracked by a driver.
#[derive(Debug, Default)]
pub struct DeviceSet {
    devices: Mutex<Vec<Arc<Device>>>,
}

impl DeviceSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add devices not tracked yet.
    pub fn track(&self, devices: &[Arc<Device>]) {
        let mut tracked = self.devices.lock();
        for device in devices {
            if !tracked.iter().any(|d| d.id() == device.id()) {
                tracked.push(device.clone());
            }
        }
    }

    /// Snapshot of tracked devices.
    pub fn list(&self) -> Vec<Arc<Device>> {
        self.devices.lock().clone()
    }

    /// Tracked device with the given name.
    pub fn find(&self, name: &str) -> Option<Arc<Device>> {
        self.devices.lock().iter().find(|d| d.name() == name).cloned()
    }

    /// True if any tracked device is active.
    pub fn is_active(&self) -> bool {
        self.devices.lock().iter().any(|d| d.is_active())
    }

    /// Names of active devices.
    pub fn active_names(&self) -> Vec<String> {
        self.devices
            .lock()
            .iter()
            .filter(|d| d.is_active())
            .map(|d| d.name().to_string())
            .collect()
    }

    /// Force-close every tracked device concurrently; failures are logged.
    pub async fn close_all(&self) {
        let devices = self.list();
        let results = join_all(devices.iter().map(|d| d.close(true))).await;
        for (device, result) in devices.iter().zip(results) {
            if let Err(err) = result {
                error!(device = %device.name(), error = %err, "failed to close device");
            }
        }
    }

    /// Forget all devices.
    pub fn clear(&self) {
        self.devices.lock().clear();
    }

    /// Number of tracked devices.
    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    /// True if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }
}

/// Probe a driver's candidates and keep the ones that respond.
///
/// Surviving devices are closed again and tracked by the driver.
pub async fn enumerate_devices(driver: &DriverRef) -> DaqResult<Vec<Arc<Device>>> {
    let candidates = driver.candidates(Arc::downgrade(driver)).await?;
    let declared = driver.supported_categories();

    let mut probes = Vec::with_capacity(candidates.len());
    for device in candidates {
        if !declared.contains(&device.category()) {
            error!(
                driver = driver.name(),
                device = %device.name(),
                category = %device.category(),
                "driver produced a device of an undeclared category"
            );
            continue;
        }
        if device.is_active() {
            debug!(device = %device.name(), "already in use, skipped");
            continue;
        }
        probes.push(device);
    }

    let results = join_all(probes.iter().map(|device| device.test_open())).await;

    let mut valid = Vec::with_capacity(probes.len());
    for (device, result) in probes.into_iter().zip(results) {
        match result {
            Ok(info) => {
                debug!(device = %device.name(), %info, "candidate accepted");
                valid.push(device);
            }
            Err(err) if err.is_incompatible() => {
                debug!(device = %device.name(), reason = %err, "candidate rejected");
            }
            Err(err) => {
                warn!(driver = driver.name(), device = %device.name(), error = %err, "enumeration aborted");
                return Err(err);
            }
        }
    }

    driver.tracked().track(&valid);
    info!(driver = driver.name(), count = valid.len(), "enumerated devices");
    Ok(valid)
}
