//! Shared test backends.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use daq_orchestrator::device::{Device, DeviceBackend, DeviceCategory, DeviceInfo};
use daq_orchestrator::error::{DaqError, DaqResult};

/// Ordered record of hook calls shared by a group of devices.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: String) {
        self.0.lock().push(event);
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock())
    }
}

/// Backend that records its hooks and can be told to fail.
#[derive(Default)]
pub struct Probe {
    pub log: EventLog,
    pub fail_open: bool,
    pub fail_close: bool,
    pub fail_info: bool,
    pub delay: Option<Duration>,
}

#[async_trait]
impl DeviceBackend for Probe {
    async fn open(&self, device: &Device) -> DaqResult<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if device.parent().is_some_and(|parent| !parent.is_opened()) {
            self.log.push(format!("{} opened before its parent", device.name()));
        }
        self.log.push(format!("open {}", device.name()));
        if self.fail_open {
            return Err(DaqError::incompatible(device.name(), "wrong identity"));
        }
        Ok(())
    }

    async fn close(&self, device: &Device) -> DaqResult<()> {
        self.log.push(format!("close {}", device.name()));
        if self.fail_close {
            return Err(anyhow::anyhow!("{} is stuck", device.name()).into());
        }
        Ok(())
    }

    async fn info(&self, device: &Device) -> DaqResult<DeviceInfo> {
        if self.fail_info {
            return Err(anyhow::anyhow!("{} stopped responding", device.name()).into());
        }
        Ok(DeviceInfo::new("Test", device.name()))
    }
}

/// Device with a recording backend.
pub fn node(
    name: &str,
    category: DeviceCategory,
    parent: Option<&Arc<Device>>,
    log: &EventLog,
) -> Arc<Device> {
    node_with(
        name,
        category,
        parent,
        Probe {
            log: log.clone(),
            ..Default::default()
        },
    )
}

/// Device with a custom probe.
pub fn node_with(
    name: &str,
    category: DeviceCategory,
    parent: Option<&Arc<Device>>,
    probe: Probe,
) -> Arc<Device> {
    let mut builder = Device::builder(name, category, probe);
    if let Some(parent) = parent {
        builder = builder.parent(parent);
    }
    builder.build().unwrap()
}
