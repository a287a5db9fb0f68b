//! Device model: categories, identification, backends and the device tree.
//!
//! A [`Device`] is one node in a tree of dependent instruments (a sensor head hangs
//! off its adapter, an axis off its controller). The generic lifecycle lives in
//! [`tree`]; instrument specifics are supplied through a [`DeviceBackend`].
//!
//! - [`category`] - closed set of type tags and their families
//! - [`property`] - cached attributes with dirty/volatile semantics
//! - [`tree`] - open/close cascade, registration, activity

pub mod category;
pub mod property;
pub mod tree;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DaqResult;

pub use category::{CategoryFamily, DeviceCategory, UnknownCategory};
pub use property::{
    Access, DataType, Property, PropertyBuilder, PropertyDescriptor, PropertyTable, PropertyValue,
};
pub use tree::{Device, DeviceBuilder, LifecycleState};

/// Identification reported by an instrument.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Manufacturer
    pub vendor: String,
    /// Model name
    pub model: String,
    /// Firmware or hardware revision
    pub version: String,
    /// Serial number
    pub serial_number: String,
}

impl DeviceInfo {
    /// Info with vendor and model only.
    pub fn new(vendor: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    /// Set the revision.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the serial number.
    pub fn with_serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.serial_number = serial_number.into();
        self
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::with_capacity(4);
        if !self.vendor.is_empty() {
            parts.push(self.vendor.clone());
        }
        if !self.model.is_empty() {
            parts.push(self.model.clone());
        }
        if !self.version.is_empty() {
            parts.push(format!("version={}", self.version));
        }
        if !self.serial_number.is_empty() {
            parts.push(format!("s/n={}", self.serial_number));
        }
        write!(f, "<{}>", parts.join(", "))
    }
}

/// Instrument-specific hooks plugged into the generic lifecycle.
///
/// The hooks receive the owning [`Device`] so they can reach its name, id and
/// parent. Hook failures propagate to whoever called `open`/`close`.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// Acquire transport, verify identity. Default: nothing to do.
    async fn open(&self, _device: &Device) -> DaqResult<()> {
        Ok(())
    }

    /// Release transport. Default: nothing to do.
    async fn close(&self, _device: &Device) -> DaqResult<()> {
        Ok(())
    }

    /// Query identification. Called on an opened device.
    async fn info(&self, device: &Device) -> DaqResult<DeviceInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_display_skips_empty_fields() {
        let info = DeviceInfo::new("Ophir", "USBI").with_serial_number("123");
        assert_eq!(info.to_string(), "<Ophir, USBI, s/n=123>");

        let full = DeviceInfo::new("AA", "MDSnC")
            .with_version("1.2")
            .with_serial_number("9");
        assert_eq!(full.to_string(), "<AA, MDSnC, version=1.2, s/n=9>");

        assert_eq!(DeviceInfo::default().to_string(), "<>");
    }
}
