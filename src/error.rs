//! Custom error types for the orchestration core.
//!
//! This module defines the primary error type, `DaqError`, shared by the device tree,
//! the property cache, the driver and requirement registries and the serial port
//! manager. Using the `thiserror` crate, it provides a centralized and consistent way
//! to classify failures so that callers can decide whether to retry, back off or
//! report a framework bug.
//!
//! ## Error Hierarchy
//!
//! - **`Incompatible`**: A probed candidate is not the expected hardware. Expected and
//!   frequent during enumeration; logged at low severity and the candidate is dropped.
//! - **`DirtyCache`**: A property was read while a local write is still waiting for
//!   `sync`. This is a caller contract violation and is never resolved silently.
//! - **`PortAlreadyAssigned`**: A shared serial port is committed to another owner.
//! - **`Timeout`**: Hardware did not answer within the bounded retry budget.
//! - **`Consistency`**: An internal invariant broke (unregistering a non-child, a held
//!   port vanishing from the OS list). Always logged at error level.
//! - **`Hardware`**: Wraps `anyhow::Error` raised by instrument backends.
//!
//! By using `#[from]`, `DaqError` can be created from underlying error types,
//! keeping `?` usable throughout the crate.

use std::time::Duration;

use thiserror::Error;

use crate::device::DeviceCategory;

/// Convenience alias for results using the crate error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for device orchestration.
#[derive(Error, Debug)]
pub enum DaqError {
    /// The candidate answered, but it is not the hardware this driver expects.
    #[error("Device '{device}' is not compatible: {reason}")]
    Incompatible {
        /// Name of the probed candidate
        device: String,
        /// Why the candidate was rejected
        reason: String,
    },

    /// A locally written value has not been pushed to hardware yet.
    #[error("Property '{0}' is not synchronized, call sync before reading")]
    DirtyCache(String),

    /// The property name is unknown to the device and all of its ancestors.
    #[error("Unknown property '{0}'")]
    UnknownProperty(String),

    /// Write attempted on a read-only property.
    #[error("Property '{0}' is read-only")]
    ReadOnlyProperty(String),

    /// Read attempted on a write-only property.
    #[error("Property '{0}' is write-only")]
    WriteOnlyProperty(String),

    /// Numeric value outside the declared range.
    #[error("Value {value} for property '{name}' is outside [{min}, {max}]")]
    OutOfRange {
        /// Property name
        name: String,
        /// Rejected value
        value: f64,
        /// Lower bound
        min: f64,
        /// Upper bound
        max: f64,
    },

    /// Value has the wrong type or is not one of the declared choices.
    #[error("Invalid value for property '{name}': {reason}")]
    InvalidValue {
        /// Property name
        name: String,
        /// Description of the mismatch
        reason: String,
    },

    /// Close refused because children are still active.
    #[error("Device '{0}' still has active children")]
    DeviceBusy(String),

    /// A lifecycle call arrived while another one is in flight on the same device.
    #[error("Device '{device}' is {state}, concurrent lifecycle calls are not supported")]
    LifecycleConflict {
        /// Device name
        device: String,
        /// Lifecycle state observed when the call arrived
        state: String,
    },

    /// The parent was dropped while a child still referenced it.
    #[error("Parent of device '{0}' no longer exists")]
    ParentDropped(String),

    /// One or more dirty properties could not be committed.
    #[error("Device '{device}' failed to sync {} property(ies): {}", .failed.len(), .failed.join(", "))]
    SyncFailed {
        /// Device name
        device: String,
        /// Properties whose writer failed
        failed: Vec<String>,
    },

    /// Alias is not part of the current requirements.
    #[error("Unknown alias '{0}'")]
    UnknownAlias(String),

    /// Device category does not match the alias declaration.
    #[error("Alias '{alias}' requires {expected}, but device is {actual}")]
    CategoryMismatch {
        /// Requirement alias
        alias: String,
        /// Declared category
        expected: DeviceCategory,
        /// Category of the offered device
        actual: DeviceCategory,
    },

    /// Alias already has a bound device; unlink first.
    #[error("Alias '{0}' is already linked to a device")]
    AliasAlreadyLinked(String),

    /// Serial port is not known to the port manager.
    #[error("Serial port '{0}' is not in the record")]
    PortNotFound(String),

    /// Serial port is committed to another owner.
    #[error("Serial port '{port}' is already assigned to '{owner}'")]
    PortAlreadyAssigned {
        /// Port name
        port: String,
        /// Current owner
        owner: String,
    },

    /// Hardware did not respond in time after all retries.
    #[error("Timed out after {attempts} attempt(s) of {timeout:?}: {operation}")]
    Timeout {
        /// What was being waited for
        operation: String,
        /// Attempts made
        attempts: u32,
        /// Per-attempt timeout
        timeout: Duration,
    },

    /// Framework invariant broke.
    #[error("Consistency violation: {0}")]
    Consistency(String),

    /// Driver could not be initialized.
    #[error("Unable to initialize driver '{driver}': {reason}")]
    DriverInitialize {
        /// Driver name
        driver: String,
        /// Failure description
        reason: String,
    },

    /// Driver could not be shut down cleanly.
    #[error("Driver '{driver}' failed to shutdown: {reason}")]
    DriverShutdown {
        /// Driver name
        driver: String,
        /// Failure description
        reason: String,
    },

    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Semantic configuration error.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// I/O error from a transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure reported by an instrument backend.
    #[error("Hardware error: {0}")]
    Hardware(#[from] anyhow::Error),
}

impl DaqError {
    /// Shorthand for an [`DaqError::Incompatible`] classification.
    pub fn incompatible(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Incompatible {
            device: device.into(),
            reason: reason.into(),
        }
    }

    /// True for the expected "wrong hardware" outcome of a probe.
    pub fn is_incompatible(&self) -> bool {
        matches!(self, Self::Incompatible { .. })
    }

    /// True when the error can reasonably be retried after backing off.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::PortAlreadyAssigned { .. } | Self::Io(_)
        )
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}
