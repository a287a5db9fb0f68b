//! # DAQ Orchestrator Core Library
//!
//! Hardware abstraction and device orchestration for laboratory instruments.
//! Experiment code declares what it needs ("an acousto-optic modulator called
//! `aotf`"); drivers discover candidate devices, probe them by a trial open, and
//! the surviving devices are bound to those declarations. Devices form a tree of
//! dependencies (a sensor head hangs off its adapter), share serial ports through
//! an arbiter, and expose cached, typed properties.
//!
//! ## Crate Structure
//!
//! - **`config`**: `AppConfig` loaded with figment from TOML and `DAQ_ORCH_`
//!   environment variables.
//! - **`device`**: `Device` lifecycle (open/close cascade), categories, identification
//!   and the property cache.
//! - **`driver`**: the `Driver` trait, device enumeration by trial open, and the
//!   `DriverRegistry` of explicitly registered factories.
//! - **`drivers`**: simulated drivers (camera, synthesizer, power sensor).
//! - **`error`**: the `DaqError` enum shared by every module.
//! - **`error_recovery`**: bounded retries and timeouts for hardware I/O.
//! - **`hub`**: `LabHub`, the composition root owning one instance of each registry.
//! - **`logging`**: `tracing-subscriber` initialization.
//! - **`requirements`**: alias -> category declarations and their bindings.
//! - **`serial`**: serial port arbitration and async line I/O.
//!
//! ## Example
//!
//! ```rust,ignore
//! let config = AppConfig::load()?;
//! logging::init_from_config(&config)?;
//!
//! let mut hub = LabHub::from_config(&config)?;
//! hub.refresh(false).await?;
//! hub.auto_link().await?;
//!
//! let aotf = hub.requirements().device("aotf").ok_or(...)?;
//! aotf.open().await?;
//! aotf.set_property("power", PropertyValue::Float(10.0)).await?;
//! aotf.sync_property("power").await?;
//! ```

pub mod config;
pub mod device;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod error_recovery;
pub mod hub;
pub mod logging;
pub mod requirements;
pub mod serial;

pub use config::AppConfig;
pub use device::{
    Device, DeviceBackend, DeviceCategory, DeviceInfo, LifecycleState, Property, PropertyValue,
};
pub use driver::{enumerate_devices, Driver, DriverFactory, DriverRef, DriverRegistry};
pub use error::{DaqError, DaqResult};
pub use hub::LabHub;
pub use requirements::RequirementRegistry;
pub use serial::{PortState, SerialPortManager};
