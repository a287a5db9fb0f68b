//! Simulated AA Opto-Electronic MDSnC acousto-optic synthesizer.
//!
//! One candidate is produced per known serial port. Opening a candidate claims the
//! port through the [`SerialPortManager`], waits for the synthesizer to settle and
//! checks whether anything answered:
//!
//! ```text
//! request_port ──► settle ──► answered? ──yes──► mark_port   (device opened)
//!                                  └──────no───► release_port (Incompatible)
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{not_connected, parse_options};
use crate::device::{
    DataType, Device, DeviceBackend, DeviceCategory, DeviceInfo, Property, PropertyBuilder,
    PropertyValue,
};
use crate::driver::{DeviceSet, Driver, DriverFactory, DriverRef};
use crate::error::{DaqError, DaqResult};
use crate::serial::SerialPortManager;

static MDS_CATEGORIES: &[DeviceCategory] = &[DeviceCategory::AcustoOpticalModulator];

// =============================================================================
// MockMdsFactory - DriverFactory implementation
// =============================================================================

/// Options for the `mock_mds` driver
#[derive(Debug, Clone, Deserialize)]
pub struct MockMdsConfig {
    /// Ports with a synthesizer attached
    #[serde(default)]
    pub ports: Vec<String>,
    /// Time the synthesizer needs before it answers (default: 5ms)
    #[serde(default = "default_settle", with = "humantime_serde")]
    pub settle: Duration,
}

fn default_settle() -> Duration {
    Duration::from_millis(5)
}

impl Default for MockMdsConfig {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            settle: default_settle(),
        }
    }
}

/// Factory for the simulated synthesizer driver.
pub struct MockMdsFactory {
    ports: Arc<SerialPortManager>,
}

impl MockMdsFactory {
    /// Factory probing ports of `ports`.
    pub fn new(ports: Arc<SerialPortManager>) -> Self {
        Self { ports }
    }
}

impl DriverFactory for MockMdsFactory {
    fn driver_type(&self) -> &'static str {
        "mock_mds"
    }

    fn categories(&self) -> &'static [DeviceCategory] {
        MDS_CATEGORIES
    }

    fn validate(&self, config: &toml::Value) -> DaqResult<()> {
        let _: MockMdsConfig = parse_options(self.driver_type(), config.clone())?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, DaqResult<DriverRef>> {
        let ports = self.ports.clone();
        Box::pin(async move {
            let config: MockMdsConfig = parse_options("mock_mds", config)?;
            let driver: DriverRef = Arc::new(MdsDriver {
                ports,
                config,
                tracked: DeviceSet::new(),
            });
            Ok(driver)
        })
    }
}

// =============================================================================
// Driver
// =============================================================================

struct MdsDriver {
    ports: Arc<SerialPortManager>,
    config: MockMdsConfig,
    tracked: DeviceSet,
}

#[async_trait]
impl Driver for MdsDriver {
    fn name(&self) -> &str {
        "mock_mds"
    }

    fn supported_categories(&self) -> &[DeviceCategory] {
        MDS_CATEGORIES
    }

    async fn candidates(&self, this: Weak<dyn Driver>) -> DaqResult<Vec<Arc<Device>>> {
        let mut candidates = Vec::new();
        for port in self.ports.list_ports() {
            let name = format!("mds@{port}");
            if let Some(device) = self.tracked.find(&name) {
                candidates.push(device);
                continue;
            }
            let present = self.config.ports.contains(&port);
            candidates.push(self.build_device(name, port, present, this.clone())?);
        }
        Ok(candidates)
    }

    fn tracked(&self) -> &DeviceSet {
        &self.tracked
    }
}

impl MdsDriver {
    fn build_device(
        &self,
        name: String,
        port: String,
        present: bool,
        this: Weak<dyn Driver>,
    ) -> DaqResult<Arc<Device>> {
        let hw: SharedSynthesizer = Arc::default();
        let backend = MdsBackend {
            port,
            ports: self.ports.clone(),
            present,
            settle: self.config.settle,
            hw: hw.clone(),
        };

        Device::builder(name.clone(), DeviceCategory::AcustoOpticalModulator, backend)
            .driver(this)
            .property(synth_property(
                Property::builder("power", DataType::Float).unit("dBm").range(0.0, 22.5),
                &hw,
                &name,
                |s| PropertyValue::Float(s.power),
                Some(|s: &mut Synthesizer, v: PropertyValue| s.power = v.as_f64().unwrap_or(s.power)),
            )?)
            .property(synth_property(
                Property::builder("frequency", DataType::Float)
                    .unit("MHz")
                    .range(80.0, 135.0),
                &hw,
                &name,
                |s| PropertyValue::Float(s.frequency),
                Some(|s: &mut Synthesizer, v: PropertyValue| s.frequency = v.as_f64().unwrap_or(s.frequency)),
            )?)
            .property(synth_property(
                Property::builder("enabled", DataType::Boolean),
                &hw,
                &name,
                |s| PropertyValue::Boolean(s.enabled),
                Some(|s: &mut Synthesizer, v: PropertyValue| s.enabled = v.as_bool().unwrap_or(s.enabled)),
            )?)
            .property(synth_property(
                Property::builder("mode", DataType::Enum).choices(["internal", "external"]),
                &hw,
                &name,
                |s| PropertyValue::Text(s.mode.clone()),
                Some(|s: &mut Synthesizer, v: PropertyValue| {
                    if let PropertyValue::Text(mode) = v {
                        s.mode = mode;
                    }
                }),
            )?)
            .property(synth_property(
                Property::builder("line_status", DataType::Text).volatile(),
                &hw,
                &name,
                |s| {
                    let state = if s.enabled { "ON" } else { "OFF" };
                    PropertyValue::Text(format!(
                        "F={:.3} P={:.2} {state} {}",
                        s.frequency, s.power, s.mode
                    ))
                },
                None,
            )?)
            .build()
    }
}

// =============================================================================
// Simulated hardware
// =============================================================================

#[derive(Debug)]
struct Synthesizer {
    connected: bool,
    power: f64,
    frequency: f64,
    enabled: bool,
    mode: String,
}

impl Default for Synthesizer {
    fn default() -> Self {
        Self {
            connected: false,
            power: 0.0,
            frequency: 100.0,
            enabled: false,
            mode: "internal".to_string(),
        }
    }
}

type SharedSynthesizer = Arc<Mutex<Synthesizer>>;

type ReadFn = fn(&Synthesizer) -> PropertyValue;
type WriteFn = fn(&mut Synthesizer, PropertyValue);

/// Attach hardware hooks that go through the simulated synthesizer.
fn synth_property(
    builder: PropertyBuilder,
    hw: &SharedSynthesizer,
    device: &str,
    read: ReadFn,
    write: Option<WriteFn>,
) -> DaqResult<Property> {
    let (reader_hw, reader_name) = (hw.clone(), device.to_string());
    let mut builder = builder.reader(move || {
        let hw = reader_hw.clone();
        let name = reader_name.clone();
        async move {
            let synth = hw.lock();
            if !synth.connected {
                return Err(not_connected(&name));
            }
            Ok(read(&synth))
        }
    });

    if let Some(write) = write {
        let (writer_hw, writer_name) = (hw.clone(), device.to_string());
        builder = builder.writer(move |value| {
            let hw = writer_hw.clone();
            let name = writer_name.clone();
            async move {
                let mut synth = hw.lock();
                if !synth.connected {
                    return Err(not_connected(&name));
                }
                write(&mut synth, value);
                Ok(())
            }
        });
    }
    builder.build()
}

struct MdsBackend {
    port: String,
    ports: Arc<SerialPortManager>,
    present: bool,
    settle: Duration,
    hw: SharedSynthesizer,
}

#[async_trait]
impl DeviceBackend for MdsBackend {
    async fn open(&self, device: &Device) -> DaqResult<()> {
        self.ports
            .request_port(&self.port, device.name())
            .await
            .map_err(|err| match err {
                DaqError::PortAlreadyAssigned { .. } => {
                    DaqError::incompatible(device.name(), err.to_string())
                }
                other => other,
            })?;

        sleep(self.settle).await;

        if !self.present {
            self.ports.release_port(&self.port)?;
            return Err(DaqError::incompatible(
                device.name(),
                format!("no synthesizer answered on {}", self.port),
            ));
        }

        self.ports.mark_port(&self.port, device.name())?;
        self.hw.lock().connected = true;
        debug!(device = %device.name(), port = %self.port, "synthesizer connected");
        Ok(())
    }

    async fn close(&self, device: &Device) -> DaqResult<()> {
        self.hw.lock().connected = false;
        match self.ports.release_port(&self.port) {
            Err(DaqError::PortNotFound(port)) => {
                warn!(device = %device.name(), %port, "port vanished before close");
                Ok(())
            }
            other => other,
        }
    }

    async fn info(&self, device: &Device) -> DaqResult<DeviceInfo> {
        if !self.hw.lock().connected {
            return Err(not_connected(device.name()));
        }
        Ok(DeviceInfo::new("AA Opto-Electronic", "MDSnC")
            .with_version("1.0")
            .with_serial_number(format!("MDS-{}", self.port)))
    }
}
