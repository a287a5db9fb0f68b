//! Mock camera without a transport.
//!
//! Produces `count` cameras named `camera0..`. Every candidate answers, so this
//! driver is the simplest way to satisfy a `Camera` requirement in tests.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::time::sleep;

use super::{not_connected, parse_options};
use crate::device::{
    DataType, Device, DeviceBackend, DeviceCategory, DeviceInfo, Property, PropertyValue,
};
use crate::driver::{DeviceSet, Driver, DriverFactory, DriverRef};
use crate::error::{DaqError, DaqResult};

static CAMERA_CATEGORIES: &[DeviceCategory] = &[DeviceCategory::Camera];

// =============================================================================
// MockCameraFactory - DriverFactory implementation
// =============================================================================

/// Configuration for the `mock_camera` driver
#[derive(Debug, Clone, Deserialize)]
pub struct MockCameraConfig {
    /// Number of cameras to report (default: 1)
    #[serde(default = "default_count")]
    pub count: usize,

    /// Sensor width in pixels (default: 1920)
    #[serde(default = "default_width")]
    pub width: u32,

    /// Sensor height in pixels (default: 1080)
    #[serde(default = "default_height")]
    pub height: u32,

    /// Initial exposure in milliseconds (default: 33)
    #[serde(default = "default_exposure")]
    pub exposure_ms: f64,
}

fn default_count() -> usize {
    1
}
fn default_width() -> u32 {
    1920
}
fn default_height() -> u32 {
    1080
}
fn default_exposure() -> f64 {
    33.0
}

impl Default for MockCameraConfig {
    fn default() -> Self {
        Self {
            count: 1,
            width: 1920,
            height: 1080,
            exposure_ms: 33.0,
        }
    }
}

/// Factory for the mock camera driver.
pub struct MockCameraFactory;

impl DriverFactory for MockCameraFactory {
    fn driver_type(&self) -> &'static str {
        "mock_camera"
    }

    fn categories(&self) -> &'static [DeviceCategory] {
        CAMERA_CATEGORIES
    }

    fn validate(&self, config: &toml::Value) -> DaqResult<()> {
        let cfg: MockCameraConfig = parse_options(self.driver_type(), config.clone())?;
        if cfg.width == 0 || cfg.height == 0 {
            return Err(DaqError::Configuration(
                "camera resolution must be non-zero".into(),
            ));
        }
        if cfg.exposure_ms <= 0.0 {
            return Err(DaqError::Configuration("exposure must be positive".into()));
        }
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, DaqResult<DriverRef>> {
        Box::pin(async move {
            let config: MockCameraConfig = parse_options("mock_camera", config)?;
            let driver: DriverRef = Arc::new(CameraDriver {
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

struct CameraDriver {
    config: MockCameraConfig,
    tracked: DeviceSet,
}

#[async_trait]
impl Driver for CameraDriver {
    fn name(&self) -> &str {
        "mock_camera"
    }

    fn supported_categories(&self) -> &[DeviceCategory] {
        CAMERA_CATEGORIES
    }

    async fn candidates(&self, this: Weak<dyn Driver>) -> DaqResult<Vec<Arc<Device>>> {
        (0..self.config.count)
            .map(|index| {
                let name = format!("camera{index}");
                match self.tracked.find(&name) {
                    Some(device) => Ok(device),
                    None => self.build_camera(name, index, this.clone()),
                }
            })
            .collect()
    }

    fn tracked(&self) -> &DeviceSet {
        &self.tracked
    }
}

impl CameraDriver {
    fn build_camera(
        &self,
        name: String,
        index: usize,
        this: Weak<dyn Driver>,
    ) -> DaqResult<Arc<Device>> {
        let sensor = Arc::new(Mutex::new(Sensor {
            connected: false,
            exposure_ms: self.config.exposure_ms,
            binning: "1x1".to_string(),
            temperature: -10.0,
        }));
        let backend = CameraBackend {
            index,
            sensor: sensor.clone(),
        };

        let exposure = {
            let (read, write) = (sensor.clone(), sensor.clone());
            let (read_name, write_name) = (name.clone(), name.clone());
            Property::builder("exposure_time", DataType::Float)
                .unit("ms")
                .range(0.01, 10_000.0)
                .reader(move || {
                    let sensor = read.clone();
                    let name = read_name.clone();
                    async move {
                        let s = sensor.lock();
                        s.check(&name)?;
                        Ok(PropertyValue::Float(s.exposure_ms))
                    }
                })
                .writer(move |value| {
                    let sensor = write.clone();
                    let name = write_name.clone();
                    async move {
                        let mut s = sensor.lock();
                        s.check(&name)?;
                        s.exposure_ms = value.as_f64().unwrap_or(s.exposure_ms);
                        Ok(())
                    }
                })
                .build()?
        };

        let binning = {
            let (read, write) = (sensor.clone(), sensor.clone());
            let (read_name, write_name) = (name.clone(), name.clone());
            Property::builder("binning", DataType::Enum)
                .choices(["1x1", "2x2", "4x4"])
                .reader(move || {
                    let sensor = read.clone();
                    let name = read_name.clone();
                    async move {
                        let s = sensor.lock();
                        s.check(&name)?;
                        Ok(PropertyValue::Text(s.binning.clone()))
                    }
                })
                .writer(move |value| {
                    let sensor = write.clone();
                    let name = write_name.clone();
                    async move {
                        let mut s = sensor.lock();
                        s.check(&name)?;
                        if let PropertyValue::Text(binning) = value {
                            s.binning = binning;
                        }
                        Ok(())
                    }
                })
                .build()?
        };

        // cools by a tenth of a degree per read
        let temperature = {
            let sensor = sensor.clone();
            let name = name.clone();
            Property::builder("sensor_temperature", DataType::Float)
                .unit("degC")
                .volatile()
                .reader(move || {
                    let sensor = sensor.clone();
                    let name = name.clone();
                    async move {
                        let mut s = sensor.lock();
                        s.check(&name)?;
                        s.temperature -= 0.1;
                        Ok(PropertyValue::Float(s.temperature))
                    }
                })
                .build()?
        };

        let (width, height) = (self.config.width, self.config.height);
        let resolution = Property::builder("resolution", DataType::Array)
            .reader(move || async move {
                Ok(PropertyValue::Array(vec![
                    PropertyValue::Integer(i64::from(width)),
                    PropertyValue::Integer(i64::from(height)),
                ]))
            })
            .build()?;

        Device::builder(name, DeviceCategory::Camera, backend)
            .driver(this)
            .property(exposure)
            .property(binning)
            .property(temperature)
            .property(resolution)
            .build()
    }
}

// =============================================================================
// Simulated hardware
// =============================================================================

#[derive(Debug)]
struct Sensor {
    connected: bool,
    exposure_ms: f64,
    binning: String,
    temperature: f64,
}

impl Sensor {
    fn check(&self, name: &str) -> DaqResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(not_connected(name))
        }
    }
}

struct CameraBackend {
    index: usize,
    sensor: Arc<Mutex<Sensor>>,
}

#[async_trait]
impl DeviceBackend for CameraBackend {
    async fn open(&self, _device: &Device) -> DaqResult<()> {
        // simulated USB enumeration
        sleep(Duration::from_millis(2)).await;
        self.sensor.lock().connected = true;
        Ok(())
    }

    async fn close(&self, _device: &Device) -> DaqResult<()> {
        self.sensor.lock().connected = false;
        Ok(())
    }

    async fn info(&self, device: &Device) -> DaqResult<DeviceInfo> {
        self.sensor.lock().check(device.name())?;
        Ok(DeviceInfo::new("Mock", "Camera")
            .with_version("2.1")
            .with_serial_number(format!("CAM-{:04}", self.index)))
    }
}
