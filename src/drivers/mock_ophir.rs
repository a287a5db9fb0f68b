//! Mock Ophir power sensor behind a serial adapter.
//!
//! Each port gets an adapter device (`SensorAdapter`) with one sensor head hanging
//! off it (`PowerSensor`). Only heads are offered as candidates; probing a head
//! opens its adapter first, and a head without a sensor attached closes the
//! adapter again:
//!
//! ```text
//! ophir@COM3 (SensorAdapter, owns the port, "wavelength")
//!   └── ophir@COM3/head (PowerSensor, "reading")
//! ```
//!
//! The adapter talks the Ophir ASCII protocol over an in-memory pipe served by a
//! scripted firmware task. Commands end in `\r`, replies start with `*` on
//! success and `?` on error:
//!
//! | Command  | Reply                          |
//! |----------|--------------------------------|
//! | `$II`    | `* USBI <serial> USBI`         |
//! | `$VE`    | `* <version>`                  |
//! | `$HT`    | `* SI` (photodiode) or `* XX`  |
//! | `$HI`    | `* SI <serial> <model> 0`      |
//! | `$SP`    | `*<power in mW>`               |
//! | `$WL[v]` | `* <wavelength>` / `*`         |
//!
//! Ports without an adapter never answer; every read on them is bounded by the
//! manager's [`LineSettings`] and the probe ends as `Incompatible`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tracing::{debug, trace, warn};

use super::{not_connected, parse_options};
use crate::device::{
    DataType, Device, DeviceBackend, DeviceCategory, DeviceInfo, Property, PropertyValue,
};
use crate::driver::{DeviceSet, Driver, DriverFactory, DriverRef};
use crate::error::{DaqError, DaqResult};
use crate::serial::{read_until, wrap_shared, write_line, LineSettings, SerialPortManager, SharedPort};

static OPHIR_CATEGORIES: &[DeviceCategory] =
    &[DeviceCategory::SensorAdapter, DeviceCategory::PowerSensor];

const TERMINATOR: u8 = b'\r';

// =============================================================================
// MockOphirFactory - DriverFactory implementation
// =============================================================================

/// Options for the `mock_ophir` driver
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MockOphirConfig {
    /// Adapter ports and the head model plugged into each; an empty model means
    /// the adapter answers but no head is attached
    #[serde(default)]
    pub heads: BTreeMap<String, String>,
}

/// Factory for the mock power sensor driver.
pub struct MockOphirFactory {
    ports: Arc<SerialPortManager>,
}

impl MockOphirFactory {
    /// Factory probing ports of `ports`.
    pub fn new(ports: Arc<SerialPortManager>) -> Self {
        Self { ports }
    }
}

impl DriverFactory for MockOphirFactory {
    fn driver_type(&self) -> &'static str {
        "mock_ophir"
    }

    fn categories(&self) -> &'static [DeviceCategory] {
        OPHIR_CATEGORIES
    }

    fn validate(&self, config: &toml::Value) -> DaqResult<()> {
        let _: MockOphirConfig = parse_options(self.driver_type(), config.clone())?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, DaqResult<DriverRef>> {
        let ports = self.ports.clone();
        Box::pin(async move {
            let config: MockOphirConfig = parse_options("mock_ophir", config)?;
            let driver: DriverRef = Arc::new(OphirDriver {
                ports,
                config,
                adapters: Mutex::new(HashMap::new()),
                tracked: DeviceSet::new(),
            });
            Ok(driver)
        })
    }
}

// =============================================================================
// Driver
// =============================================================================

struct OphirDriver {
    ports: Arc<SerialPortManager>,
    config: MockOphirConfig,
    /// Adapters by port; heads only hold them weakly
    adapters: Mutex<HashMap<String, (Arc<Device>, SharedConnection)>>,
    tracked: DeviceSet,
}

#[async_trait]
impl Driver for OphirDriver {
    fn name(&self) -> &str {
        "mock_ophir"
    }

    fn supported_categories(&self) -> &[DeviceCategory] {
        OPHIR_CATEGORIES
    }

    async fn candidates(&self, this: Weak<dyn Driver>) -> DaqResult<Vec<Arc<Device>>> {
        let mut heads = Vec::new();
        for port in self.ports.list_ports() {
            let name = format!("ophir@{port}/head");
            if let Some(head) = self.tracked.find(&name) {
                heads.push(head);
                continue;
            }
            let (adapter, connection) = self.adapter(&port, &this)?;
            heads.push(build_head(name, &adapter, connection, this.clone())?);
        }
        Ok(heads)
    }

    fn tracked(&self) -> &DeviceSet {
        &self.tracked
    }

    async fn shutdown(&self) -> DaqResult<()> {
        self.tracked.close_all().await;
        let active = self.tracked.active_names();
        if !active.is_empty() {
            return Err(DaqError::DriverShutdown {
                driver: self.name().to_string(),
                reason: format!("devices still active: {}", active.join(", ")),
            });
        }
        self.tracked.clear();
        self.adapters.lock().clear();
        Ok(())
    }
}

impl OphirDriver {
    /// Adapter for `port`, built on first use.
    fn adapter(
        &self,
        port: &str,
        this: &Weak<dyn Driver>,
    ) -> DaqResult<(Arc<Device>, SharedConnection)> {
        if let Some((adapter, connection)) = self.adapters.lock().get(port) {
            return Ok((adapter.clone(), connection.clone()));
        }

        let firmware = self.config.heads.get(port).map(|model| {
            Arc::new(Mutex::new(Firmware {
                serial: format!("{:06}", 100_000 + self.adapters.lock().len()),
                head: model.clone(),
                wavelength_nm: 532.0,
                reads: 0,
            }))
        });
        let connection = Arc::new(Connection {
            port: port.to_string(),
            line: self.ports.line_settings().clone(),
            firmware,
            stream: Mutex::new(None),
        });

        let name = format!("ophir@{port}");
        let backend = AdapterBackend {
            ports: self.ports.clone(),
            connection: connection.clone(),
        };

        let (read, write) = (connection.clone(), connection.clone());
        let (read_name, write_name) = (name.clone(), name.clone());
        let wavelength = Property::builder("wavelength", DataType::Float)
            .unit("nm")
            .range(190.0, 1100.0)
            .reader(move || {
                let connection = read.clone();
                let name = read_name.clone();
                async move {
                    let reply = connection.query(&name, "$WL").await?;
                    parse_float(&name, &reply).map(PropertyValue::Float)
                }
            })
            .writer(move |value| {
                let connection = write.clone();
                let name = write_name.clone();
                async move {
                    let nm = value.as_f64().ok_or_else(|| DaqError::InvalidValue {
                        name: "wavelength".to_string(),
                        reason: format!("expected a number, got {value}"),
                    })?;
                    connection.query(&name, &format!("$WL{nm}")).await?;
                    Ok(())
                }
            })
            .build()?;

        let adapter = Device::builder(name, DeviceCategory::SensorAdapter, backend)
            .driver(this.clone())
            .property(wavelength)
            .build()?;
        self.adapters
            .lock()
            .insert(port.to_string(), (adapter.clone(), connection.clone()));
        Ok((adapter, connection))
    }
}

fn build_head(
    name: String,
    adapter: &Arc<Device>,
    connection: SharedConnection,
    this: Weak<dyn Driver>,
) -> DaqResult<Arc<Device>> {
    let reading = {
        let connection = connection.clone();
        let name = name.clone();
        Property::builder("reading", DataType::Float)
            .unit("mW")
            .volatile()
            .reader(move || {
                let connection = connection.clone();
                let name = name.clone();
                async move {
                    let reply = connection.query(&name, "$SP").await?;
                    parse_float(&name, &reply).map(PropertyValue::Float)
                }
            })
            .build()?
    };

    Device::builder(name, DeviceCategory::PowerSensor, HeadBackend { connection })
        .driver(this)
        .parent(adapter)
        .property(reading)
        .build()
}

fn parse_float(device: &str, reply: &str) -> DaqResult<f64> {
    reply.trim().parse().map_err(|_| {
        DaqError::Hardware(anyhow::anyhow!("{device} sent a malformed number: {reply:?}"))
    })
}

// =============================================================================
// Serial link
// =============================================================================

/// Link to one adapter, shared by the adapter and its head.
struct Connection {
    port: String,
    line: LineSettings,
    /// `None`: nothing answers on the port
    firmware: Option<Arc<Mutex<Firmware>>>,
    stream: Mutex<Option<SharedPort>>,
}

type SharedConnection = Arc<Connection>;

impl Connection {
    /// Open the pipe and start the firmware behind it.
    fn connect(&self) {
        let (client, device) = tokio::io::duplex(256);
        tokio::spawn(serve(device, self.firmware.clone()));
        *self.stream.lock() = Some(wrap_shared(Box::new(client)));
    }

    /// Drop the pipe; the firmware task ends with it.
    fn disconnect(&self) {
        self.stream.lock().take();
    }

    /// Send one command and return the reply without its `*` marker.
    async fn query(&self, device: &str, command: &str) -> DaqResult<String> {
        let stream = self
            .stream
            .lock()
            .clone()
            .ok_or_else(|| not_connected(device))?;
        write_line(&stream, command, "\r").await?;
        let reply = read_until(&stream, TERMINATOR, self.line.read_timeout, &self.line.retry).await?;
        match reply.strip_prefix('*') {
            Some(payload) => Ok(payload.trim().to_string()),
            None => Err(DaqError::Hardware(anyhow::anyhow!(
                "{device} rejected {command}: {reply}"
            ))),
        }
    }
}

/// Simulated adapter firmware.
#[derive(Debug)]
struct Firmware {
    serial: String,
    /// Head model, empty when no head is plugged in
    head: String,
    wavelength_nm: f64,
    reads: u64,
}

impl Firmware {
    fn answer(&mut self, command: &str) -> String {
        match command {
            "$II" => format!("* USBI {} USBI", self.serial),
            "$VE" => "* 1.05".to_string(),
            "$HT" if self.head.is_empty() => "* XX".to_string(),
            "$HT" => "* SI".to_string(),
            "$HI" if self.head.is_empty() => "* XX 0 NONE 0".to_string(),
            "$HI" => format!("* SI {}H {} 0", self.serial, self.head),
            "$SP" if self.head.is_empty() => "?NO HEAD".to_string(),
            "$SP" => {
                self.reads += 1;
                // responsivity grows with wavelength, plus slow drift
                let power = 2.0 * self.wavelength_nm / 1000.0 + 0.01 * self.reads as f64;
                format!("*{power:.4E}")
            }
            "$WL" => format!("* {}", self.wavelength_nm),
            _ => match command.strip_prefix("$WL").map(str::parse::<f64>) {
                Some(Ok(nm)) => {
                    self.wavelength_nm = nm;
                    "*".to_string()
                }
                Some(Err(_)) => "?BAD PARAMETER".to_string(),
                None => "?UNKNOWN COMMAND".to_string(),
            },
        }
    }
}

/// Answer commands on `stream` until the other end goes away. Without firmware
/// the port swallows every command.
async fn serve(stream: DuplexStream, firmware: Option<Arc<Mutex<Firmware>>>) {
    let (read, mut write) = tokio::io::split(stream);
    let mut reader = BufReader::new(read);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(TERMINATOR, &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let Some(firmware) = &firmware else {
            continue;
        };
        let command = String::from_utf8_lossy(&buf);
        let mut reply = firmware.lock().answer(command.trim_end_matches('\r'));
        reply.push('\r');
        if write.write_all(reply.as_bytes()).await.is_err() {
            break;
        }
    }
    trace!("adapter link closed");
}

// =============================================================================
// Backends
// =============================================================================

struct AdapterBackend {
    ports: Arc<SerialPortManager>,
    connection: SharedConnection,
}

#[async_trait]
impl DeviceBackend for AdapterBackend {
    async fn open(&self, device: &Device) -> DaqResult<()> {
        let port = &self.connection.port;
        self.ports
            .request_port(port, device.name())
            .await
            .map_err(|err| match err {
                DaqError::PortAlreadyAssigned { .. } => {
                    DaqError::incompatible(device.name(), err.to_string())
                }
                other => other,
            })?;

        self.connection.connect();
        let identity = match self.connection.query(device.name(), "$II").await {
            Ok(reply) if reply.split_whitespace().count() == 3 => Ok(reply),
            Ok(reply) => Err(DaqError::incompatible(
                device.name(),
                format!("unexpected identity {reply:?} on {port}"),
            )),
            Err(err @ DaqError::Timeout { .. }) => Err(DaqError::incompatible(
                device.name(),
                format!("no Ophir adapter on {port}: {err}"),
            )),
            Err(err) => Err(err),
        };
        let identity = match identity {
            Ok(identity) => identity,
            Err(err) => {
                self.connection.disconnect();
                self.ports.release_port(port)?;
                return Err(err);
            }
        };

        self.ports.mark_port(port, device.name())?;
        debug!(device = %device.name(), %port, %identity, "adapter connected");
        Ok(())
    }

    async fn close(&self, device: &Device) -> DaqResult<()> {
        self.connection.disconnect();
        match self.ports.release_port(&self.connection.port) {
            Err(DaqError::PortNotFound(port)) => {
                warn!(device = %device.name(), %port, "port vanished before close");
                Ok(())
            }
            other => other,
        }
    }

    async fn info(&self, device: &Device) -> DaqResult<DeviceInfo> {
        let identity = self.connection.query(device.name(), "$II").await?;
        let version = self.connection.query(device.name(), "$VE").await?;
        let fields: Vec<&str> = identity.split_whitespace().collect();
        match fields.as_slice() {
            [_, serial, model] => Ok(DeviceInfo::new("Ophir", *model)
                .with_version(version)
                .with_serial_number(*serial)),
            _ => Err(DaqError::incompatible(
                device.name(),
                format!("unable to parse identity {identity:?}"),
            )),
        }
    }
}

struct HeadBackend {
    connection: SharedConnection,
}

#[async_trait]
impl DeviceBackend for HeadBackend {
    async fn open(&self, device: &Device) -> DaqResult<()> {
        let head_type = self.connection.query(device.name(), "$HT").await?;
        match head_type.split_whitespace().next() {
            Some("SI") => Ok(()),
            _ => Err(DaqError::incompatible(device.name(), "no sensor head attached")),
        }
    }

    async fn info(&self, device: &Device) -> DaqResult<DeviceInfo> {
        let reply = self.connection.query(device.name(), "$HI").await?;
        let fields: Vec<&str> = reply.split_whitespace().collect();
        match fields.as_slice() {
            [_, serial, model, _] => {
                Ok(DeviceInfo::new("Ophir", *model).with_serial_number(*serial))
            }
            _ => Err(DaqError::incompatible(
                device.name(),
                format!("unable to parse head info {reply:?}"),
            )),
        }
    }
}
