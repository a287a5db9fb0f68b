//! Serial port arbitration.
//!
//! Several drivers may probe the same OS port while looking for their hardware.
//! The [`SerialPortManager`] serializes that with a two-phase protocol per port:
//!
//! ```text
//!            request_port(owner)           mark_port(owner)
//!   Free ───────────────────────► Testing ─────────────────► Assigned
//!    ▲                               │                          │
//!    └───────── release_port ────────┴──────────────────────────┘
//! ```
//!
//! A second requester waits while a port is `Testing` by someone else and fails
//! with [`DaqError::PortAlreadyAssigned`] once it is `Assigned` to someone else.
//! Every state change wakes all waiters.

pub mod io;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::config::SerialConfig;
use crate::error::{DaqError, DaqResult};
use crate::error_recovery::RetryPolicy;

pub use io::{query, read_until, wrap_shared, write_line, DynSerial, SerialPortIO, SharedPort};

#[cfg(feature = "serial")]
pub use io::open_port;

/// Claim state of one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortState {
    /// Nobody holds the port
    Free,
    /// An owner is probing the port
    Testing(String),
    /// The port belongs to an owner
    Assigned(String),
}

impl PortState {
    /// Current holder, if any.
    pub fn owner(&self) -> Option<&str> {
        match self {
            Self::Free => None,
            Self::Testing(owner) | Self::Assigned(owner) => Some(owner),
        }
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => f.write_str("free"),
            Self::Testing(owner) => write!(f, "testing by '{owner}'"),
            Self::Assigned(owner) => write!(f, "assigned to '{owner}'"),
        }
    }
}

/// Timing and framing shared by every line exchange on managed ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineSettings {
    /// Per-attempt read timeout
    pub read_timeout: Duration,
    /// Attempts and back-off for reads
    pub retry: RetryPolicy,
    /// Baud rate for opened ports
    pub baud_rate: u32,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self::from(&SerialConfig::default())
    }
}

impl From<&SerialConfig> for LineSettings {
    fn from(config: &SerialConfig) -> Self {
        Self {
            read_timeout: config.read_timeout,
            retry: config.retry_policy(),
            baud_rate: config.baud_rate,
        }
    }
}

/// Source of the OS port list.
pub trait PortEnumerator: Send + Sync {
    /// Names of the ports currently present.
    fn enumerate(&self) -> DaqResult<Vec<String>>;
}

/// Fixed port list, replaceable at runtime to simulate hotplug.
#[derive(Debug, Default)]
pub struct StaticPorts {
    ports: Mutex<Vec<String>>,
}

impl StaticPorts {
    /// Enumerator returning `ports`.
    pub fn new<I, S>(ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ports: Mutex::new(ports.into_iter().map(Into::into).collect()),
        }
    }

    /// Replace the list returned by the next enumeration.
    pub fn set<I, S>(&self, ports: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.ports.lock() = ports.into_iter().map(Into::into).collect();
    }
}

impl PortEnumerator for StaticPorts {
    fn enumerate(&self) -> DaqResult<Vec<String>> {
        Ok(self.ports.lock().clone())
    }
}

impl<T: PortEnumerator> PortEnumerator for Arc<T> {
    fn enumerate(&self) -> DaqResult<Vec<String>> {
        (**self).enumerate()
    }
}

/// Ports reported by the operating system.
#[cfg(feature = "serial")]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

#[cfg(feature = "serial")]
impl PortEnumerator for SystemPorts {
    fn enumerate(&self) -> DaqResult<Vec<String>> {
        let ports = serialport::available_ports().map_err(anyhow::Error::from)?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }
}

#[derive(Debug)]
struct SerialPort {
    state: Mutex<PortState>,
    notify: Notify,
}

impl SerialPort {
    fn new() -> Self {
        Self {
            state: Mutex::new(PortState::Free),
            notify: Notify::new(),
        }
    }
}

/// Arbiter for shared serial ports.
pub struct SerialPortManager {
    ports: Mutex<HashMap<String, Arc<SerialPort>>>,
    enumerator: Box<dyn PortEnumerator>,
    line: LineSettings,
}

impl fmt::Debug for SerialPortManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialPortManager")
            .field("ports", &self.list_ports())
            .field("line", &self.line)
            .finish_non_exhaustive()
    }
}

impl SerialPortManager {
    /// Manager backed by `enumerator`, with an initial refresh.
    pub fn new(enumerator: impl PortEnumerator + 'static) -> DaqResult<Self> {
        let manager = Self {
            ports: Mutex::new(HashMap::new()),
            enumerator: Box::new(enumerator),
            line: LineSettings::default(),
        };
        manager.refresh()?;
        Ok(manager)
    }

    /// Replace the line timing handed to drivers.
    #[must_use]
    pub fn with_line_settings(mut self, line: LineSettings) -> Self {
        self.line = line;
        self
    }

    /// Line timing drivers use when talking to instruments on managed ports.
    pub fn line_settings(&self) -> &LineSettings {
        &self.line
    }

    /// Manager over a fixed port list.
    pub fn with_static_ports<I, S>(ports: I) -> DaqResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(StaticPorts::new(ports))
    }

    /// Manager as described by the `[serial]` configuration section.
    ///
    /// Without `static_ports` the OS is enumerated; when built without the
    /// `serial` feature that yields no ports.
    pub fn from_config(config: &SerialConfig) -> DaqResult<Self> {
        let manager = match &config.static_ports {
            Some(ports) => Self::with_static_ports(ports.iter().cloned())?,
            None => Self::system()?,
        };
        Ok(manager.with_line_settings(LineSettings::from(config)))
    }

    #[cfg(feature = "serial")]
    fn system() -> DaqResult<Self> {
        Self::new(SystemPorts)
    }

    #[cfg(not(feature = "serial"))]
    fn system() -> DaqResult<Self> {
        tracing::warn!("built without the `serial` feature, no OS ports will be enumerated");
        Self::new(StaticPorts::default())
    }

    /// Re-enumerate ports. New ports start free; vanished ports are dropped.
    ///
    /// Returns the number of known ports.
    pub fn refresh(&self) -> DaqResult<usize> {
        let present: HashSet<String> = self.enumerator.enumerate()?.into_iter().collect();

        let mut ports = self.ports.lock();
        ports.retain(|name, port| {
            if present.contains(name) {
                return true;
            }
            let state = port.state.lock().clone();
            if state != PortState::Free {
                error!(port = %name, %state, "serial port still held, but the OS cannot find it");
            }
            port.notify.notify_waiters();
            false
        });
        for name in present {
            ports
                .entry(name)
                .or_insert_with(|| Arc::new(SerialPort::new()));
        }

        debug!(count = ports.len(), "serial port(s) discovered");
        Ok(ports.len())
    }

    /// Known port names, sorted.
    pub fn list_ports(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ports.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Current state of a port.
    pub fn port_state(&self, name: &str) -> Option<PortState> {
        self.ports.lock().get(name).map(|p| p.state.lock().clone())
    }

    fn port(&self, name: &str) -> DaqResult<Arc<SerialPort>> {
        self.ports
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| DaqError::PortNotFound(name.to_string()))
    }

    /// Start testing `name` on behalf of `owner`.
    ///
    /// Waits while another owner is testing the port. Succeeds immediately if
    /// `owner` already holds it.
    pub async fn request_port(&self, name: &str, owner: &str) -> DaqResult<()> {
        debug!(port = name, owner, "requesting port");
        loop {
            let port = self.port(name)?;
            let notified = port.notify.notified();
            tokio::pin!(notified);
            // register before inspecting the state so no release is missed
            notified.as_mut().enable();

            {
                let mut state = port.state.lock();
                match &*state {
                    PortState::Free => {
                        *state = PortState::Testing(owner.to_string());
                        debug!(port = name, owner, "port acquired");
                        return Ok(());
                    }
                    PortState::Testing(holder) | PortState::Assigned(holder)
                        if holder == owner =>
                    {
                        return Ok(());
                    }
                    PortState::Assigned(holder) => {
                        return Err(DaqError::PortAlreadyAssigned {
                            port: name.to_string(),
                            owner: holder.clone(),
                        });
                    }
                    PortState::Testing(holder) => {
                        debug!(port = name, owner, holder = %holder, "waiting for other tests");
                    }
                }
            }

            notified.await;
        }
    }

    /// Commit the port to `owner` after a successful probe.
    ///
    /// The port must be held by `owner` already; marking a free port is a
    /// consistency error since nobody tested it.
    pub fn mark_port(&self, name: &str, owner: &str) -> DaqResult<()> {
        let port = self.port(name)?;
        {
            let mut state = port.state.lock();
            match &*state {
                PortState::Free => {
                    error!(port = name, owner, "marking a port that was never requested");
                    return Err(DaqError::Consistency(format!(
                        "port '{name}' must be requested by '{owner}' before it is marked"
                    )));
                }
                PortState::Testing(holder) | PortState::Assigned(holder) if holder != owner => {
                    return Err(DaqError::PortAlreadyAssigned {
                        port: name.to_string(),
                        owner: holder.clone(),
                    });
                }
                _ => *state = PortState::Assigned(owner.to_string()),
            }
        }
        debug!(port = name, owner, "port marked");
        port.notify.notify_waiters();
        Ok(())
    }

    /// Return the port to the pool and wake all waiters.
    pub fn release_port(&self, name: &str) -> DaqResult<()> {
        let port = self.port(name)?;
        *port.state.lock() = PortState::Free;
        debug!(port = name, "port released");
        port.notify.notify_waiters();
        Ok(())
    }
}
