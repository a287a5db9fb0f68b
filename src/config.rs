//! Configuration loading using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `DAQ_ORCH_`, nested keys separated by `__`
//!    (e.g. `DAQ_ORCH_APPLICATION__LOG_LEVEL=debug`)
//!
//! ```toml
//! [application]
//! name = "bench-2"
//! log_level = "info"
//!
//! [serial]
//! read_timeout = "500ms"
//! max_retries = 3
//! retry_delay = "100ms"
//! static_ports = ["/dev/ttyUSB0", "/dev/ttyUSB1"]
//!
//! [drivers]
//! disabled = ["mock_camera"]
//!
//! [drivers.options.mock_mds]
//! ports = ["/dev/ttyUSB0"]
//!
//! [requirements]
//! aotf = "AcustoOpticalModulator"
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::device::DeviceCategory;
use crate::error::{DaqError, DaqResult};
use crate::error_recovery::RetryPolicy;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/daq-orchestrator.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "DAQ_ORCH_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial transport settings
    #[serde(default)]
    pub serial: SerialConfig,
    /// Driver selection and per-driver options
    #[serde(default)]
    pub drivers: DriversConfig,
    /// Alias -> category requirements
    #[serde(default)]
    pub requirements: BTreeMap<String, DeviceCategory>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// Serial transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Per-attempt read timeout
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Total read attempts before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between read attempts
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Default baud rate for opened ports
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Fixed port list used instead of OS enumeration
    #[serde(default)]
    pub static_ports: Option<Vec<String>>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            read_timeout: default_read_timeout(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            baud_rate: default_baud_rate(),
            static_ports: None,
        }
    }
}

impl SerialConfig {
    /// Retry policy for line reads.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries,
            backoff_delay: self.retry_delay,
        }
    }
}

/// Driver selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriversConfig {
    /// Driver types that are never constructed
    #[serde(default)]
    pub disabled: Vec<String>,
    /// Per-driver options, keyed by driver type
    #[serde(default)]
    pub options: HashMap<String, toml::Value>,
}

impl DriversConfig {
    /// True if `driver_type` is listed as disabled.
    pub fn is_disabled(&self, driver_type: &str) -> bool {
        self.disabled.iter().any(|d| d == driver_type)
    }

    /// Options for `driver_type`, an empty table when none are configured.
    pub fn options_for(&self, driver_type: &str) -> toml::Value {
        self.options
            .get(driver_type)
            .cloned()
            .unwrap_or_else(|| toml::Value::Table(toml::map::Map::new()))
    }
}

// Default value functions
fn default_name() -> String {
    "daq-orchestrator".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_read_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_baud_rate() -> u32 {
    9600
}

/// Accepted log levels.
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl AppConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> DaqResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> DaqResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment).
    pub fn from_toml_str(source: &str) -> DaqResult<Self> {
        let config: Self = Figment::new().merge(Toml::string(source)).extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> DaqResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        if self.serial.read_timeout.is_zero() {
            return Err(DaqError::Configuration(
                "serial.read_timeout must be greater than zero".to_string(),
            ));
        }
        if self.serial.max_retries == 0 {
            return Err(DaqError::Configuration(
                "serial.max_retries must be at least 1".to_string(),
            ));
        }

        if let Some(ports) = &self.serial.static_ports {
            let mut seen = HashSet::new();
            for port in ports {
                if !seen.insert(port) {
                    return Err(DaqError::Configuration(format!(
                        "Duplicate serial port: {port}"
                    )));
                }
            }
        }

        let mut disabled = HashSet::new();
        for driver in &self.drivers.disabled {
            if !disabled.insert(driver) {
                return Err(DaqError::Configuration(format!(
                    "Driver '{driver}' is disabled twice"
                )));
            }
        }

        if let Some(alias) = self.requirements.keys().find(|a| a.trim().is_empty()) {
            return Err(DaqError::Configuration(format!(
                "Invalid requirement alias '{alias}'"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.serial.retry_policy(), RetryPolicy::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full() {
        let config = AppConfig::from_toml_str(
            r#"
            [application]
            name = "bench"
            log_level = "debug"

            [serial]
            read_timeout = "250ms"
            max_retries = 5
            static_ports = ["COM1", "COM2"]

            [drivers]
            disabled = ["mock_camera"]

            [drivers.options.mock_mds]
            settle = "5ms"

            [requirements]
            aotf = "AcustoOpticalModulator"
            meter = "PowerSensor"
            "#,
        )
        .unwrap();

        assert_eq!(config.serial.read_timeout, Duration::from_millis(250));
        assert_eq!(config.serial.max_retries, 5);
        assert!(config.drivers.is_disabled("mock_camera"));
        assert!(config.drivers.options_for("mock_mds").get("settle").is_some());
        assert!(config.drivers.options_for("other").as_table().is_some());
        assert_eq!(
            config.requirements.get("aotf"),
            Some(&DeviceCategory::AcustoOpticalModulator)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_category_is_rejected() {
        let result = AppConfig::from_toml_str(
            r#"
            [requirements]
            toaster = "Toaster"
            "#,
        );
        assert!(matches!(result, Err(DaqError::Config(_))));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::default();
        config.application.log_level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_static_port() {
        let mut config = AppConfig::default();
        config.serial.static_ports = Some(vec!["COM1".into(), "COM1".into()]);
        assert!(config.validate().is_err());
    }
}
