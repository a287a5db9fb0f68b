//! Driver registration table.
//!
//! Drivers are registered explicitly as [`DriverFactory`] entries. A refresh
//! constructs and initializes one driver per factory and indexes it under every
//! category it declares:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                   DriverRegistry                     │
//! │  factories: [mock_mds, mock_ophir, mock_camera, ..]  │
//! │  drivers:   [MdsDriver, OphirDriver, ..]             │
//! ├──────────────────────────────────────────────────────┤
//! │  AcustoOpticalModulator -> [MdsDriver]               │
//! │  SensorAdapter          -> [OphirDriver]             │
//! │  PowerSensor            -> [OphirDriver]             │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Refreshing shuts down drivers that are idle. Drivers with active devices are
//! kept (and reused instead of rebuilt) unless the refresh is forced.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error, info, warn};

use super::DriverRef;
use crate::config::DriversConfig;
use crate::device::DeviceCategory;
use crate::error::{DaqError, DaqResult};

/// Constructor entry for one driver type.
pub trait DriverFactory: Send + Sync + 'static {
    /// Driver type name, as used in the `[drivers]` configuration section.
    fn driver_type(&self) -> &'static str;

    /// Categories the built driver will declare.
    fn categories(&self) -> &'static [DeviceCategory];

    /// Check per-driver options before building. Default: accept anything.
    fn validate(&self, _config: &toml::Value) -> DaqResult<()> {
        Ok(())
    }

    /// Construct the driver. `initialize` is called by the registry afterwards.
    fn build(&self, config: toml::Value) -> BoxFuture<'static, DaqResult<DriverRef>>;
}

struct LiveDriver {
    driver_type: &'static str,
    driver: DriverRef,
}

/// Registered driver factories and the drivers built from them.
pub struct DriverRegistry {
    factories: Vec<Arc<dyn DriverFactory>>,
    config: DriversConfig,
    drivers: Vec<LiveDriver>,
    by_category: HashMap<DeviceCategory, Vec<DriverRef>>,
}

impl DriverRegistry {
    /// Registry with default driver configuration.
    pub fn new() -> Self {
        Self::with_config(DriversConfig::default())
    }

    /// Registry honoring the `[drivers]` configuration section.
    pub fn with_config(config: DriversConfig) -> Self {
        Self {
            factories: Vec::new(),
            config,
            drivers: Vec::new(),
            by_category: HashMap::new(),
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Add a factory. Driver types must be unique.
    pub fn register_factory(&mut self, factory: impl DriverFactory) -> DaqResult<()> {
        let driver_type = factory.driver_type();
        if self.factories.iter().any(|f| f.driver_type() == driver_type) {
            return Err(DaqError::Configuration(format!(
                "driver type '{driver_type}' is registered twice"
            )));
        }
        debug!(driver_type, categories = ?factory.categories(), "registered driver factory");
        self.factories.push(Arc::new(factory));
        Ok(())
    }

    /// Registered driver types, in registration order.
    pub fn factory_types(&self) -> Vec<&'static str> {
        self.factories.iter().map(|f| f.driver_type()).collect()
    }

    // =========================================================================
    // Refresh
    // =========================================================================

    /// Rebuild the driver list.
    ///
    /// Idle drivers are shut down; drivers with active devices are kept and reused
    /// unless `force_reload` is set. Per-driver failures are logged and skipped.
    /// Returns the number of live drivers.
    pub async fn refresh(&mut self, force_reload: bool) -> usize {
        let kept = self.shutdown_drivers(force_reload).await;

        let factories = self.factories.clone();
        for factory in factories {
            let driver_type = factory.driver_type();

            if self.config.is_disabled(driver_type) {
                info!(driver_type, "driver disabled by configuration");
                continue;
            }

            if let Some(live) = kept.iter().find(|l| l.driver_type == driver_type) {
                debug!(driver_type, "driver still active, reusing");
                self.drivers.push(LiveDriver {
                    driver_type,
                    driver: live.driver.clone(),
                });
                continue;
            }

            match self.build_driver(factory.as_ref()).await {
                Ok(driver) => self.drivers.push(LiveDriver { driver_type, driver }),
                Err(err) => error!(driver_type, error = %err, "unable to initialize driver"),
            }
        }

        self.reindex();
        info!(count = self.drivers.len(), "driver registry refreshed");
        self.drivers.len()
    }

    async fn build_driver(&self, factory: &dyn DriverFactory) -> DaqResult<DriverRef> {
        let driver_type = factory.driver_type();
        let options = self.config.options_for(driver_type);
        factory.validate(&options)?;

        let driver = factory.build(options).await?;
        driver.initialize().await.map_err(|err| DaqError::DriverInitialize {
            driver: driver_type.to_string(),
            reason: err.to_string(),
        })?;
        Ok(driver)
    }

    /// Shut down drivers, returning the ones that must be kept.
    async fn shutdown_drivers(&mut self, force: bool) -> Vec<LiveDriver> {
        let mut kept = Vec::new();
        for live in self.drivers.drain(..) {
            let name = live.driver.name().to_string();
            if live.driver.is_active() && !force {
                warn!(driver = %name, "driver is still active");
                kept.push(live);
                continue;
            }
            if let Err(err) = live.driver.shutdown().await {
                error!(driver = %name, error = %err, "driver failed to shutdown");
                if !force {
                    kept.push(live);
                    continue;
                }
                warn!(driver = %name, "dropping driver after failed forced shutdown");
            }
        }
        self.by_category.clear();
        if !kept.is_empty() {
            debug!(count = kept.len(), "driver(s) still active");
        }
        kept
    }

    fn reindex(&mut self) {
        self.by_category.clear();
        for live in &self.drivers {
            let categories = live.driver.supported_categories();
            debug!(driver = live.driver.name(), count = categories.len(), "indexing driver");
            for category in categories {
                self.by_category
                    .entry(*category)
                    .or_default()
                    .push(live.driver.clone());
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// All live drivers, or the drivers producing `category`.
    pub fn query_drivers(&self, category: Option<DeviceCategory>) -> Vec<DriverRef> {
        match category {
            None => self.drivers.iter().map(|l| l.driver.clone()).collect(),
            Some(category) => self.by_category.get(&category).cloned().unwrap_or_default(),
        }
    }

    /// Live driver built from the given factory type.
    pub fn driver(&self, driver_type: &str) -> Option<DriverRef> {
        self.drivers
            .iter()
            .find(|l| l.driver_type == driver_type)
            .map(|l| l.driver.clone())
    }

    /// Number of live drivers.
    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    /// True if no driver is live.
    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Forced shutdown of every driver, for process teardown.
    pub async fn shutdown(&mut self) {
        self.shutdown_drivers(true).await;
        info!("all drivers shut down");
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
