//! Alias -> device requirements.
//!
//! Callers declare what they need as `alias -> category` pairs ("I need an
//! `AcustoOpticalModulator` called `aotf`"). The registry keeps one entry per
//! alias and binds a concrete device to it once one is found.
//!
//! Binding claims the device, which keeps it (and its ancestors) active.
//! Unbinding or dropping a requirement only clears the claim; closing hardware is
//! left to whoever receives the device back.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::device::{Device, DeviceCategory};
use crate::error::{DaqError, DaqResult};

/// One alias, its declared category and the bound device, if any.
#[derive(Debug, Clone)]
pub struct RequirementEntry {
    alias: String,
    category: DeviceCategory,
    device: Option<Arc<Device>>,
}

impl RequirementEntry {
    fn new(alias: String, category: DeviceCategory) -> Self {
        Self {
            alias,
            category,
            device: None,
        }
    }

    /// Alias name.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Required category.
    pub fn category(&self) -> DeviceCategory {
        self.category
    }

    /// Bound device.
    pub fn device(&self) -> Option<&Arc<Device>> {
        self.device.as_ref()
    }

    /// True once a device is bound.
    pub fn is_bound(&self) -> bool {
        self.device.is_some()
    }
}

/// The requirement table.
#[derive(Debug, Default)]
pub struct RequirementRegistry {
    entries: BTreeMap<String, RequirementEntry>,
}

impl RequirementRegistry {
    /// Empty registry; trivially satisfied.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with requirements.
    pub fn with_requirements<I, S>(requirements: I) -> Self
    where
        I: IntoIterator<Item = (S, DeviceCategory)>,
        S: Into<String>,
    {
        let mut registry = Self::new();
        registry.update_requirements(requirements);
        registry
    }

    /// Replace the requirement set.
    ///
    /// Entries whose alias and category are unchanged keep their binding. Changed
    /// and removed entries lose it. Devices that lost their binding are unclaimed
    /// and returned; they are not closed.
    pub fn update_requirements<I, S>(&mut self, requirements: I) -> Vec<Arc<Device>>
    where
        I: IntoIterator<Item = (S, DeviceCategory)>,
        S: Into<String>,
    {
        let mut previous = std::mem::take(&mut self.entries);
        let mut dropped = Vec::new();
        for (alias, category) in requirements {
            let alias = alias.into();
            let entry = match previous.remove(&alias) {
                Some(entry) if entry.category == category => entry,
                Some(entry) => {
                    dropped.push(entry);
                    RequirementEntry::new(alias.clone(), category)
                }
                None => RequirementEntry::new(alias.clone(), category),
            };
            if let Some(replaced) = self.entries.insert(alias, entry) {
                dropped.push(replaced);
            }
        }
        dropped.extend(previous.into_values());

        let orphans: Vec<Arc<Device>> = dropped
            .into_iter()
            .filter_map(|entry| entry.device)
            .collect();
        for device in &orphans {
            device.unclaim();
            debug!(device = %device.name(), "requirement dropped, device orphaned");
        }
        info!(
            requirements = self.entries.len(),
            orphaned = orphans.len(),
            "requirements updated"
        );
        orphans
    }

    /// Bind `device` to `alias` and claim it.
    pub fn link(&mut self, alias: &str, device: Arc<Device>) -> DaqResult<()> {
        let entry = self
            .entries
            .get_mut(alias)
            .ok_or_else(|| DaqError::UnknownAlias(alias.to_string()))?;

        if device.category() != entry.category {
            return Err(DaqError::CategoryMismatch {
                alias: alias.to_string(),
                expected: entry.category,
                actual: device.category(),
            });
        }
        if entry.device.is_some() {
            return Err(DaqError::AliasAlreadyLinked(alias.to_string()));
        }
        if device.is_claimed() {
            return Err(DaqError::DeviceBusy(device.name().to_string()));
        }

        device.claim();
        debug!(alias, device = %device.name(), "linked");
        entry.device = Some(device);
        Ok(())
    }

    /// Clear the binding of `alias`, unclaim the device and hand it back.
    pub fn unlink(&mut self, alias: &str) -> DaqResult<Option<Arc<Device>>> {
        let entry = self
            .entries
            .get_mut(alias)
            .ok_or_else(|| DaqError::UnknownAlias(alias.to_string()))?;

        let device = entry.device.take();
        if let Some(device) = &device {
            device.unclaim();
            debug!(alias, device = %device.name(), "unlinked");
        }
        Ok(device)
    }

    /// True when every alias has a device.
    pub fn is_satisfied(&self) -> bool {
        self.entries.values().all(RequirementEntry::is_bound)
    }

    /// Aliases still waiting for a device, with their categories.
    pub fn unsatisfied(&self) -> Vec<(String, DeviceCategory)> {
        self.entries
            .values()
            .filter(|entry| !entry.is_bound())
            .map(|entry| (entry.alias.clone(), entry.category))
            .collect()
    }

    /// Entry for `alias`.
    pub fn get(&self, alias: &str) -> Option<&RequirementEntry> {
        self.entries.get(alias)
    }

    /// Device bound to `alias`.
    pub fn device(&self, alias: &str) -> Option<Arc<Device>> {
        self.entries.get(alias).and_then(|e| e.device.clone())
    }

    /// Entries in alias order.
    pub fn iter(&self) -> impl Iterator<Item = &RequirementEntry> {
        self.entries.values()
    }

    /// Number of aliases.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is required.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
