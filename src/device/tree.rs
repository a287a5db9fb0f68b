//! Device lifecycle and the parent/child tree.
//!
//! Open cascades upward, close cascades both ways:
//!
//! ```text
//! child.open()   ──► parent.open() ──► backend.open() ──► parent.register(child)
//! child.close()  ──► (force) close children ──► backend.close()
//!                ──► parent.unregister(child)
//!                ──► parent.close() if it has no children left or opening,
//!                    is unclaimed and is not already closing
//! ```
//!
//! A device only ever references its parent weakly; the parent owns its registered
//! children. The lifecycle state and child list sit behind `parking_lot` mutexes that
//! are released before every suspension point.
//!
//! Siblings may open concurrently. An `open` that finds the device `Opening` or
//! `Closing` waits for that call to settle and then re-checks the state, and a
//! parent is never auto-closed while a child is between `parent.open()` and
//! registration.

use std::fmt;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::property::{Property, PropertyDescriptor, PropertyTable, PropertyValue};
use super::{DeviceBackend, DeviceCategory, DeviceInfo};
use crate::driver::Driver;
use crate::error::{DaqError, DaqResult};

/// Where a device is in its open/close cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Not opened (initial state)
    Closed,
    /// `open` in progress
    Opening,
    /// Ready for use
    Opened,
    /// `close` in progress
    Closing,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Opened => "opened",
            Self::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// One instrument instance in the device tree.
///
/// Always handled through `Arc<Device>`; see [`Device::builder`].
pub struct Device {
    id: Uuid,
    name: String,
    category: DeviceCategory,
    this: Weak<Device>,
    driver: Option<Weak<dyn Driver>>,
    parent: Option<Weak<Device>>,
    children: Mutex<Vec<Arc<Device>>>,
    state: Mutex<LifecycleState>,
    /// Woken whenever an open or close settles
    settled: Notify,
    /// Children between `open()` on this device and their registration
    pending_children: AtomicUsize,
    claimed: AtomicBool,
    properties: PropertyTable,
    backend: Box<dyn DeviceBackend>,
}

impl Device {
    /// Start building a device.
    pub fn builder(
        name: impl Into<String>,
        category: DeviceCategory,
        backend: impl DeviceBackend + 'static,
    ) -> DeviceBuilder {
        DeviceBuilder {
            name: name.into(),
            category,
            backend: Box::new(backend),
            driver: None,
            parent: None,
            properties: PropertyTable::new(),
            error: None,
        }
    }

    // =========================================================================
    // Identity
    // =========================================================================

    /// Unique instance id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Human readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared category.
    pub fn category(&self) -> DeviceCategory {
        self.category
    }

    /// Driver that produced this device, if it is still alive.
    pub fn driver(&self) -> Option<Arc<dyn Driver>> {
        self.driver.as_ref().and_then(Weak::upgrade)
    }

    /// Parent device, if any and still alive.
    pub fn parent(&self) -> Option<Arc<Device>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Snapshot of the registered children.
    pub fn children(&self) -> Vec<Arc<Device>> {
        self.children.lock().clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// True once `open` completed and until `close` starts.
    pub fn is_opened(&self) -> bool {
        self.state() == LifecycleState::Opened
    }

    /// True if the device was claimed by a requirement.
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }

    /// Mark the device as in use by a requirement.
    pub fn claim(&self) {
        self.claimed.store(true, Ordering::SeqCst);
    }

    /// Clear the claim. The device stays open.
    pub fn unclaim(&self) {
        self.claimed.store(false, Ordering::SeqCst);
    }

    /// Claimed, or any registered child active.
    pub fn is_active(&self) -> bool {
        self.is_claimed() || self.children.lock().iter().any(|child| child.is_active())
    }

    fn arc(&self) -> DaqResult<Arc<Device>> {
        self.this
            .upgrade()
            .ok_or_else(|| DaqError::Consistency(format!("device '{}' is being dropped", self.name)))
    }

    fn live_parent(&self) -> DaqResult<Option<Arc<Device>>> {
        match &self.parent {
            None => Ok(None),
            Some(weak) => weak
                .upgrade()
                .map(Some)
                .ok_or_else(|| DaqError::ParentDropped(self.name.clone())),
        }
    }

    fn conflict(&self, state: LifecycleState) -> DaqError {
        DaqError::LifecycleConflict {
            device: self.name.clone(),
            state: state.to_string(),
        }
    }

    // =========================================================================
    // Tree registration
    // =========================================================================

    /// Add a child. Registering the same instance twice is a consistency error.
    pub fn register(&self, child: Arc<Device>) -> DaqResult<()> {
        let mut children = self.children.lock();
        if children.iter().any(|c| c.id == child.id) {
            error!(parent = %self.name, child = %child.name, "child registered twice");
            return Err(DaqError::Consistency(format!(
                "'{}' is already a child of '{}'",
                child.name, self.name
            )));
        }
        debug!(parent = %self.name, child = %child.name, "registered child");
        children.push(child);
        Ok(())
    }

    /// Remove a child. Unregistering a non-member is a consistency error.
    pub fn unregister(&self, child: &Device) -> DaqResult<()> {
        let mut children = self.children.lock();
        match children.iter().position(|c| c.id == child.id) {
            Some(index) => {
                children.remove(index);
                debug!(parent = %self.name, child = %child.name, "unregistered child");
                Ok(())
            }
            None => {
                error!(parent = %self.name, child = %child.name, "unregistering unknown child");
                Err(DaqError::Consistency(format!(
                    "'{}' is not a child of '{}'",
                    child.name, self.name
                )))
            }
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the device, opening ancestors first. Idempotent.
    ///
    /// A call arriving while another open or close is in flight waits for it to
    /// settle. On hook failure the device stays closed and a parent opened only
    /// for this call is closed again.
    pub fn open(&self) -> BoxFuture<'_, DaqResult<()>> {
        Box::pin(async move {
            loop {
                let mut settled = pin!(self.settled.notified());
                {
                    let mut state = self.state.lock();
                    match *state {
                        LifecycleState::Opened => return Ok(()),
                        LifecycleState::Closed => {
                            *state = LifecycleState::Opening;
                            break;
                        }
                        other => {
                            debug!(device = %self.name, state = %other, "waiting for lifecycle call to settle");
                            // registered under the state lock so the settle cannot be missed
                            settled.as_mut().enable();
                        }
                    }
                }
                settled.await;
            }

            let result = self.open_sequence().await;
            self.settle(if result.is_ok() {
                LifecycleState::Opened
            } else {
                LifecycleState::Closed
            });
            result
        })
    }

    async fn open_sequence(&self) -> DaqResult<()> {
        let Some(parent) = self.live_parent()? else {
            self.backend.open(self).await?;
            self.children.lock().clear();
            debug!(device = %self.name, category = %self.category, "opened");
            return Ok(());
        };

        let result = {
            let _pending = PendingChild::new(&parent);
            self.open_under(&parent).await
        };
        if result.is_err() {
            release_parent(&parent).await;
        }
        result
    }

    async fn open_under(&self, parent: &Arc<Device>) -> DaqResult<()> {
        parent.open().await?;
        self.backend.open(self).await?;
        self.children.lock().clear();
        parent.register(self.arc()?)?;
        debug!(device = %self.name, category = %self.category, parent = %parent.name, "opened");
        Ok(())
    }

    fn settle(&self, state: LifecycleState) {
        *self.state.lock() = state;
        self.settled.notify_waiters();
    }

    /// Close the device.
    ///
    /// With active children this fails with [`DaqError::DeviceBusy`] unless `force`
    /// is set. Any registered children, active or not, are then closed
    /// concurrently before the device itself, so a plain `close` also closes idle
    /// children. A failing child is logged and does not stop the others.
    ///
    /// A close arriving while the device is opening or closing is a
    /// [`DaqError::LifecycleConflict`].
    pub fn close(&self, force: bool) -> BoxFuture<'_, DaqResult<()>> {
        self.close_inner(force, false)
    }

    /// Close only if nothing holds the device open anymore.
    fn close_unused(&self) -> BoxFuture<'_, DaqResult<()>> {
        self.close_inner(false, true)
    }

    fn close_inner(&self, force: bool, only_unused: bool) -> BoxFuture<'_, DaqResult<()>> {
        Box::pin(async move {
            {
                let mut state = self.state.lock();
                match *state {
                    LifecycleState::Closed => return Ok(()),
                    LifecycleState::Opened => {}
                    // someone else is already driving this device
                    _ if only_unused => return Ok(()),
                    other => return Err(self.conflict(other)),
                }

                if only_unused {
                    let in_use = self.is_claimed()
                        || self.pending_children.load(Ordering::SeqCst) > 0
                        || !self.children.lock().is_empty();
                    if in_use {
                        return Ok(());
                    }
                    debug!(device = %self.name, "last child left, closing parent");
                }

                let active = self
                    .children
                    .lock()
                    .iter()
                    .filter(|child| child.is_active())
                    .count();
                if active > 0 {
                    warn!(device = %self.name, active, force, "closing device with active children");
                    if !force {
                        return Err(DaqError::DeviceBusy(self.name.clone()));
                    }
                }
                *state = LifecycleState::Closing;
            }

            let children = self.children();
            if !children.is_empty() {
                let results = join_all(children.iter().map(|child| child.close(true))).await;
                for (child, result) in children.iter().zip(results) {
                    if let Err(err) = result {
                        error!(device = %self.name, child = %child.name, error = %err, "failed to close child");
                    }
                }
            }

            self.unclaim();
            if let Err(err) = self.backend.close(self).await {
                self.settle(LifecycleState::Opened);
                return Err(err);
            }
            self.settle(LifecycleState::Closed);
            debug!(device = %self.name, "closed");

            if let Some(parent) = self.parent() {
                parent.unregister(self)?;
                release_parent(&parent).await;
            }
            Ok(())
        })
    }

    /// Open, read the identification, close again.
    ///
    /// The device is closed regardless of whether `info` succeeded.
    pub async fn test_open(&self) -> DaqResult<DeviceInfo> {
        self.open().await?;
        let info = self.backend.info(self).await;
        let closed = self.close(false).await;
        let info = info?;
        closed?;
        debug!(device = %self.name, %info, "test open succeeded");
        Ok(info)
    }

    /// Identification of an opened device.
    pub async fn info(&self) -> DaqResult<DeviceInfo> {
        self.backend.info(self).await
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Descriptors of the properties defined on this device (ancestors excluded).
    pub fn properties(&self) -> Vec<PropertyDescriptor> {
        self.properties.descriptors()
    }

    /// Property defined on this device (ancestors excluded).
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    /// Device (self or nearest ancestor) defining `name`.
    fn property_owner(&self, name: &str) -> DaqResult<Arc<Device>> {
        let mut current = self.arc()?;
        loop {
            if current.properties.get(name).is_some() {
                return Ok(current);
            }
            match current.live_parent()? {
                Some(parent) => current = parent,
                None => return Err(DaqError::UnknownProperty(name.to_string())),
            }
        }
    }

    /// Read a property from this device or the nearest ancestor defining it.
    pub async fn get_property(&self, name: &str) -> DaqResult<PropertyValue> {
        let owner = self.property_owner(name)?;
        match owner.properties.get(name) {
            Some(property) => property.get().await,
            None => Err(DaqError::UnknownProperty(name.to_string())),
        }
    }

    /// Write a property locally; call [`Device::sync_property`] to commit.
    pub async fn set_property(&self, name: &str, value: PropertyValue) -> DaqResult<()> {
        let owner = self.property_owner(name)?;
        match owner.properties.get(name) {
            Some(property) => property.set(value).await,
            None => Err(DaqError::UnknownProperty(name.to_string())),
        }
    }

    /// Push a pending write of one property to hardware.
    pub async fn sync_property(&self, name: &str) -> DaqResult<()> {
        let owner = self.property_owner(name)?;
        match owner.properties.get(name) {
            Some(property) => property.sync().await,
            None => Err(DaqError::UnknownProperty(name.to_string())),
        }
    }

    /// Commit every dirty property defined on this device, in name order.
    ///
    /// A failing property is logged and does not stop the others; the names of
    /// all failures are reported together in [`DaqError::SyncFailed`].
    pub async fn sync_all(&self) -> DaqResult<()> {
        let mut failed = Vec::new();
        for property in self.properties.iter() {
            if let Err(err) = property.sync().await {
                error!(device = %self.name, property = property.name(), error = %err, "failed to sync property");
                failed.push(property.name().to_string());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(DaqError::SyncFailed {
                device: self.name.clone(),
                failed,
            })
        }
    }
}

/// Close `parent` if its last child just left and nothing else holds it open.
async fn release_parent(parent: &Arc<Device>) {
    if let Err(err) = parent.close_unused().await {
        error!(device = %parent.name, error = %err, "failed to close parent");
    }
}

/// Marks a child as on its way into `parent` for as long as it lives.
struct PendingChild<'a>(&'a Device);

impl<'a> PendingChild<'a> {
    fn new(parent: &'a Device) -> Self {
        parent.pending_children.fetch_add(1, Ordering::SeqCst);
        Self(parent)
    }
}

impl Drop for PendingChild<'_> {
    fn drop(&mut self) {
        self.0.pending_children.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("category", &self.category)
            .field("state", &self.state())
            .field("claimed", &self.is_claimed())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.category)
    }
}

/// Builder for [`Device`].
pub struct DeviceBuilder {
    name: String,
    category: DeviceCategory,
    backend: Box<dyn DeviceBackend>,
    driver: Option<Weak<dyn Driver>>,
    parent: Option<Weak<Device>>,
    properties: PropertyTable,
    error: Option<DaqError>,
}

impl DeviceBuilder {
    /// Record the producing driver.
    pub fn driver(mut self, driver: Weak<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Attach under a parent device.
    pub fn parent(mut self, parent: &Arc<Device>) -> Self {
        self.parent = Some(Arc::downgrade(parent));
        self
    }

    /// Define a property. Build fails on duplicate names.
    pub fn property(mut self, property: Property) -> Self {
        if let Err(err) = self.properties.insert(property) {
            self.error.get_or_insert(err);
        }
        self
    }

    /// Finish the device.
    pub fn build(self) -> DaqResult<Arc<Device>> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let Self {
            name,
            category,
            backend,
            driver,
            parent,
            properties,
            ..
        } = self;
        Ok(Arc::new_cyclic(|this| Device {
            id: Uuid::new_v4(),
            name,
            category,
            this: this.clone(),
            driver,
            parent,
            children: Mutex::new(Vec::new()),
            state: Mutex::new(LifecycleState::Closed),
            settled: Notify::new(),
            pending_children: AtomicUsize::new(0),
            claimed: AtomicBool::new(false),
            properties,
            backend,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DataType;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Hooks {
        opens: AtomicUsize,
        closes: AtomicUsize,
        fail_open: bool,
        fail_close: bool,
    }

    struct Recording(Arc<Hooks>);

    #[async_trait]
    impl DeviceBackend for Recording {
        async fn open(&self, _device: &Device) -> DaqResult<()> {
            self.0.opens.fetch_add(1, Ordering::SeqCst);
            if self.0.fail_open {
                return Err(DaqError::incompatible("dev", "no answer"));
            }
            Ok(())
        }

        async fn close(&self, _device: &Device) -> DaqResult<()> {
            self.0.closes.fetch_add(1, Ordering::SeqCst);
            if self.0.fail_close {
                return Err(anyhow::anyhow!("stuck").into());
            }
            Ok(())
        }

        async fn info(&self, device: &Device) -> DaqResult<DeviceInfo> {
            Ok(DeviceInfo::new("Acme", device.name()))
        }
    }

    fn device(name: &str, parent: Option<&Arc<Device>>) -> (Arc<Device>, Arc<Hooks>) {
        hooked(name, parent, Hooks::default())
    }

    fn hooked(name: &str, parent: Option<&Arc<Device>>, hooks: Hooks) -> (Arc<Device>, Arc<Hooks>) {
        let hooks = Arc::new(hooks);
        let mut builder = Device::builder(name, DeviceCategory::LinearAxis, Recording(hooks.clone()));
        if let Some(parent) = parent {
            builder = builder.parent(parent);
        }
        (builder.build().unwrap(), hooks)
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let (dev, hooks) = device("axis", None);
        dev.open().await.unwrap();
        dev.open().await.unwrap();
        assert!(dev.is_opened());
        assert_eq!(hooks.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_failure_leaves_closed() {
        let (parent, parent_hooks) = device("controller", None);
        let (child, _) = hooked(
            "axis",
            Some(&parent),
            Hooks {
                fail_open: true,
                ..Default::default()
            },
        );
        let err = child.open().await.unwrap_err();
        assert!(err.is_incompatible());
        assert_eq!(child.state(), LifecycleState::Closed);
        // parent was opened only for this child
        assert!(!parent.is_opened());
        assert_eq!(parent_hooks.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_hook_failure_keeps_opened() {
        let (dev, _) = hooked(
            "axis",
            None,
            Hooks {
                fail_close: true,
                ..Default::default()
            },
        );
        dev.open().await.unwrap();
        dev.claim();
        assert!(dev.close(false).await.is_err());
        assert!(dev.is_opened());
        // claim was cleared before the hook ran
        assert!(!dev.is_claimed());
    }

    #[tokio::test]
    async fn test_register_twice_is_consistency_error() {
        let (parent, _) = device("controller", None);
        let (child, _) = device("axis", None);
        parent.register(child.clone()).unwrap();
        assert!(matches!(
            parent.register(child.clone()),
            Err(DaqError::Consistency(_))
        ));
        parent.unregister(&child).unwrap();
        assert!(matches!(
            parent.unregister(&child),
            Err(DaqError::Consistency(_))
        ));
    }

    #[tokio::test]
    async fn test_test_open_returns_info_and_closes() {
        let (dev, hooks) = device("stage", None);
        let info = dev.test_open().await.unwrap();
        assert_eq!(info.model, "stage");
        assert!(!dev.is_opened());
        assert_eq!(hooks.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_parent_dropped() {
        let (parent, _) = device("controller", None);
        let (child, _) = device("axis", Some(&parent));
        drop(parent);
        assert!(matches!(
            child.open().await,
            Err(DaqError::ParentDropped(_))
        ));
    }

    #[tokio::test]
    async fn test_property_falls_back_to_ancestor() {
        let parent = Device::builder("adapter", DeviceCategory::SensorAdapter, Recording(Arc::default()))
            .property(
                Property::builder("wavelength", DataType::Float)
                    .reader(|| async { Ok(PropertyValue::Float(532.0)) })
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let child = Device::builder("head", DeviceCategory::PowerSensor, Recording(Arc::default()))
            .parent(&parent)
            .build()
            .unwrap();

        assert_eq!(
            child.get_property("wavelength").await.unwrap(),
            PropertyValue::Float(532.0)
        );
        assert!(matches!(
            child.get_property("gain").await,
            Err(DaqError::UnknownProperty(_))
        ));
        assert!(child.properties().is_empty());
        assert_eq!(parent.properties().len(), 1);
    }

    #[test]
    fn test_duplicate_property_rejected() {
        let prop = || {
            Property::builder("gain", DataType::Integer)
                .reader(|| async { Ok(PropertyValue::Integer(1)) })
                .build()
                .unwrap()
        };
        let result = Device::builder("cam", DeviceCategory::Camera, Recording(Arc::default()))
            .property(prop())
            .property(prop())
            .build();
        assert!(result.is_err());
    }
}
