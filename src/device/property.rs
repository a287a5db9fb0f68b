//! Cached device properties.
//!
//! Every attribute a device exposes is a [`Property`]: a descriptor plus optional
//! hardware read/write hooks and a per-instance cache entry. The cache separates
//! local intent from hardware commit:
//!
//! ```text
//! set()  ──► cache.value = v, dirty = true          (no hardware traffic)
//! sync() ──► if dirty { writer(v).await; dirty = false }
//! get()  ──► no entry   : reader().await, store clean
//!            dirty      : Err(DirtyCache)
//!            volatile   : reader().await, refresh
//!            otherwise  : cached value
//! ```
//!
//! Reading a dirty entry is an error rather than "return the pending write" so that
//! out-of-order writes are never masked.
//!
//! # Example
//!
//! ```rust,ignore
//! let power = Property::builder("power", DataType::Float)
//!     .unit("dBm")
//!     .range(0.0, 22.5)
//!     .reader(move || { let hw = hw.clone(); async move { hw.power().await } })
//!     .writer(move |v| { let hw = hw2.clone(); async move { hw.set_power(v).await } })
//!     .build()?;
//!
//! power.set(PropertyValue::Float(10.0)).await?;
//! power.sync().await?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{DaqError, DaqResult};

// =============================================================================
// Values and descriptors
// =============================================================================

/// Dynamically typed property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    /// Signed integer
    Integer(i64),
    /// Floating point
    Float(f64),
    /// Boolean flag
    Boolean(bool),
    /// Free text or enum member name
    Text(String),
    /// Homogeneous array
    Array(Vec<PropertyValue>),
}

impl PropertyValue {
    /// Numeric view (integers are widened).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer view.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean view.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// Text view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Boolean(_) => "boolean",
            Self::Text(_) => "text",
            Self::Array(_) => "array",
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
            Self::Array(values) => {
                f.write_str("[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Declared data type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Integer values
    Integer,
    /// Floating point values (integers are accepted and widened)
    Float,
    /// Boolean flag
    Boolean,
    /// One of a fixed set of names
    Enum,
    /// Free text
    Text,
    /// Array of values
    Array,
}

/// Which operations a property supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    /// Readable and writable
    ReadWrite,
    /// Reads only; writes fail immediately
    ReadOnly,
    /// Writes only; reads fail immediately
    WriteOnly,
}

/// Static metadata describing a property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    /// Property name, unique within a device
    pub name: String,
    /// Declared data type
    pub dtype: DataType,
    /// Supported operations
    pub access: Access,
    /// Hardware may change the value at any time; cached reads are never trusted
    pub volatile: bool,
    /// Unit of measurement (e.g. "mW", "MHz")
    pub unit: Option<String>,
    /// Inclusive numeric bounds
    pub range: Option<(f64, f64)>,
    /// Allowed names for [`DataType::Enum`]
    pub choices: Vec<String>,
}

impl PropertyDescriptor {
    /// Check a value against the declared type and constraints.
    ///
    /// Returns the value to store (integers written to float properties are widened).
    pub fn validate(&self, value: PropertyValue) -> DaqResult<PropertyValue> {
        let invalid = |reason: String| DaqError::InvalidValue {
            name: self.name.clone(),
            reason,
        };

        let value = match (self.dtype, value) {
            (DataType::Integer, v @ PropertyValue::Integer(_)) => v,
            (DataType::Float, PropertyValue::Integer(v)) => PropertyValue::Float(v as f64),
            (DataType::Float, v @ PropertyValue::Float(_)) => v,
            (DataType::Boolean, v @ PropertyValue::Boolean(_)) => v,
            (DataType::Text, v @ PropertyValue::Text(_)) => v,
            (DataType::Array, v @ PropertyValue::Array(_)) => v,
            (DataType::Enum, PropertyValue::Text(name)) => {
                if !self.choices.iter().any(|c| *c == name) {
                    return Err(invalid(format!(
                        "'{name}' is not one of {:?}",
                        self.choices
                    )));
                }
                PropertyValue::Text(name)
            }
            (dtype, other) => {
                return Err(invalid(format!(
                    "expected {dtype:?}, got {}",
                    other.kind()
                )))
            }
        };

        if let (Some((min, max)), Some(v)) = (self.range, value.as_f64()) {
            if v.is_nan() || v < min || v > max {
                return Err(DaqError::OutOfRange {
                    name: self.name.clone(),
                    value: v,
                    min,
                    max,
                });
            }
        }

        Ok(value)
    }
}

// =============================================================================
// Hardware hooks
// =============================================================================

/// Async hardware read hook.
pub type PropertyReader = Arc<dyn Fn() -> BoxFuture<'static, DaqResult<PropertyValue>> + Send + Sync>;

/// Async hardware write hook.
pub type PropertyWriter =
    Arc<dyn Fn(PropertyValue) -> BoxFuture<'static, DaqResult<()>> + Send + Sync>;

#[derive(Debug)]
struct CacheEntry {
    value: PropertyValue,
    dirty: bool,
}

// =============================================================================
// Property
// =============================================================================

/// One attribute of one device instance, with its cache entry.
pub struct Property {
    descriptor: PropertyDescriptor,
    reader: Option<PropertyReader>,
    writer: Option<PropertyWriter>,
    cache: Mutex<Option<CacheEntry>>,
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl Property {
    /// Start building a property.
    pub fn builder(name: impl Into<String>, dtype: DataType) -> PropertyBuilder {
        PropertyBuilder::new(name, dtype)
    }

    /// Static metadata.
    pub fn descriptor(&self) -> &PropertyDescriptor {
        &self.descriptor
    }

    /// Property name.
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Read the value, from cache when it can be trusted.
    pub async fn get(&self) -> DaqResult<PropertyValue> {
        let name = self.name();
        let reader = self
            .reader
            .as_ref()
            .ok_or_else(|| DaqError::WriteOnlyProperty(name.to_string()))?;

        let mut slot = self.cache.lock().await;
        match slot.as_mut() {
            None => {
                debug!(property = name, "cache missed during get");
                let value = reader().await?;
                *slot = Some(CacheEntry {
                    value: value.clone(),
                    dirty: false,
                });
                Ok(value)
            }
            Some(entry) if entry.dirty => Err(DaqError::DirtyCache(name.to_string())),
            Some(entry) if self.descriptor.volatile => {
                debug!(property = name, "volatile, reading from hardware");
                let value = reader().await?;
                entry.value = value.clone();
                entry.dirty = false;
                Ok(value)
            }
            Some(entry) => Ok(entry.value.clone()),
        }
    }

    /// Store a new value locally and mark it dirty. Hardware is not touched.
    pub async fn set(&self, value: PropertyValue) -> DaqResult<()> {
        if self.writer.is_none() {
            return Err(DaqError::ReadOnlyProperty(self.name().to_string()));
        }
        let value = self.descriptor.validate(value)?;

        let mut slot = self.cache.lock().await;
        match slot.as_mut() {
            Some(entry) => {
                entry.value = value;
                entry.dirty = true;
            }
            None => {
                debug!(property = self.name(), "cache missed during set");
                *slot = Some(CacheEntry { value, dirty: true });
            }
        }
        Ok(())
    }

    /// Push a dirty value to hardware. No-op when clean.
    pub async fn sync(&self) -> DaqResult<()> {
        let Some(writer) = self.writer.as_ref() else {
            return Ok(());
        };

        let mut slot = self.cache.lock().await;
        if let Some(entry) = slot.as_mut() {
            if entry.dirty {
                debug!(property = self.name(), "dirty, synchronizing");
                writer(entry.value.clone()).await?;
                entry.dirty = false;
            }
        }
        Ok(())
    }

    /// True if a local write is waiting for [`Property::sync`].
    pub async fn is_dirty(&self) -> bool {
        self.cache
            .lock()
            .await
            .as_ref()
            .is_some_and(|entry| entry.dirty)
    }

    /// Forget the cached value so the next read goes to hardware.
    ///
    /// A pending write is discarded as well.
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }
}

/// Builder for [`Property`]; the access mode follows from the hooks supplied.
pub struct PropertyBuilder {
    descriptor: PropertyDescriptor,
    reader: Option<PropertyReader>,
    writer: Option<PropertyWriter>,
}

impl PropertyBuilder {
    /// New builder with no hooks.
    pub fn new(name: impl Into<String>, dtype: DataType) -> Self {
        Self {
            descriptor: PropertyDescriptor {
                name: name.into(),
                dtype,
                access: Access::ReadWrite,
                volatile: false,
                unit: None,
                range: None,
                choices: Vec::new(),
            },
            reader: None,
            writer: None,
        }
    }

    /// Mark the property volatile.
    pub fn volatile(mut self) -> Self {
        self.descriptor.volatile = true;
        self
    }

    /// Set the unit.
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.descriptor.unit = Some(unit.into());
        self
    }

    /// Set inclusive numeric bounds.
    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.descriptor.range = Some((min, max));
        self
    }

    /// Set the allowed enum names.
    pub fn choices<I, S>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.descriptor.choices = choices.into_iter().map(Into::into).collect();
        self
    }

    /// Attach the hardware read hook.
    pub fn reader<F, Fut>(mut self, read: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DaqResult<PropertyValue>> + Send + 'static,
    {
        self.reader = Some(Arc::new(move || Box::pin(read())));
        self
    }

    /// Attach the hardware write hook.
    pub fn writer<F, Fut>(mut self, write: F) -> Self
    where
        F: Fn(PropertyValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DaqResult<()>> + Send + 'static,
    {
        self.writer = Some(Arc::new(move |value| Box::pin(write(value))));
        self
    }

    /// Finish the property. At least one hook is required.
    pub fn build(mut self) -> DaqResult<Property> {
        self.descriptor.access = match (&self.reader, &self.writer) {
            (Some(_), Some(_)) => Access::ReadWrite,
            (Some(_), None) => Access::ReadOnly,
            (None, Some(_)) => Access::WriteOnly,
            (None, None) => {
                return Err(DaqError::Consistency(format!(
                    "property '{}' has neither a reader nor a writer",
                    self.descriptor.name
                )))
            }
        };
        if self.descriptor.dtype == DataType::Enum && self.descriptor.choices.is_empty() {
            return Err(DaqError::Consistency(format!(
                "enum property '{}' declares no choices",
                self.descriptor.name
            )));
        }

        Ok(Property {
            descriptor: self.descriptor,
            reader: self.reader,
            writer: self.writer,
            cache: Mutex::new(None),
        })
    }
}

// =============================================================================
// Property table
// =============================================================================

/// Name-indexed set of properties owned by one device.
#[derive(Debug, Default)]
pub struct PropertyTable {
    properties: BTreeMap<String, Property>,
}

impl PropertyTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a property, rejecting duplicate names.
    pub fn insert(&mut self, property: Property) -> DaqResult<()> {
        let name = property.name().to_string();
        if self.properties.contains_key(&name) {
            return Err(DaqError::Consistency(format!(
                "property '{name}' is defined twice"
            )));
        }
        self.properties.insert(name, property);
        Ok(())
    }

    /// Local lookup only.
    pub fn get(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    /// Descriptors in name order.
    pub fn descriptors(&self) -> Vec<PropertyDescriptor> {
        self.properties
            .values()
            .map(|p| p.descriptor().clone())
            .collect()
    }

    /// Iterate over properties in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.properties.values()
    }

    /// Number of properties.
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// True if no property is defined.
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counters {
        reads: AtomicUsize,
        writes: AtomicUsize,
        hardware: parking_lot::Mutex<PropertyValue>,
    }

    fn counted(volatile: bool) -> (Property, Arc<Counters>) {
        let counters = Arc::new(Counters {
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            hardware: parking_lot::Mutex::new(PropertyValue::Integer(10)),
        });
        let r = counters.clone();
        let w = counters.clone();
        let mut builder = Property::builder("val", DataType::Integer)
            .range(-5.0, 100.0)
            .reader(move || {
                let c = r.clone();
                async move {
                    c.reads.fetch_add(1, Ordering::SeqCst);
                    Ok(c.hardware.lock().clone())
                }
            })
            .writer(move |value| {
                let c = w.clone();
                async move {
                    c.writes.fetch_add(1, Ordering::SeqCst);
                    *c.hardware.lock() = value;
                    Ok(())
                }
            });
        if volatile {
            builder = builder.volatile();
        }
        (builder.build().unwrap(), counters)
    }

    #[tokio::test]
    async fn test_first_read_populates_cache() {
        let (prop, counters) = counted(false);
        assert_eq!(prop.get().await.unwrap(), PropertyValue::Integer(10));
        assert_eq!(prop.get().await.unwrap(), PropertyValue::Integer(10));
        assert_eq!(counters.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dirty_read_is_an_error() {
        let (prop, counters) = counted(false);
        prop.set(42.into()).await.unwrap();
        assert!(prop.is_dirty().await);
        assert!(matches!(prop.get().await, Err(DaqError::DirtyCache(_))));
        assert_eq!(counters.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sync_then_read_hits_cache() {
        let (prop, counters) = counted(false);
        prop.set(42.into()).await.unwrap();
        prop.sync().await.unwrap();
        assert_eq!(counters.writes.load(Ordering::SeqCst), 1);
        assert_eq!(prop.get().await.unwrap(), PropertyValue::Integer(42));
        assert_eq!(counters.reads.load(Ordering::SeqCst), 0);

        // already clean
        prop.sync().await.unwrap();
        assert_eq!(counters.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_volatile_reads_every_time() {
        let (prop, counters) = counted(true);
        for expected in 1..=3 {
            prop.get().await.unwrap();
            assert_eq!(counters.reads.load(Ordering::SeqCst), expected);
        }
    }

    #[tokio::test]
    async fn test_range_and_type_validation() {
        let (prop, _) = counted(false);
        assert!(matches!(
            prop.set(500.into()).await,
            Err(DaqError::OutOfRange { .. })
        ));
        assert!(matches!(
            prop.set(1.5.into()).await,
            Err(DaqError::InvalidValue { .. })
        ));
        assert!(!prop.is_dirty().await);
    }

    #[tokio::test]
    async fn test_read_only_and_write_only() {
        let ro = Property::builder("ro", DataType::Boolean)
            .reader(|| async { Ok(PropertyValue::Boolean(true)) })
            .build()
            .unwrap();
        assert_eq!(ro.descriptor().access, Access::ReadOnly);
        assert!(matches!(
            ro.set(false.into()).await,
            Err(DaqError::ReadOnlyProperty(_))
        ));

        let wo = Property::builder("wo", DataType::Text)
            .writer(|_| async { Ok(()) })
            .build()
            .unwrap();
        assert_eq!(wo.descriptor().access, Access::WriteOnly);
        assert!(matches!(
            wo.get().await,
            Err(DaqError::WriteOnlyProperty(_))
        ));
        wo.set("x".into()).await.unwrap();
        wo.sync().await.unwrap();
    }

    #[test]
    fn test_enum_choices() {
        let desc = PropertyDescriptor {
            name: "mode".into(),
            dtype: DataType::Enum,
            access: Access::ReadWrite,
            volatile: false,
            unit: None,
            range: None,
            choices: vec!["internal".into(), "external".into()],
        };
        assert!(desc.validate("external".into()).is_ok());
        assert!(desc.validate("bogus".into()).is_err());
    }

    #[test]
    fn test_builder_requires_a_hook() {
        assert!(Property::builder("nothing", DataType::Float).build().is_err());
    }
}
