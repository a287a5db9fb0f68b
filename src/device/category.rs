//! Device categories used to route requirements to drivers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Type tag identifying what kind of instrument a device is.
///
/// Requirements are declared against a category, drivers advertise the
/// categories they can produce, and every device reports exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceCategory {
    /// Area detector
    Camera,
    /// Acousto-optic modulator / tunable filter
    AcustoOpticalModulator,
    /// Electro-optic modulator (Pockels cell)
    ElectroOpticalModulator,
    /// Spatial light modulator
    SpatialLightModulator,
    /// Beam steering mirror
    Galvo,
    /// Single translation axis
    LinearAxis,
    /// Single rotation axis
    RotaryAxis,
    /// Controller hosting one or more axes
    MotionController,
    /// Interface box between host and a sensor head
    SensorAdapter,
    /// Optical power sensor head
    PowerSensor,
    /// Generic light source
    LightSource,
    /// Laser
    Laser,
    /// Discrete state device (filter wheel, shutter)
    States,
    /// Hardware sequencer
    Sequencer,
}

/// Coarse grouping of categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CategoryFamily {
    /// Cameras
    Camera,
    /// Light modulators
    Modulator,
    /// Stages, axes, galvos
    Motion,
    /// Sensors and their adapters
    Sensor,
    /// Lasers and lamps
    LightSource,
    /// Discrete state devices
    States,
    /// Sequencers
    Sequencer,
}

impl DeviceCategory {
    /// Every known category, in declaration order.
    pub const ALL: [DeviceCategory; 14] = [
        Self::Camera,
        Self::AcustoOpticalModulator,
        Self::ElectroOpticalModulator,
        Self::SpatialLightModulator,
        Self::Galvo,
        Self::LinearAxis,
        Self::RotaryAxis,
        Self::MotionController,
        Self::SensorAdapter,
        Self::PowerSensor,
        Self::LightSource,
        Self::Laser,
        Self::States,
        Self::Sequencer,
    ];

    /// Canonical name, identical to the serialized form.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Camera => "Camera",
            Self::AcustoOpticalModulator => "AcustoOpticalModulator",
            Self::ElectroOpticalModulator => "ElectroOpticalModulator",
            Self::SpatialLightModulator => "SpatialLightModulator",
            Self::Galvo => "Galvo",
            Self::LinearAxis => "LinearAxis",
            Self::RotaryAxis => "RotaryAxis",
            Self::MotionController => "MotionController",
            Self::SensorAdapter => "SensorAdapter",
            Self::PowerSensor => "PowerSensor",
            Self::LightSource => "LightSource",
            Self::Laser => "Laser",
            Self::States => "States",
            Self::Sequencer => "Sequencer",
        }
    }

    /// Family this category belongs to.
    pub fn family(&self) -> CategoryFamily {
        match self {
            Self::Camera => CategoryFamily::Camera,
            Self::AcustoOpticalModulator
            | Self::ElectroOpticalModulator
            | Self::SpatialLightModulator => CategoryFamily::Modulator,
            Self::Galvo | Self::LinearAxis | Self::RotaryAxis | Self::MotionController => {
                CategoryFamily::Motion
            }
            Self::SensorAdapter | Self::PowerSensor => CategoryFamily::Sensor,
            Self::LightSource | Self::Laser => CategoryFamily::LightSource,
            Self::States => CategoryFamily::States,
            Self::Sequencer => CategoryFamily::Sequencer,
        }
    }
}

impl fmt::Display for DeviceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when parsing an unknown category name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown device category '{0}'")]
pub struct UnknownCategory(pub String);

impl FromStr for DeviceCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|category| category.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}
