//! Capability interfaces implemented by drivers.
//!
//! Roles are plain strings used for lookup; call sites that know what they need
//! go through these traits instead. A driver advertises a capability by
//! overriding the matching `as_*` accessor on [`Driver`](super::Driver).

use crate::error::DriverError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Capability families a proxy can be queried by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Named axes that can be positioned ([`MovableAxes`]).
    MovableAxes,
    /// Controllable light output ([`LightEmitter`]).
    LightEmitter,
    /// Image acquisition ([`Detector`]).
    Detector,
}

impl Capability {
    /// Stable identifier used in logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::MovableAxes => "movable_axes",
            Capability::LightEmitter => "light_emitter",
            Capability::Detector => "detector",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named-axis positioning (stages, focus, alignment mirrors, filter wheels).
///
/// Positions are in driver units; the engine never converts them.
#[async_trait]
pub trait MovableAxes: Send + Sync {
    /// Axis names exposed by this actuator.
    fn axes(&self) -> BTreeSet<String>;

    /// Move one axis to an absolute position.
    ///
    /// # Errors
    /// Unknown axis, out-of-range target, or hardware failure.
    async fn move_axis(&self, axis: &str, target: f64) -> Result<(), DriverError>;

    /// Current position of one axis.
    async fn position(&self, axis: &str) -> Result<f64, DriverError>;
}

/// Light sources with a single power setting.
#[async_trait]
pub trait LightEmitter: Send + Sync {
    /// Maximum emitted power, in watts.
    fn max_power(&self) -> f64;

    /// Set the emitted power, in watts. `0.0` switches the source off.
    async fn set_power(&self, watts: f64) -> Result<(), DriverError>;

    /// Current emitted power, in watts.
    async fn power(&self) -> Result<f64, DriverError>;
}

/// Image detectors.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Sensor size (width, height) in pixels.
    fn resolution(&self) -> (u32, u32);

    /// Acquire one frame, row-major.
    async fn acquire(&self) -> Result<Vec<u16>, DriverError>;
}
