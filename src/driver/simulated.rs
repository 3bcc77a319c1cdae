//! Simulated Hardware Drivers
//!
//! Drivers that behave like real devices without touching hardware. They back
//! the test suite and the `rust_scope up` demo. All timing uses
//! `tokio::time::sleep`, never `std::thread::sleep`.
//!
//! # Available Drivers
//!
//! | Class | Capability | Init payload |
//! |---|---|---|
//! | `simulated.Stage` | `MovableAxes` | `axes`, `ranges`, `speed`, `settle_ms`, `fail` |
//! | `simulated.Light` | `LightEmitter` | `max_power`, `fail` |
//! | `simulated.Camera` | `Detector` | `resolution`, `exposure_time`, `fail` |
//! | `simulated.Fixed` | none | any mapping, kept as properties |
//!
//! The stage, light and camera reject unknown init keys, and
//! `fail: "<message>"` makes their construction fail with that message, which
//! is how a missing device is simulated in a model file.

use super::capabilities::{Detector, LightEmitter, MovableAxes};
use super::Driver;
use crate::component::ComponentRecord;
use crate::error::DriverError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

fn parse_init<T: DeserializeOwned>(record: &ComponentRecord) -> Result<T, DriverError> {
    serde_json::from_value(record.init.clone()).map_err(|err| {
        DriverError::new(format!(
            "invalid init parameters for {}: {}",
            record.driver_class, err
        ))
    })
}

fn check_fail(fail: &Option<String>) -> Result<(), DriverError> {
    match fail {
        Some(message) => Err(DriverError::new(message.clone())),
        None => Ok(()),
    }
}

fn as_number(property: &str, value: &Value) -> Result<f64, DriverError> {
    value.as_f64().ok_or_else(|| {
        DriverError::new(format!(
            "property '{}' expects a number, got {}",
            property, value
        ))
    })
}

// =============================================================================
// SimulatedStage - multi-axis motion stage
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StageInit {
    #[serde(default = "default_axes")]
    axes: Vec<String>,
    #[serde(default)]
    ranges: BTreeMap<String, [f64; 2]>,
    #[serde(default = "default_speed")]
    speed: f64,
    #[serde(default)]
    settle_ms: u64,
    #[serde(default)]
    fail: Option<String>,
}

fn default_axes() -> Vec<String> {
    vec!["x".to_string()]
}

fn default_speed() -> f64 {
    0.01
}

/// Simulated stage with named axes, optional soft limits and per-axis speed.
///
/// # Example
///
/// ```rust,ignore
/// let record = ComponentRecord::new("Stage", SimulatedStage::CLASS, Role::STAGE)
///     .with_init(json!({ "axes": ["x", "y"], "ranges": { "x": [-0.1, 0.1] } }));
/// let stage = SimulatedStage::from_record(&record)?;
/// stage.move_axis("x", 0.05).await?;
/// ```
pub struct SimulatedStage {
    name: String,
    axes: BTreeSet<String>,
    ranges: BTreeMap<String, (f64, f64)>,
    speeds: RwLock<BTreeMap<String, f64>>,
    positions: RwLock<BTreeMap<String, f64>>,
    settle: Duration,
    shut_down: AtomicBool,
}

impl SimulatedStage {
    /// Driver class name.
    pub const CLASS: &'static str = "simulated.Stage";

    /// Construct from a record's init payload.
    pub fn from_record(record: &ComponentRecord) -> Result<Self, DriverError> {
        let init: StageInit = parse_init(record)?;
        check_fail(&init.fail)?;
        if init.axes.is_empty() {
            return Err(DriverError::new("stage needs at least one axis"));
        }
        let axes: BTreeSet<String> = init.axes.into_iter().collect();
        let mut ranges = BTreeMap::new();
        for (axis, [min, max]) in init.ranges {
            if !axes.contains(&axis) {
                return Err(DriverError::new(format!("range given for unknown axis '{}'", axis)));
            }
            if min > max {
                return Err(DriverError::new(format!("empty range for axis '{}'", axis)));
            }
            ranges.insert(axis, (min, max));
        }
        let positions = axes
            .iter()
            .map(|axis| {
                let start = ranges
                    .get(axis)
                    .map(|&(min, max): &(f64, f64)| 0.0_f64.clamp(min, max))
                    .unwrap_or(0.0);
                (axis.clone(), start)
            })
            .collect();
        let speeds = axes.iter().map(|axis| (axis.clone(), init.speed)).collect();

        debug!(component = %record.name, ?axes, "simulated stage constructed");
        Ok(Self {
            name: record.name.clone(),
            axes,
            ranges,
            speeds: RwLock::new(speeds),
            positions: RwLock::new(positions),
            settle: Duration::from_millis(init.settle_ms),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Current speed of an axis.
    pub async fn speed(&self, axis: &str) -> Option<f64> {
        self.speeds.read().await.get(axis).copied()
    }

    fn check_axis(&self, axis: &str) -> Result<(), DriverError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(DriverError::new(format!("{} is shut down", self.name)));
        }
        if !self.axes.contains(axis) {
            return Err(DriverError::new(format!("unknown axis '{}'", axis)));
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for SimulatedStage {
    async fn apply_property(&self, name: &str, value: &Value) -> Result<(), DriverError> {
        if name != "speed" {
            return Err(DriverError::new(format!("unknown property '{}'", name)));
        }
        let mut speeds = self.speeds.write().await;
        match value {
            Value::Object(per_axis) => {
                for (axis, speed) in per_axis {
                    let speed = as_number(name, speed)?;
                    match speeds.get_mut(axis) {
                        Some(slot) => *slot = speed,
                        None => {
                            return Err(DriverError::new(format!("unknown axis '{}'", axis)))
                        }
                    }
                }
            }
            other => {
                let speed = as_number(name, other)?;
                speeds.values_mut().for_each(|slot| *slot = speed);
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        self.shut_down.store(true, Ordering::SeqCst);
        info!(component = %self.name, "simulated stage released");
        Ok(())
    }

    fn as_movable(&self) -> Option<&dyn MovableAxes> {
        Some(self)
    }
}

#[async_trait]
impl MovableAxes for SimulatedStage {
    fn axes(&self) -> BTreeSet<String> {
        self.axes.clone()
    }

    async fn move_axis(&self, axis: &str, target: f64) -> Result<(), DriverError> {
        self.check_axis(axis)?;
        if let Some(&(min, max)) = self.ranges.get(axis) {
            if !(min..=max).contains(&target) {
                return Err(DriverError::new(format!(
                    "target {} outside range [{}, {}] of axis '{}'",
                    target, min, max, axis
                )));
            }
        }

        // CRITICAL: Use tokio::time::sleep, NOT std::thread::sleep
        if !self.settle.is_zero() {
            sleep(self.settle).await;
        }

        self.positions.write().await.insert(axis.to_string(), target);
        debug!(component = %self.name, axis, target, "simulated move done");
        Ok(())
    }

    async fn position(&self, axis: &str) -> Result<f64, DriverError> {
        self.check_axis(axis)?;
        Ok(self
            .positions
            .read()
            .await
            .get(axis)
            .copied()
            .unwrap_or_default())
    }
}

// =============================================================================
// SimulatedLight - light source
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LightInit {
    #[serde(default = "default_max_power")]
    max_power: f64,
    #[serde(default)]
    fail: Option<String>,
}

fn default_max_power() -> f64 {
    0.4
}

/// Simulated light source; switches off on shutdown.
pub struct SimulatedLight {
    name: String,
    max_power: f64,
    power: RwLock<f64>,
}

impl SimulatedLight {
    /// Driver class name.
    pub const CLASS: &'static str = "simulated.Light";

    /// Construct from a record's init payload.
    pub fn from_record(record: &ComponentRecord) -> Result<Self, DriverError> {
        let init: LightInit = parse_init(record)?;
        check_fail(&init.fail)?;
        if init.max_power <= 0.0 {
            return Err(DriverError::new("max_power must be positive"));
        }
        Ok(Self {
            name: record.name.clone(),
            max_power: init.max_power,
            power: RwLock::new(0.0),
        })
    }
}

#[async_trait]
impl Driver for SimulatedLight {
    async fn apply_property(&self, name: &str, value: &Value) -> Result<(), DriverError> {
        match name {
            "power" => self.set_power(as_number(name, value)?).await,
            _ => Err(DriverError::new(format!("unknown property '{}'", name))),
        }
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        *self.power.write().await = 0.0;
        info!(component = %self.name, "simulated light switched off");
        Ok(())
    }

    fn as_emitter(&self) -> Option<&dyn LightEmitter> {
        Some(self)
    }
}

#[async_trait]
impl LightEmitter for SimulatedLight {
    fn max_power(&self) -> f64 {
        self.max_power
    }

    async fn set_power(&self, watts: f64) -> Result<(), DriverError> {
        if !(0.0..=self.max_power).contains(&watts) {
            return Err(DriverError::new(format!(
                "power {} W outside [0, {}] W",
                watts, self.max_power
            )));
        }
        *self.power.write().await = watts;
        Ok(())
    }

    async fn power(&self) -> Result<f64, DriverError> {
        Ok(*self.power.read().await)
    }
}

// =============================================================================
// SimulatedCamera - detector
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CameraInit {
    #[serde(default = "default_resolution")]
    resolution: [u32; 2],
    #[serde(default = "default_exposure")]
    exposure_time: f64,
    #[serde(default)]
    fail: Option<String>,
}

fn default_resolution() -> [u32; 2] {
    [64, 64]
}

fn default_exposure() -> f64 {
    0.1
}

/// Simulated camera producing synthetic frames.
pub struct SimulatedCamera {
    name: String,
    resolution: (u32, u32),
    exposure_time: RwLock<f64>,
    binning: RwLock<u32>,
    frame_count: AtomicU64,
}

impl SimulatedCamera {
    /// Driver class name.
    pub const CLASS: &'static str = "simulated.Camera";

    /// Construct from a record's init payload.
    pub fn from_record(record: &ComponentRecord) -> Result<Self, DriverError> {
        let init: CameraInit = parse_init(record)?;
        check_fail(&init.fail)?;
        let [width, height] = init.resolution;
        if width == 0 || height == 0 {
            return Err(DriverError::new("resolution must be non-zero"));
        }
        Ok(Self {
            name: record.name.clone(),
            resolution: (width, height),
            exposure_time: RwLock::new(init.exposure_time),
            binning: RwLock::new(1),
            frame_count: AtomicU64::new(0),
        })
    }

    /// Exposure time in seconds.
    pub async fn exposure_time(&self) -> f64 {
        *self.exposure_time.read().await
    }

    /// Frames acquired so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Driver for SimulatedCamera {
    async fn apply_property(&self, name: &str, value: &Value) -> Result<(), DriverError> {
        match name {
            "exposure_time" => {
                let seconds = as_number(name, value)?;
                if seconds <= 0.0 {
                    return Err(DriverError::new("exposure_time must be positive"));
                }
                *self.exposure_time.write().await = seconds;
                Ok(())
            }
            "binning" => {
                let binning = value
                    .as_u64()
                    .filter(|b| (1..=8u64).contains(b))
                    .ok_or_else(|| DriverError::new(format!("invalid binning {}", value)))?;
                *self.binning.write().await = binning as u32;
                Ok(())
            }
            _ => Err(DriverError::new(format!("unknown property '{}'", name))),
        }
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        info!(
            component = %self.name,
            frames = self.frame_count(),
            "simulated camera closed"
        );
        Ok(())
    }

    fn as_detector(&self) -> Option<&dyn Detector> {
        Some(self)
    }
}

#[async_trait]
impl Detector for SimulatedCamera {
    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    async fn acquire(&self) -> Result<Vec<u16>, DriverError> {
        let binning = *self.binning.read().await;
        let frame = self.frame_count.fetch_add(1, Ordering::SeqCst) + 1;
        let (width, height) = self.resolution;
        let pixels = (width / binning).max(1) as usize * (height / binning).max(1) as usize;
        Ok(vec![(frame % u64::from(u16::MAX)) as u16; pixels])
    }
}

// =============================================================================
// SimulatedFixed - passive component (lens, fixed filter)
// =============================================================================

/// Passive component with no behaviour; init values and overrides are kept as properties.
pub struct SimulatedFixed {
    properties: RwLock<BTreeMap<String, Value>>,
}

impl SimulatedFixed {
    /// Driver class name.
    pub const CLASS: &'static str = "simulated.Fixed";

    /// Construct from a record's init payload, which must be a mapping.
    pub fn from_record(record: &ComponentRecord) -> Result<Self, DriverError> {
        let properties: BTreeMap<String, Value> = parse_init(record)?;
        Ok(Self {
            properties: RwLock::new(properties),
        })
    }

    /// Current value of a property.
    pub async fn property(&self, name: &str) -> Option<Value> {
        self.properties.read().await.get(name).cloned()
    }
}

#[async_trait]
impl Driver for SimulatedFixed {
    async fn apply_property(&self, name: &str, value: &Value) -> Result<(), DriverError> {
        self.properties
            .write()
            .await
            .insert(name.to_string(), value.clone());
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
