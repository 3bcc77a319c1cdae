//! Driver boundary and the proxies wrapping live drivers.
//!
//! # Layers
//!
//! - [`Driver`]: what a hardware driver implements. Construction happens through
//!   the [`DriverCatalog`], which maps a record's driver class to a factory.
//! - [`DriverProxy`]: the engine-side handle for one live driver. It knows the
//!   component's name and role, serializes every call into the driver, and turns
//!   driver errors into [`ModelError`]s naming the component.
//!
//! Drivers are not assumed thread-safe beyond `Send + Sync`: two calls into the
//! same proxy never overlap.

pub mod capabilities;
pub mod catalog;
pub mod simulated;

pub use capabilities::{Capability, Detector, LightEmitter, MovableAxes};
pub use catalog::{builder, DriverBuilder, DriverCatalog};

use crate::component::{ComponentRecord, Role};
use crate::error::{DriverError, ModelError, ModelResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Shared handle to a constructed driver.
pub type DynDriver = Arc<dyn Driver>;

/// Capability set every driver exposes to the engine.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Apply a named property override after construction.
    ///
    /// Drivers reject properties they do not know.
    async fn apply_property(&self, name: &str, value: &Value) -> Result<(), DriverError>;

    /// Release the hardware. Best-effort: the engine logs failures and moves on.
    async fn shutdown(&self) -> Result<(), DriverError>;

    /// Positioning capability, if any.
    fn as_movable(&self) -> Option<&dyn MovableAxes> {
        None
    }

    /// Light output capability, if any.
    fn as_emitter(&self) -> Option<&dyn LightEmitter> {
        None
    }

    /// Acquisition capability, if any.
    fn as_detector(&self) -> Option<&dyn Detector> {
        None
    }
}

/// Whether a proxy wraps a driver instance or a composite built from children.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyKind {
    /// One driver instance.
    Leaf,
    /// Logical actuator whose axes are served by child components.
    Composite,
}

/// Live handle to one component.
///
/// Created once per record by the lifecycle orchestrator, which is its only
/// owner; the role registry keeps weak references.
pub struct DriverProxy {
    name: String,
    role: Role,
    kind: ProxyKind,
    driver: DynDriver,
    calls: Mutex<()>,
}

impl fmt::Debug for DriverProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverProxy")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("kind", &self.kind)
            .field("driver", &"Arc<dyn Driver>")
            .finish()
    }
}

impl DriverProxy {
    /// Wrap a driver constructed for `record`.
    pub fn new(record: &ComponentRecord, kind: ProxyKind, driver: DynDriver) -> Self {
        Self {
            name: record.name.clone(),
            role: record.role.clone(),
            kind,
            driver,
            calls: Mutex::new(()),
        }
    }

    /// Component name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared role.
    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Leaf or composite.
    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    /// Capabilities the wrapped driver advertises.
    pub fn capabilities(&self) -> BTreeSet<Capability> {
        let mut caps = BTreeSet::new();
        if self.driver.as_movable().is_some() {
            caps.insert(Capability::MovableAxes);
        }
        if self.driver.as_emitter().is_some() {
            caps.insert(Capability::LightEmitter);
        }
        if self.driver.as_detector().is_some() {
            caps.insert(Capability::Detector);
        }
        caps
    }

    /// True if the driver advertises `capability`.
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    fn missing(&self, capability: Capability) -> ModelError {
        ModelError::CapabilityMissing {
            component: self.name.clone(),
            capability: capability.to_string(),
        }
    }

    fn movable(&self) -> ModelResult<&dyn MovableAxes> {
        self.driver
            .as_movable()
            .ok_or_else(|| self.missing(Capability::MovableAxes))
    }

    fn emitter(&self) -> ModelResult<&dyn LightEmitter> {
        self.driver
            .as_emitter()
            .ok_or_else(|| self.missing(Capability::LightEmitter))
    }

    fn detector(&self) -> ModelResult<&dyn Detector> {
        self.driver
            .as_detector()
            .ok_or_else(|| self.missing(Capability::Detector))
    }

    fn wrap(&self, err: DriverError) -> ModelError {
        ModelError::driver(self.name.clone(), err)
    }

    /// Apply a property override.
    pub async fn apply_property(&self, name: &str, value: &Value) -> ModelResult<()> {
        let _guard = self.calls.lock().await;
        debug!(component = %self.name, property = name, "applying property");
        self.driver
            .apply_property(name, value)
            .await
            .map_err(|err| self.wrap(err))
    }

    /// Shut the driver down.
    pub async fn shutdown(&self) -> ModelResult<()> {
        let _guard = self.calls.lock().await;
        self.driver.shutdown().await.map_err(|err| self.wrap(err))
    }

    /// Axis names, for movable components.
    pub fn axes(&self) -> ModelResult<BTreeSet<String>> {
        Ok(self.movable()?.axes())
    }

    /// Move one axis.
    pub async fn move_axis(&self, axis: &str, target: f64) -> ModelResult<()> {
        let movable = self.movable()?;
        let _guard = self.calls.lock().await;
        movable
            .move_axis(axis, target)
            .await
            .map_err(|err| self.wrap(err))
    }

    /// Read one axis position.
    pub async fn position(&self, axis: &str) -> ModelResult<f64> {
        let movable = self.movable()?;
        let _guard = self.calls.lock().await;
        movable.position(axis).await.map_err(|err| self.wrap(err))
    }

    /// Move several axes as a sequence of independent per-axis calls.
    ///
    /// Every requested axis is checked against [`axes`](Self::axes) before the
    /// first call is issued. Calls are made in axis-name order and all of them are
    /// attempted; if any fails the result is [`ModelError::PartialMoveFailure`]
    /// listing exactly the axes that did complete.
    pub async fn move_many(&self, targets: &BTreeMap<String, f64>) -> ModelResult<()> {
        let movable = self.movable()?;
        let known = movable.axes();
        if let Some(unknown) = targets.keys().find(|axis| !known.contains(*axis)) {
            return Err(self.wrap(DriverError::new(format!("unknown axis '{}'", unknown))));
        }

        let _guard = self.calls.lock().await;
        let mut completed = BTreeSet::new();
        let mut failed = Vec::new();
        for (axis, &target) in targets {
            match movable.move_axis(axis, target).await {
                Ok(()) => {
                    completed.insert(axis.clone());
                }
                Err(err) => failed.push((axis.clone(), err)),
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(ModelError::PartialMoveFailure {
                composite: self.name.clone(),
                completed,
                failed,
            })
        }
    }

    /// Set light output power.
    pub async fn set_power(&self, watts: f64) -> ModelResult<()> {
        let emitter = self.emitter()?;
        let _guard = self.calls.lock().await;
        emitter.set_power(watts).await.map_err(|err| self.wrap(err))
    }

    /// Read light output power.
    pub async fn power(&self) -> ModelResult<f64> {
        let emitter = self.emitter()?;
        let _guard = self.calls.lock().await;
        emitter.power().await.map_err(|err| self.wrap(err))
    }

    /// Detector resolution.
    pub fn resolution(&self) -> ModelResult<(u32, u32)> {
        Ok(self.detector()?.resolution())
    }

    /// Acquire one frame.
    pub async fn acquire(&self) -> ModelResult<Vec<u16>> {
        let detector = self.detector()?;
        let _guard = self.calls.lock().await;
        detector.acquire().await.map_err(|err| self.wrap(err))
    }
}
