//! Multiplex Composer: logical multi-axis actuators built from live children.
//!
//! A composite record lists its children under sub-axis labels and declares in
//! its init payload how logical axes map onto the children's physical axes:
//!
//! ```yaml
//! - name: "Align"
//!   class: "composite.Multiplex"
//!   role: align
//!   children: { a: "StageA", b: "StageB" }
//!   init:
//!     axes_map:
//!       x: { child: a, axis: x }
//!       y: { child: b, axis: y }
//!     inverted: [x]
//! ```
//!
//! A plain string entry (`a: x`) uses the logical axis name as the child label.
//! Without `axes_map`, every child label becomes a logical axis bound to the
//! physical axis of the same name.
//!
//! The composite never owns its children. It resolves them by name through the
//! [`RoleRegistry`] on every call, so it stops working as soon as a child is
//! shut down.

use crate::component::ComponentRecord;
use crate::driver::{Driver, DriverProxy, MovableAxes};
use crate::error::{DriverError, ModelError, ModelResult};
use crate::registry::RoleRegistry;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Driver class conventionally used for composite records.
///
/// Any record with children is composed by [`MultiplexComposer`]; the class is
/// informational.
pub const MULTIPLEX_CLASS: &str = "composite.Multiplex";

/// Where one logical axis lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisBinding {
    /// Sub-axis label in the composite's `children`.
    pub child_label: String,
    /// Component name of the child.
    pub child: String,
    /// Axis name on the child.
    pub physical_axis: String,
    /// Sign flip between logical and physical positions.
    pub inverted: bool,
}

impl AxisBinding {
    /// Logical target → physical target.
    pub fn to_physical(&self, target: f64) -> f64 {
        if self.inverted {
            -target
        } else {
            target
        }
    }

    /// Physical position → logical position.
    pub fn to_logical(&self, position: f64) -> f64 {
        self.to_physical(position)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AxisEntry {
    Physical(String),
    Bound { child: String, axis: String },
}

#[derive(Debug, Default, Deserialize)]
struct MultiplexInit {
    #[serde(default)]
    axes_map: Option<BTreeMap<String, AxisEntry>>,
    #[serde(default)]
    inverted: Vec<String>,
}

/// Logical axis → binding. Logical names are unique by construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AxisMap {
    bindings: BTreeMap<String, AxisBinding>,
}

impl AxisMap {
    /// Parse the axis declaration of a composite record.
    ///
    /// Only checks the declaration against the record's own `children`; the
    /// physical axes are checked against live children by
    /// [`MultiplexComposer::compose`].
    pub fn from_record(record: &ComponentRecord) -> ModelResult<Self> {
        let invalid = |detail: String| {
            ModelError::InvalidRecord(format!("composite '{}': {}", record.name, detail))
        };
        if record.children.is_empty() {
            return Err(invalid("no children declared".to_string()));
        }

        let init: MultiplexInit = if record.init.is_null() {
            MultiplexInit::default()
        } else {
            serde_json::from_value(record.init.clone())
                .map_err(|err| invalid(format!("invalid axis declaration: {}", err)))?
        };

        let entries: Vec<(String, String, String)> = match init.axes_map {
            Some(map) => map
                .into_iter()
                .map(|(logical, entry)| match entry {
                    AxisEntry::Physical(axis) => (logical.clone(), logical, axis),
                    AxisEntry::Bound { child, axis } => (logical, child, axis),
                })
                .collect(),
            None => record
                .children
                .keys()
                .map(|label| (label.clone(), label.clone(), label.clone()))
                .collect(),
        };
        if entries.is_empty() {
            return Err(invalid("axes_map is empty".to_string()));
        }

        let mut bindings = BTreeMap::new();
        for (logical, label, physical_axis) in entries {
            let child = record.children.get(&label).ok_or_else(|| {
                invalid(format!(
                    "axis '{}' refers to unknown child label '{}'",
                    logical, label
                ))
            })?;
            bindings.insert(
                logical,
                AxisBinding {
                    child_label: label,
                    child: child.clone(),
                    physical_axis,
                    inverted: false,
                },
            );
        }
        for axis in &init.inverted {
            match bindings.get_mut(axis) {
                Some(binding) => binding.inverted = true,
                None => return Err(invalid(format!("inverted axis '{}' is not mapped", axis))),
            }
        }
        Ok(Self { bindings })
    }

    /// Binding of a logical axis.
    pub fn get(&self, logical: &str) -> Option<&AxisBinding> {
        self.bindings.get(logical)
    }

    /// Logical axis names.
    pub fn logical_axes(&self) -> BTreeSet<String> {
        self.bindings.keys().cloned().collect()
    }

    /// Bindings in logical-axis order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &AxisBinding)> {
        self.bindings.iter()
    }

    /// Distinct child component names, in logical-axis order of first use.
    pub fn children(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.bindings
            .values()
            .map(|binding| binding.child.as_str())
            .filter(|child| seen.insert(*child))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Builds [`MultiplexActuator`]s once every child is live.
pub struct MultiplexComposer;

impl MultiplexComposer {
    /// Resolve the children of `record`, check every physical axis and build
    /// the composite driver.
    ///
    /// # Errors
    /// - [`ModelError::InvalidRecord`] for a malformed axis declaration
    /// - [`ModelError::DependencyFailed`] if a child is not live
    /// - [`ModelError::AxisResolution`] if a child does not expose a mapped axis
    pub fn compose(
        record: &ComponentRecord,
        registry: &Arc<RoleRegistry>,
    ) -> ModelResult<MultiplexActuator> {
        let map = AxisMap::from_record(record)?;

        for (logical, binding) in map.iter() {
            let child = registry.lookup_by_name(&binding.child).map_err(|_| {
                ModelError::DependencyFailed {
                    component: record.name.clone(),
                    dependency: binding.child.clone(),
                }
            })?;
            let exposed = child.axes().unwrap_or_default();
            if !exposed.contains(&binding.physical_axis) {
                return Err(ModelError::AxisResolution {
                    composite: record.name.clone(),
                    axis: logical.clone(),
                    child: binding.child.clone(),
                    missing: binding.physical_axis.clone(),
                });
            }
        }

        info!(
            component = %record.name,
            axes = ?map.logical_axes(),
            "multiplexed actuator composed"
        );
        Ok(MultiplexActuator {
            name: record.name.clone(),
            map,
            registry: Arc::clone(registry),
        })
    }
}

/// Composite driver translating logical-axis requests into child calls.
pub struct MultiplexActuator {
    name: String,
    map: AxisMap,
    registry: Arc<RoleRegistry>,
}

impl MultiplexActuator {
    /// The axis map this actuator was built with.
    pub fn axis_map(&self) -> &AxisMap {
        &self.map
    }

    fn binding(&self, logical: &str) -> Result<&AxisBinding, DriverError> {
        self.map
            .get(logical)
            .ok_or_else(|| DriverError::new(format!("unknown axis '{}'", logical)))
    }

    fn child(&self, name: &str) -> Result<Arc<DriverProxy>, DriverError> {
        self.registry
            .lookup_by_name(name)
            .map_err(|_| DriverError::new(format!("child '{}' of '{}' is not live", name, self.name)))
    }
}

fn from_child(err: ModelError) -> DriverError {
    DriverError::new(err.to_string())
}

#[async_trait]
impl Driver for MultiplexActuator {
    /// A mapping keyed by logical axes is split per child and re-keyed by
    /// physical axis; anything else goes to every child unchanged.
    async fn apply_property(&self, name: &str, value: &Value) -> Result<(), DriverError> {
        let per_axis = value
            .as_object()
            .filter(|entries| !entries.is_empty() && entries.keys().all(|k| self.map.get(k).is_some()));

        match per_axis {
            Some(entries) => {
                let mut per_child: BTreeMap<&str, Map<String, Value>> = BTreeMap::new();
                for (logical, axis_value) in entries {
                    let binding = self.binding(logical)?;
                    per_child
                        .entry(binding.child.as_str())
                        .or_default()
                        .insert(binding.physical_axis.clone(), axis_value.clone());
                }
                for (child, physical) in per_child {
                    self.child(child)?
                        .apply_property(name, &Value::Object(physical))
                        .await
                        .map_err(from_child)?;
                }
            }
            None => {
                for child in self.map.children() {
                    self.child(child)?
                        .apply_property(name, value)
                        .await
                        .map_err(from_child)?;
                }
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        // children are shut down separately, after the composite
        debug!(component = %self.name, "composite released");
        Ok(())
    }

    fn as_movable(&self) -> Option<&dyn MovableAxes> {
        Some(self)
    }
}

#[async_trait]
impl MovableAxes for MultiplexActuator {
    fn axes(&self) -> BTreeSet<String> {
        self.map.logical_axes()
    }

    async fn move_axis(&self, axis: &str, target: f64) -> Result<(), DriverError> {
        let binding = self.binding(axis)?;
        let physical_target = binding.to_physical(target);
        debug!(
            component = %self.name,
            axis,
            child = %binding.child,
            physical_axis = %binding.physical_axis,
            physical_target,
            "translated move"
        );
        self.child(&binding.child)?
            .move_axis(&binding.physical_axis, physical_target)
            .await
            .map_err(from_child)
    }

    async fn position(&self, axis: &str) -> Result<f64, DriverError> {
        let binding = self.binding(axis)?;
        let position = self
            .child(&binding.child)?
            .position(&binding.physical_axis)
            .await
            .map_err(from_child)?;
        Ok(binding.to_logical(position))
    }
}
