//! Component records: the parsed form of one declared hardware entity.
//!
//! A record is pure data. It names a driver class, a functional role, the
//! opaque init payload handed to the driver, and two kinds of relationships:
//!
//! - `affects`: components whose observed signal changes when this one acts
//!   (a light source affects a camera). Informational only.
//! - `children`: sub-axis label → component, present on composite actuators
//!   built from several independently-driven stages.
//!
//! ```yaml
//! - name: "Stage"
//!   class: "simulated.Stage"
//!   role: stage
//!   init: { axes: [x, y] }
//!   affects: ["Camera"]
//!   properties: { speed: { x: 0.1, y: 0.1 } }
//! ```

use crate::error::{ModelError, ModelResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Functional tag of a component. Open-ended; the constants cover the usual ones.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(String);

impl Role {
    /// Sample or focus stage.
    pub const STAGE: &'static str = "stage";
    /// Camera / imaging detector.
    pub const CCD: &'static str = "ccd";
    /// Light source.
    pub const LIGHT: &'static str = "light";
    /// Emission or excitation filter.
    pub const FILTER: &'static str = "filter";
    /// Objective or other optical lens.
    pub const LENS: &'static str = "lens";
    /// Alignment actuator.
    pub const ALIGN: &'static str = "align";
    /// Focus actuator.
    pub const FOCUS: &'static str = "focus";
    /// Generic actuator.
    pub const ACTUATOR: &'static str = "actuator";

    /// Create a role from any tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// The raw tag.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Role {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// Parsed representation of one declared component.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComponentRecord {
    /// Unique identifier, used in every reference.
    pub name: String,
    /// Driver implementation reference. Never interpreted beyond catalog lookup.
    #[serde(rename = "class")]
    pub driver_class: String,
    /// Functional role.
    pub role: Role,
    /// Opaque payload passed verbatim to the driver at construction.
    #[serde(default = "empty_object")]
    pub init: Value,
    /// Components whose output is modified by this one (ordered set).
    #[serde(default)]
    pub affects: Vec<String>,
    /// Sub-axis label → child component name. Only on composites.
    #[serde(default)]
    pub children: BTreeMap<String, String>,
    /// Property overrides applied after construction.
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl ComponentRecord {
    /// Create a leaf record with empty init payload and no relationships.
    pub fn new(
        name: impl Into<String>,
        driver_class: impl Into<String>,
        role: impl Into<Role>,
    ) -> Self {
        Self {
            name: name.into(),
            driver_class: driver_class.into(),
            role: role.into(),
            init: empty_object(),
            affects: Vec::new(),
            children: BTreeMap::new(),
            properties: BTreeMap::new(),
        }
    }

    /// Replace the init payload.
    pub fn with_init(mut self, init: Value) -> Self {
        self.init = init;
        self
    }

    /// Add an `affects` edge.
    pub fn affecting(mut self, name: impl Into<String>) -> Self {
        self.affects.push(name.into());
        self
    }

    /// Add a child under a sub-axis label.
    pub fn with_child(mut self, label: impl Into<String>, name: impl Into<String>) -> Self {
        self.children.insert(label.into(), name.into());
        self
    }

    /// Add a property override.
    pub fn with_property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// True when this record aggregates children into one logical actuator.
    pub fn is_composite(&self) -> bool {
        !self.children.is_empty()
    }

    /// `affects` with duplicates removed, first occurrence wins.
    pub fn affects_set(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.affects
            .iter()
            .map(String::as_str)
            .filter(|name| seen.insert(*name))
            .collect()
    }

    /// Record-local checks; cross-record checks live in the graph builder.
    pub fn validate(&self) -> ModelResult<()> {
        if self.name.trim().is_empty() {
            return Err(ModelError::InvalidRecord(
                "component name cannot be empty".to_string(),
            ));
        }
        if self.driver_class.trim().is_empty() && !self.is_composite() {
            return Err(ModelError::InvalidRecord(format!(
                "component '{}' has no driver class",
                self.name
            )));
        }
        // a composite listing itself is a one-member cycle, reported by the graph
        if self.affects.iter().any(|name| name == &self.name) {
            return Err(ModelError::SelfReference(self.name.clone()));
        }
        Ok(())
    }
}
