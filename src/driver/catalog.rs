//! Driver class → factory lookup.

use super::simulated::{SimulatedCamera, SimulatedFixed, SimulatedLight, SimulatedStage};
use super::{Driver, DynDriver};
use crate::component::ComponentRecord;
use crate::error::{DriverError, ModelError, ModelResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Factory building a driver from its record (`construct(initParams)`).
///
/// Factories may block on hardware I/O; the orchestrator runs them off the
/// async workers.
pub type DriverBuilder =
    Arc<dyn Fn(&ComponentRecord) -> Result<DynDriver, DriverError> + Send + Sync>;

/// Registry of driver factories keyed by driver class.
#[derive(Clone, Default)]
pub struct DriverCatalog {
    builders: HashMap<String, DriverBuilder>,
}

impl fmt::Debug for DriverCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut classes: Vec<_> = self.builders.keys().collect();
        classes.sort();
        f.debug_struct("DriverCatalog")
            .field("classes", &classes)
            .finish()
    }
}

/// Adapt a typed constructor into a [`DriverBuilder`].
pub fn builder<D, F>(construct: F) -> DriverBuilder
where
    D: Driver + 'static,
    F: Fn(&ComponentRecord) -> Result<D, DriverError> + Send + Sync + 'static,
{
    Arc::new(move |record: &ComponentRecord| -> Result<DynDriver, DriverError> {
        Ok(Arc::new(construct(record)?))
    })
}

impl DriverCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Catalog pre-loaded with the simulated drivers.
    pub fn with_simulated() -> Self {
        let mut catalog = Self::new();
        catalog.register_factory(SimulatedStage::CLASS, builder(SimulatedStage::from_record));
        catalog.register_factory(SimulatedLight::CLASS, builder(SimulatedLight::from_record));
        catalog.register_factory(SimulatedCamera::CLASS, builder(SimulatedCamera::from_record));
        catalog.register_factory(SimulatedFixed::CLASS, builder(SimulatedFixed::from_record));
        catalog
    }

    /// Register (or replace) the factory for a driver class.
    pub fn register_factory(&mut self, driver_class: impl Into<String>, builder: DriverBuilder) {
        self.builders.insert(driver_class.into(), builder);
    }

    /// True if a factory exists for `driver_class`.
    pub fn contains(&self, driver_class: &str) -> bool {
        self.builders.contains_key(driver_class)
    }

    /// Construct the driver for `record`.
    pub fn build(&self, record: &ComponentRecord) -> ModelResult<DynDriver> {
        let builder = self.builders.get(&record.driver_class).ok_or_else(|| {
            ModelError::UnknownDriverClass {
                component: record.name.clone(),
                class: record.driver_class.clone(),
            }
        })?;
        builder(record).map_err(|err| ModelError::driver(record.name.clone(), err))
    }
}
