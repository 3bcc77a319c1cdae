//! The running system as an explicit context object.
//!
//! [`MicroscopeSystem`] bundles the validated graph, the role registry and the
//! orchestrator. Build one per declaration and pass it to whatever consumes
//! the hardware; nothing in the crate keeps global state.
//!
//! # Example
//!
//! ```rust,ignore
//! let config = ModelConfig::load_from("models/widefield.yaml")?;
//! let system = MicroscopeSystem::from_config(config, DriverCatalog::with_simulated())?;
//! let report = system.start().await?;
//! for camera in system.lookup_by_role(Role::CCD) {
//!     let lights = system.affected_by(camera.name())?;
//!     println!("{} is lit by {:?}", camera.name(), lights);
//! }
//! system.stop().await.into_result()?;
//! ```

use crate::component::ComponentRecord;
use crate::config::{EngineConfig, ModelConfig};
use crate::driver::{DriverCatalog, DriverProxy};
use crate::error::{ModelError, ModelResult};
use crate::graph::ComponentGraph;
use crate::lifecycle::{CancelHandle, ComponentState, InitReport, Orchestrator, ShutdownReport};
use crate::registry::RoleRegistry;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Graph, registry and orchestrator for one declaration.
pub struct MicroscopeSystem {
    graph: Arc<ComponentGraph>,
    registry: Arc<RoleRegistry>,
    orchestrator: Orchestrator,
    config: EngineConfig,
}

impl MicroscopeSystem {
    /// Validate the declaration and prepare (but not start) the system.
    ///
    /// Structural errors in `records` are returned here; nothing is constructed.
    pub fn new(
        records: Vec<ComponentRecord>,
        catalog: DriverCatalog,
        config: EngineConfig,
    ) -> ModelResult<Self> {
        config.validate()?;
        let graph = Arc::new(ComponentGraph::build(records)?);
        let registry = Arc::new(RoleRegistry::new());
        let orchestrator = Orchestrator::new(
            Arc::clone(&graph),
            Arc::new(catalog),
            Arc::clone(&registry),
            config.clone(),
        );
        Ok(Self {
            graph,
            registry,
            orchestrator,
            config,
        })
    }

    /// Prepare a system from a loaded model file.
    pub fn from_config(model: ModelConfig, catalog: DriverCatalog) -> ModelResult<Self> {
        Self::new(model.components, catalog, model.engine)
    }

    /// Initialize every component. See [`Orchestrator::initialize`].
    pub async fn start(&self) -> ModelResult<InitReport> {
        self.orchestrator.initialize().await
    }

    /// Shut every live component down. See [`Orchestrator::shutdown`].
    pub async fn stop(&self) -> ShutdownReport {
        self.orchestrator.shutdown().await
    }

    pub fn graph(&self) -> &ComponentGraph {
        &self.graph
    }

    pub fn registry(&self) -> &Arc<RoleRegistry> {
        &self.registry
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.orchestrator.cancel_handle()
    }

    pub fn state(&self, name: &str) -> Option<ComponentState> {
        self.orchestrator.state(name)
    }

    pub fn lookup_by_role(&self, role: &str) -> Vec<Arc<DriverProxy>> {
        self.registry.lookup_by_role(role)
    }

    pub fn lookup_by_name(&self, name: &str) -> ModelResult<Arc<DriverProxy>> {
        self.registry.lookup_by_name(name)
    }

    /// Components whose output `name` modifies.
    pub fn affects(&self, name: &str) -> ModelResult<BTreeSet<String>> {
        self.known(name)?;
        Ok(owned(self.graph.affects(name)))
    }

    /// Components that modify the output of `name`.
    pub fn affected_by(&self, name: &str) -> ModelResult<BTreeSet<String>> {
        self.known(name)?;
        Ok(owned(self.graph.affected_by(name)))
    }

    /// Live components with `role` that affect `name`.
    ///
    /// For a camera and [`Role::LIGHT`](crate::component::Role::LIGHT) this answers
    /// "which light sources illuminate this camera right now".
    pub fn live_sources_of(&self, name: &str, role: &str) -> ModelResult<Vec<Arc<DriverProxy>>> {
        self.known(name)?;
        Ok(self
            .graph
            .affected_by_role(name, &role.into())
            .into_iter()
            .filter_map(|source| self.registry.lookup_by_name(source).ok())
            .collect())
    }

    /// Take a live component out of service. See [`Orchestrator::mark_failed`].
    pub async fn mark_failed(&self, name: &str, cause: &ModelError) -> ModelResult<()> {
        self.orchestrator.mark_failed(name, cause).await
    }

    fn known(&self, name: &str) -> ModelResult<()> {
        if self.graph.contains(name) {
            Ok(())
        } else {
            Err(ModelError::NotFound(name.to_string()))
        }
    }
}

fn owned(names: BTreeSet<&str>) -> BTreeSet<String> {
    names.into_iter().map(String::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Role;
    use crate::driver::simulated::{SimulatedCamera, SimulatedLight};
    use serde_json::json;

    fn records() -> Vec<ComponentRecord> {
        vec![
            ComponentRecord::new("Lamp", SimulatedLight::CLASS, Role::LIGHT).affecting("Camera"),
            ComponentRecord::new("Laser", SimulatedLight::CLASS, Role::LIGHT)
                .with_init(json!({ "fail": "key switch off" }))
                .affecting("Camera"),
            ComponentRecord::new("Camera", SimulatedCamera::CLASS, Role::CCD),
        ]
    }

    #[tokio::test]
    async fn test_queries_and_lifecycle() {
        let system = MicroscopeSystem::new(
            records(),
            DriverCatalog::with_simulated(),
            EngineConfig::default(),
        )
        .unwrap();

        assert_eq!(
            system.affected_by("Camera").unwrap(),
            BTreeSet::from(["Lamp".to_string(), "Laser".to_string()])
        );
        assert_eq!(
            system.affects("Lamp").unwrap(),
            BTreeSet::from(["Camera".to_string()])
        );
        assert!(matches!(
            system.affects("Nope"),
            Err(ModelError::NotFound(_))
        ));

        let report = system.start().await.unwrap();
        assert_eq!(report.failed_names(), vec!["Laser"]);

        let lights: Vec<_> = system
            .live_sources_of("Camera", Role::LIGHT)
            .unwrap()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(lights, vec!["Lamp"]);

        assert!(system.stop().await.is_clean());
        assert!(system.lookup_by_role(Role::CCD).is_empty());
    }

    #[test]
    fn test_structural_errors_refuse_to_start() {
        let mut bad = records();
        bad.push(ComponentRecord::new("Filter", "simulated.Fixed", Role::FILTER).affecting("Ghost"));
        let err = MicroscopeSystem::new(bad, DriverCatalog::with_simulated(), EngineConfig::default())
            .err()
            .unwrap();
        assert!(err.is_structural());
    }
}
