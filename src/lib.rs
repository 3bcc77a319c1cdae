//! Hardware composition and lifecycle engine for microscopes.
//!
//! The engine consumes a flat declaration of components (drivers, roles and
//! relationships), validates it into a dependency graph, and brings the
//! hardware up and down in dependency-safe order while containing individual
//! driver failures.
//!
//! - [`component`]: parsed component records
//! - [`graph`]: reference resolution, cycle detection and init order
//! - [`driver`]: the driver boundary, proxies and simulated drivers
//! - [`multiplex`]: logical multi-axis actuators built from children
//! - [`registry`]: name and role lookup of live proxies
//! - [`lifecycle`]: state machine, orchestration and reports
//! - [`system`]: the context object tying the above together
//!
//! ```rust,ignore
//! use rust_scope::prelude::*;
//!
//! let model = ModelConfig::load_from("models/widefield.yaml")?;
//! let system = MicroscopeSystem::from_config(model, DriverCatalog::with_simulated())?;
//! let report = system.start().await?;
//! let stage = system.lookup_by_name("SEM-Stage")?;
//! stage.move_axis("x", 1e-3).await?;
//! system.stop().await.into_result()?;
//! ```

pub mod component;
pub mod config;
pub mod driver;
pub mod error;
pub mod graph;
pub mod lifecycle;
pub mod logging;
pub mod multiplex;
pub mod registry;
pub mod system;

/// Commonly used types.
pub mod prelude {
    pub use crate::component::{ComponentRecord, Role};
    pub use crate::config::{EngineConfig, ModelConfig, RetryPolicy};
    pub use crate::driver::{
        Capability, Detector, Driver, DriverCatalog, DriverProxy, LightEmitter, MovableAxes,
    };
    pub use crate::error::{DriverError, ModelError, ModelResult};
    pub use crate::graph::ComponentGraph;
    pub use crate::lifecycle::{
        CancelHandle, ComponentState, InitReport, InitWarning, Orchestrator, ShutdownReport,
    };
    pub use crate::multiplex::{AxisMap, MultiplexComposer, MULTIPLEX_CLASS};
    pub use crate::registry::RoleRegistry;
    pub use crate::system::MicroscopeSystem;
}
