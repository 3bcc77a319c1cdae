//! Custom error types for the composition engine.
//!
//! This module defines the primary error type, `ModelError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! everything that can go wrong between reading a microscope declaration and
//! shutting the hardware back down.
//!
//! ## Error Hierarchy
//!
//! - **Structural errors** (`DuplicateComponent`, `InvalidRecord`, `DanglingReference`,
//!   `SelfReference`, `SharedChild`, `CyclicComposition`): the declaration itself is
//!   invalid. These are fatal at graph-build time and the system refuses to start.
//! - **Per-component errors** (`Driver`, `AxisResolution`, `DependencyFailed`,
//!   `UnknownDriverClass`): raised while bringing a single component up. The
//!   orchestrator contains them and surfaces them in its report.
//! - **Runtime errors** (`Driver`, `PartialMoveFailure`, `NotFound`,
//!   `CapabilityMissing`): returned to the caller of a specific operation on a
//!   live component.
//! - **`ShutdownFailed`**: every error collected during a shutdown sequence,
//!   reported together.
//!
//! `DriverError` is deliberately opaque: the engine never interprets what a driver
//! reports, it only carries the message along.

use std::collections::BTreeSet;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ModelResult<T> = std::result::Result<T, ModelError>;

/// Opaque error raised at the driver boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DriverError {
    message: String,
}

impl DriverError {
    /// Create a driver error from any message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The message reported by the driver.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<anyhow::Error> for DriverError {
    fn from(err: anyhow::Error) -> Self {
        // `{:#}` keeps the context chain on one line
        Self::new(format!("{:#}", err))
    }
}

/// Primary error type of the engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Component '{0}' is declared more than once")]
    DuplicateComponent(String),

    #[error("Invalid component record: {0}")]
    InvalidRecord(String),

    #[error("Component '{component}' references undeclared component '{reference}'")]
    DanglingReference { component: String, reference: String },

    #[error("Component '{0}' references itself")]
    SelfReference(String),

    #[error("Component '{child}' is a child of both '{first}' and '{second}'")]
    SharedChild {
        child: String,
        first: String,
        second: String,
    },

    #[error("Cyclic composition: {}", .cycle.join(" -> "))]
    CyclicComposition { cycle: Vec<String> },

    #[error(
        "Composite '{composite}': logical axis '{axis}' maps to missing axis '{missing}' on child '{child}'"
    )]
    AxisResolution {
        composite: String,
        axis: String,
        child: String,
        missing: String,
    },

    #[error("Driver error on '{component}': {source}")]
    Driver {
        component: String,
        #[source]
        source: DriverError,
    },

    #[error("Component '{component}' cannot start: dependency '{dependency}' failed")]
    DependencyFailed {
        component: String,
        dependency: String,
    },

    #[error(
        "Partial move on '{composite}': completed {completed:?}, failed {:?}",
        .failed.iter().map(|(axis, _)| axis.as_str()).collect::<Vec<_>>()
    )]
    PartialMoveFailure {
        composite: String,
        completed: BTreeSet<String>,
        failed: Vec<(String, DriverError)>,
    },

    #[error("Component '{0}' not found")]
    NotFound(String),

    #[error("Component '{component}' does not provide capability '{capability}'")]
    CapabilityMissing {
        component: String,
        capability: String,
    },

    #[error("No driver registered for class '{class}' (component '{component}')")]
    UnknownDriverClass { component: String, class: String },

    #[error("Component '{component}': illegal state transition {from} -> {to}")]
    InvalidTransition {
        component: String,
        from: String,
        to: String,
    },

    #[error("Initialization of '{0}' was cancelled before it started")]
    Cancelled(String),

    #[error("Components are already live; shut them down before initializing again")]
    AlreadyRunning,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shutdown failed with {} error(s)", .0.len())]
    ShutdownFailed(Vec<ModelError>),
}

impl ModelError {
    /// Wrap a driver error with the component it came from.
    pub fn driver(component: impl Into<String>, source: DriverError) -> Self {
        ModelError::Driver {
            component: component.into(),
            source,
        }
    }

    /// True for errors that make the whole declaration unusable.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ModelError::DuplicateComponent(_)
                | ModelError::InvalidRecord(_)
                | ModelError::DanglingReference { .. }
                | ModelError::SelfReference(_)
                | ModelError::SharedChild { .. }
                | ModelError::CyclicComposition { .. }
        )
    }
}

impl From<figment::Error> for ModelError {
    fn from(err: figment::Error) -> Self {
        ModelError::Config(err.to_string())
    }
}
