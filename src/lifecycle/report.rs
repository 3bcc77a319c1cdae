//! Outcome of an initialization run and of a shutdown sequence.

use crate::error::{ModelError, ModelResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// A component that did not come up, and why.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FailedComponent {
    pub name: String,
    #[serde(serialize_with = "display")]
    pub cause: ModelError,
}

fn display<S: serde::Serializer>(err: &ModelError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(err)
}

/// Non-fatal condition raised during initialization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InitWarning {
    /// `component` shares an affects edge with `dependency`, which failed.
    /// The component was still initialized.
    DegradedDependency {
        component: String,
        dependency: String,
    },
}

impl fmt::Display for InitWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitWarning::DegradedDependency {
                component,
                dependency,
            } => write!(f, "'{}' is degraded: '{}' failed", component, dependency),
        }
    }
}

/// Result of [`Orchestrator::initialize`](super::Orchestrator::initialize).
#[derive(Clone, Debug, Serialize)]
pub struct InitReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Live components, in the order they became live.
    pub live: Vec<String>,
    /// Failed components in the order they failed.
    pub failed: Vec<FailedComponent>,
    pub warnings: Vec<InitWarning>,
    /// Components never started because the run was cancelled.
    pub cancelled: Vec<String>,
}

impl InitReport {
    /// True if every component is live.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty()
    }

    /// Cause of a component's failure.
    pub fn failure_of(&self, name: &str) -> Option<&ModelError> {
        self.failed
            .iter()
            .find(|failed| failed.name == name)
            .map(|failed| &failed.cause)
    }

    /// Names of the failed components, in failure order.
    pub fn failed_names(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.name.as_str()).collect()
    }
}

/// Result of [`Orchestrator::shutdown`](super::Orchestrator::shutdown).
#[derive(Clone, Debug, Default, Serialize)]
pub struct ShutdownReport {
    /// Components shut down, in shutdown order (including those whose driver
    /// reported an error).
    pub stopped: Vec<String>,
    #[serde(serialize_with = "display_all")]
    pub errors: Vec<ModelError>,
}

fn display_all<S: serde::Serializer>(
    errors: &[ModelError],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(errors.iter().map(ToString::to_string))
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Err(ShutdownFailed)` carrying every collected error, if any.
    pub fn into_result(self) -> ModelResult<Vec<String>> {
        if self.errors.is_empty() {
            Ok(self.stopped)
        } else {
            Err(ModelError::ShutdownFailed(self.errors))
        }
    }
}
