//! Component lifecycle: state machine, orchestration and reports.

pub mod orchestrator;
pub mod report;
pub mod state;

pub use orchestrator::{CancelHandle, Orchestrator};
pub use report::{FailedComponent, InitReport, InitWarning, ShutdownReport};
pub use state::{ComponentState, StateTable, Transition};
