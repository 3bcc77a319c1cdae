//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins over the configured level when set, so
//! `RUST_LOG=rust_scope::lifecycle=debug` narrows output to the orchestrator.

use crate::error::{ModelError, ModelResult};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// Fails if a subscriber is already installed or the level does not parse.
pub fn init(level: &str, json: bool) -> ModelResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|err| ModelError::Config(format!("invalid log level '{}': {}", level, err)))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|err| ModelError::Config(format!("logging already initialised: {}", err)))
}
