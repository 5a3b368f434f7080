//! Tracing subscriber setup.

use crate::error::{AppResult, DaqError};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `level`. With `json` every event is
/// written as one JSON object per line.
pub fn init_tracing(level: &str, json: bool) -> AppResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| DaqError::Configuration(format!("Invalid log filter '{level}': {e}")))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| DaqError::State(format!("tracing already initialised: {e}")))
}
