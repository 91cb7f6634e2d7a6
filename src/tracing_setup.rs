//! Tracing initialisation.
//!
//! `RUST_LOG` takes precedence over the configured level, so
//! `RUST_LOG=rust_fluidics::orchestrator=trace` narrows output to the
//! control loop.

use crate::config::LoggingConfig;
use crate::error::{FlowError, FlowResult};
use tracing_subscriber::{fmt, EnvFilter};

/// Build the filter used by [`init`].
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(config: &LoggingConfig) -> FlowResult<()> {
    let filter = env_filter(config);
    let result = if config.json {
        fmt().json().with_env_filter(filter).try_init()
    } else {
        fmt().with_env_filter(filter).with_target(true).try_init()
    };
    result.map_err(|e| FlowError::Configuration(format!("tracing already initialised: {e}")))
}
