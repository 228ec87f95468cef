//! Logging bootstrap

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LoggingConfig;
use crate::error::CoreError;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Calling this when
/// a subscriber is already installed is not an error, so hosts and tests may
/// call it freely.
pub fn init_logging(config: &LoggingConfig) -> Result<(), CoreError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| CoreError::Config(format!("Invalid log level {}: {}", config.level, e)))?,
    };

    let installed = match config.format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init(),
        "pretty" | "" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init(),
        other => {
            return Err(CoreError::Config(format!("Unknown log format: {}", other)));
        }
    };

    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed, keeping it");
    }
    Ok(())
}
