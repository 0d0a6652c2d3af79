//! Tracing subscriber setup.

#[cfg(feature = "telemetry")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::JobResult;
use serde::{Deserialize, Serialize};

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,

    /// `EnvFilter` directives used when `RUST_LOG` is not set.
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_filter() -> String {
    "info,bullion=debug".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json: false,
            filter: default_filter(),
        }
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured filter. Fails if a global
/// subscriber is already set.
#[cfg(feature = "telemetry")]
pub fn init_tracing(config: &TelemetryConfig) -> JobResult<()> {
    use crate::error::JobError;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| JobError::Configuration(format!("Invalid log filter: {}", e)))?;

    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };

    result.map_err(|e| JobError::Configuration(format!("Failed to install subscriber: {}", e)))?;

    tracing::info!(json = config.json, filter = %config.filter, "Tracing initialized");
    Ok(())
}

/// Placeholder for when the telemetry feature is disabled.
#[cfg(not(feature = "telemetry"))]
pub fn init_tracing(_config: &TelemetryConfig) -> JobResult<()> {
    Ok(())
}
