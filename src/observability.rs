//! Observability bootstrap for locus.
//!
//! Initializes structured logging. Metrics export is intentionally not part
//! of this crate; embedding services plug their own sinks behind `tracing`.

use crate::config::ObservabilityConfig;
use crate::error::{LocusError, Result};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging from the configuration.
///
/// The `RUST_LOG` environment variable takes precedence over the configured
/// level. Safe to call once per process.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| LocusError::Precondition(format!("failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| LocusError::Precondition(format!("failed to init logging: {}", e)))?;
    }

    info!("observability initialized");
    Ok(())
}
