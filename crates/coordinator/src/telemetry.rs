//! Logging and metrics setup.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogFormat, OutboxConfig};
use crate::error::{OutboxError, Result};

/// Installs the global `tracing` subscriber described by `config`.
///
/// Fails if the filter directive is invalid or a subscriber is already set.
pub fn init_tracing(config: &OutboxConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.log_level)
        .map_err(|e| OutboxError::Telemetry(format!("invalid log filter: {e}")))?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.log_format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };
    installed.map_err(|e| OutboxError::Telemetry(e.to_string()))
}

/// Installs the Prometheus recorder and returns the handle used to render
/// the scrape output.
pub fn install_metrics_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| OutboxError::Telemetry(e.to_string()))
}
