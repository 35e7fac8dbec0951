//! Telemetry module
//!
//! Structured logging and the Prometheus metrics endpoint

mod logging;

pub use logging::init_logging;

use crate::config::TelemetryConfig;
use std::net::{Ipv4Addr, SocketAddr};

/// Guard that cleans up telemetry on drop
pub struct TelemetryGuard {
    _priv: (),
}

/// Initialize all telemetry subsystems
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<TelemetryGuard> {
    init_logging(&config.log_level)?;

    if config.metrics_port != 0 {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.metrics_port));
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| anyhow::anyhow!("Failed to start metrics exporter: {}", e))?;
        tracing::info!(%addr, "Prometheus metrics exporter listening");
    }

    Ok(TelemetryGuard { _priv: () })
}
