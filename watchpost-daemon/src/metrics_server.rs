//! Prometheus metrics HTTP endpoint.
//!
//! Uses the built-in HTTP listener from `metrics-exporter-prometheus`.
//! After installation every `metrics::counter!()` / `gauge!()` call in
//! the pipeline crates is recorded and exposed for scraping.

use std::net::SocketAddr;

use anyhow::Result;

use metrics_exporter_prometheus::PrometheusBuilder;
use watchpost_core::config::MetricsConfig;

/// Install the global metrics recorder and start the HTTP listener.
///
/// Should be called once per process, before any pipeline starts.
///
/// # Errors
///
/// - The listen address does not parse
/// - Socket binding fails
/// - A global recorder is already installed
pub fn install_metrics_recorder(config: &MetricsConfig) -> Result<()> {
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid metrics listen address: {}", e))?;

    if addr.ip().is_unspecified() {
        tracing::warn!(
            listen_addr = %addr,
            "metrics endpoint is exposed on all interfaces; restrict listen_addr in untrusted networks"
        );
    }

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("failed to install metrics recorder: {}", e))?;

    tracing::info!(listen_addr = %addr, "Prometheus metrics endpoint active");
    Ok(())
}
