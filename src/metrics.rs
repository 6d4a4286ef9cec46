use crate::config::MetricsConfig;
use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the global recorder with a Prometheus scrape listener.
/// Without it every `counter!`/`histogram!` call is a no-op.
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        tracing::debug!("Metrics exporter disabled");
        return Ok(());
    }

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid metrics listen address: {}", config.listen_addr))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    tracing::info!(%addr, "Prometheus metrics exporter listening");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_exporter_is_a_no_op() {
        assert!(init_metrics(&MetricsConfig::default()).is_ok());
    }

    #[test]
    fn rejects_bad_listen_address() {
        let config = MetricsConfig {
            enabled: true,
            listen_addr: "not-an-addr".to_string(),
        };
        assert!(init_metrics(&config).is_err());
    }
}
