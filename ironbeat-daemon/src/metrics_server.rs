//! Prometheus scrape endpoint.
//!
//! Uses the built-in HTTP listener of `metrics-exporter-prometheus`. Once
//! installed, every `metrics::counter!()` / `gauge!()` / `histogram!()` in
//! the publisher and the inputs is exported.

use std::net::SocketAddr;

use anyhow::Result;
use ironbeat_core::config::MetricsConfig;
use ironbeat_core::metrics as m;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

/// Parse `listen_addr:port` into a socket address.
pub fn listen_addr(config: &MetricsConfig) -> Result<SocketAddr> {
    format!("{}:{}", config.listen_addr, config.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid metrics listen address: {}", e))
}

/// Install the global metrics recorder and start the HTTP listener.
///
/// # Errors
///
/// - the endpoint is not `/metrics`
/// - the address does not parse or cannot be bound
/// - a global recorder is already installed
pub fn install_metrics_recorder(config: &MetricsConfig) -> Result<()> {
    if config.endpoint != "/metrics" {
        anyhow::bail!(
            "unsupported metrics endpoint '{}': only '/metrics' is currently supported",
            config.endpoint
        );
    }

    let addr = listen_addr(config)?;
    if addr.ip().is_unspecified() {
        tracing::warn!(
            listen_addr = %addr,
            "metrics endpoint is exposed on all interfaces"
        );
    }

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full(m::OUTPUT_SEND_DURATION_SECONDS.to_owned()),
            &m::SEND_DURATION_BUCKETS,
        )
        .map_err(|e| anyhow::anyhow!("invalid histogram buckets: {}", e))?
        .install()
        .map_err(|e| anyhow::anyhow!("failed to install metrics recorder: {}", e))?;

    m::describe_all();

    tracing::info!(listen_addr = %addr, "Prometheus metrics endpoint active");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_custom_endpoint() {
        let config = MetricsConfig {
            endpoint: "/stats".to_owned(),
            ..MetricsConfig::default()
        };
        let err = install_metrics_recorder(&config).unwrap_err();
        assert!(err.to_string().contains("/stats"));
    }

    #[test]
    fn parses_listen_addr() {
        let config = MetricsConfig {
            listen_addr: "127.0.0.1".to_owned(),
            port: 9105,
            ..MetricsConfig::default()
        };
        assert_eq!(listen_addr(&config).unwrap().port(), 9105);
    }

    #[test]
    fn rejects_bad_listen_addr() {
        let config = MetricsConfig {
            listen_addr: "not an ip".to_owned(),
            ..MetricsConfig::default()
        };
        assert!(listen_addr(&config).is_err());
    }
}
