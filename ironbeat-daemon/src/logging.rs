//! Logging initialization for ironbeat-daemon.
//!
//! Configures `tracing-subscriber` from the `[general]` section. `RUST_LOG`
//! wins over `general.log_level` when set.

use anyhow::Result;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use ironbeat_core::config::GeneralConfig;

/// Build the level filter for `config`.
pub fn env_filter(config: &GeneralConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
}

/// Initialize the global tracing subscriber.
///
/// Must be called once, before the pipeline is built.
///
/// # Formats
///
/// * `"json"` - one JSON object per line (default)
/// * `"pretty"` - multi-line human-readable output
pub fn init_tracing(config: &GeneralConfig) -> Result<()> {
    let registry = tracing_subscriber::registry().with(env_filter(config));

    let result = match config.log_format.as_str() {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        "pretty" => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init(),
        other => anyhow::bail!("unknown log format '{other}', expected 'json' or 'pretty'"),
    };
    result.map_err(|e| {
        anyhow::anyhow!(
            "failed to initialize {} tracing subscriber: {}",
            config.log_format,
            e
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_format_is_rejected() {
        let config = GeneralConfig {
            log_format: "xml".to_owned(),
            ..GeneralConfig::default()
        };
        let err = init_tracing(&config).unwrap_err();
        assert!(err.to_string().contains("unknown log format 'xml'"));
    }
}
