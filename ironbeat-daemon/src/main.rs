use anyhow::Result;
use clap::Parser;

use ironbeat_core::config::IronbeatConfig;
use ironbeat_daemon::cli::DaemonCli;
use ironbeat_daemon::logging;
use ironbeat_daemon::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DaemonCli::parse();

    // file -> environment -> command line
    let mut config = IronbeatConfig::load(&cli.config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load {}: {}", cli.config.display(), e))?;
    cli.apply_overrides(&mut config);
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;

    if cli.validate {
        println!("configuration OK: {}", cli.config.display());
        return Ok(());
    }

    logging::init_tracing(&config.general)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "ironbeat-daemon starting"
    );

    let mut orchestrator = Orchestrator::build_from_config(config).await?;
    if let Err(e) = orchestrator.run().await {
        tracing::error!(error = %e, "ironbeat-daemon exited with error");
        return Err(e);
    }
    Ok(())
}
