//! Daemon orchestration -- assembly, input wiring, and lifecycle management.
//!
//! The [`Orchestrator`] owns the publisher pipeline, the checkpoint registry
//! and one [`FileInput`] task per configured path.
//!
//! # Startup Order
//!
//! 1. Publisher workers (consumers first, so inputs never block on startup)
//! 2. Inputs, each resuming from its checkpoint
//! 3. Background tasks: checkpoint flusher, uptime gauge, health logger
//!
//! # Shutdown Order
//!
//! 1. Inputs (stop reading, close their clients)
//! 2. Publisher (drain per `publisher.shutdown`, close the output)
//! 3. Background tasks, with a final checkpoint flush

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ironbeat_core::agent::AgentInfo;
use ironbeat_core::config::IronbeatConfig;
use ironbeat_core::metrics as m;
use ironbeat_core::pipeline::{HealthStatus, Pipeline};
use ironbeat_publisher::{PipelineBuilder, PublisherConfig, PublisherPipeline};

use crate::checkpoint::{self, CHECKPOINT_FILE, CheckpointRegistry};
use crate::health::{ComponentHealth, DaemonHealth, aggregate_status, spawn_health_logger};
use crate::input::{FileInput, INPUT_TYPE_FILE};
use crate::metrics_server;

/// How often dirty checkpoints are written to disk.
const CHECKPOINT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// How often the health report is logged.
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// How often the uptime gauge is refreshed.
const UPTIME_INTERVAL: Duration = Duration::from_secs(10);

/// A running input task.
struct InputTask {
    source: String,
    handle: JoinHandle<u64>,
}

/// The main daemon orchestrator.
pub struct Orchestrator {
    /// Loaded and validated configuration.
    config: IronbeatConfig,
    pipeline: PublisherPipeline,
    checkpoints: Arc<CheckpointRegistry>,
    inputs: Vec<InputTask>,
    /// Daemon start time (for uptime reporting).
    start_time: Instant,
    /// Cancels the inputs.
    input_cancel: CancellationToken,
    /// Cancels background tasks after the pipeline stopped.
    background_cancel: CancellationToken,
}

impl Orchestrator {
    /// Load `ironbeat.toml` (with environment overrides) and build the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be loaded or validated,
    /// or if the pipeline or checkpoint registry cannot be built.
    pub async fn build(config_path: &Path) -> Result<Self> {
        let config = IronbeatConfig::load(config_path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load config: {}", e))?;
        Self::build_from_config(config).await
    }

    /// Build from an already-loaded configuration.
    pub async fn build_from_config(config: IronbeatConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

        if let Some(input) = config
            .inputs
            .iter()
            .find(|i| i.input_type != INPUT_TYPE_FILE)
        {
            anyhow::bail!(
                "unsupported input type '{}', only '{}' is available",
                input.input_type,
                INPUT_TYPE_FILE
            );
        }

        // Install the recorder before anything records a metric
        if config.metrics.enabled {
            metrics_server::install_metrics_recorder(&config.metrics)?;
        }

        let publisher_config = PublisherConfig::from_core(&config)?;
        let pipeline = PipelineBuilder::new()
            .config(publisher_config)
            .output_config(config.output.clone())
            .agent(AgentInfo::new(config.general.name.clone()))
            .build()
            .context("failed to build publisher pipeline")?;

        let checkpoints = Arc::new(CheckpointRegistry::load(
            Path::new(&config.general.data_dir).join(CHECKPOINT_FILE),
        )?);

        tracing::info!(
            output = pipeline.output_name(),
            inputs = config.inputs.len(),
            data_dir = %config.general.data_dir,
            "orchestrator initialized"
        );

        Ok(Self {
            config,
            pipeline,
            checkpoints,
            inputs: Vec::new(),
            start_time: Instant::now(),
            input_cancel: CancellationToken::new(),
            background_cancel: CancellationToken::new(),
        })
    }

    /// Run until SIGTERM or SIGINT, then shut down gracefully.
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(async {
            match wait_for_shutdown_signal().await {
                Ok(signal) => tracing::info!(signal, "shutdown signal received"),
                Err(e) => tracing::error!(error = %e, "signal handling failed, shutting down"),
            }
        })
        .await
    }

    /// Start everything, wait for `shutdown`, then stop everything.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.pipeline.start().await?;

        if let Err(e) = self.start_inputs().await {
            tracing::warn!("input startup failed, rolling back");
            self.stop_inputs().await;
            if let Err(stop_err) = self.pipeline.stop().await {
                tracing::error!(
                    startup_error = %e,
                    rollback_error = %stop_err,
                    "rollback also failed during startup failure cleanup"
                );
            }
            return Err(e);
        }

        let mut background = vec![checkpoint::spawn_flusher(
            Arc::clone(&self.checkpoints),
            CHECKPOINT_FLUSH_INTERVAL,
            self.background_cancel.clone(),
        )];
        if self.config.metrics.enabled {
            record_daemon_metrics(self.inputs.len());
            background.push(spawn_uptime_updater(
                self.start_time,
                self.background_cancel.clone(),
            ));
        }
        let probe = self.clone_probe();
        background.push(spawn_health_logger(
            HEALTH_LOG_INTERVAL,
            self.background_cancel.clone(),
            move || {
                let probe = probe.clone();
                async move { probe.health(&[]).await }
            },
        ));

        tracing::info!("ironbeat-daemon running");
        shutdown.await;

        self.stop_inputs().await;
        let stop_result = self.pipeline.stop().await;

        self.background_cancel.cancel();
        for task in background {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background task panicked");
            }
        }

        stop_result?;
        tracing::info!("ironbeat-daemon shut down");
        Ok(())
    }

    async fn start_inputs(&mut self) -> Result<()> {
        for input in &self.config.inputs {
            for path in &input.paths {
                let file_input = FileInput::connect(
                    &self.pipeline,
                    input,
                    path,
                    Arc::clone(&self.checkpoints),
                )
                .await
                .with_context(|| format!("failed to connect input for {path}"))?;
                let source = file_input.source().to_owned();
                let handle = tokio::spawn(file_input.run(self.input_cancel.child_token()));
                self.inputs.push(InputTask { source, handle });
            }
        }
        tracing::info!(inputs = self.inputs.len(), "inputs started");
        Ok(())
    }

    async fn stop_inputs(&mut self) {
        self.input_cancel.cancel();
        let mut total = 0;
        for task in self.inputs.drain(..) {
            match task.handle.await {
                Ok(lines) => total += lines,
                Err(e) => tracing::error!(source = %task.source, error = %e, "input task panicked"),
            }
        }
        tracing::info!(lines = total, "inputs stopped");
        metrics::gauge!(m::DAEMON_INPUTS_RUNNING).set(0.0);
    }

    fn clone_probe(&self) -> HealthProbe {
        HealthProbe {
            pipeline: self.pipeline.clone(),
            start_time: self.start_time,
        }
    }

    /// Current aggregated health.
    pub async fn health(&self) -> DaemonHealth {
        let stopped: Vec<&str> = self
            .inputs
            .iter()
            .filter(|t| t.handle.is_finished())
            .map(|t| t.source.as_str())
            .collect();
        let mut health = self.clone_probe().health(&stopped).await;
        for task in &self.inputs {
            if !task.handle.is_finished() {
                health
                    .components
                    .push(ComponentHealth::new(&task.source, HealthStatus::Healthy));
            }
        }
        health
    }

    /// Shared handle to the publisher pipeline.
    pub fn pipeline(&self) -> &PublisherPipeline {
        &self.pipeline
    }

    /// Checkpoint registry shared with the inputs.
    pub fn checkpoints(&self) -> &Arc<CheckpointRegistry> {
        &self.checkpoints
    }

    /// Loaded configuration.
    pub fn config(&self) -> &IronbeatConfig {
        &self.config
    }
}

/// Pipeline side of the health report, usable from background tasks.
#[derive(Clone)]
struct HealthProbe {
    pipeline: PublisherPipeline,
    start_time: Instant,
}

impl HealthProbe {
    async fn health(&self, stopped_inputs: &[&str]) -> DaemonHealth {
        let mut components = vec![ComponentHealth::new(
            "publisher",
            self.pipeline.health_check().await,
        )];
        components.extend(stopped_inputs.iter().map(|source| {
            ComponentHealth::new(*source, HealthStatus::Degraded("input stopped".to_owned()))
        }));

        DaemonHealth {
            status: aggregate_status(&components),
            uptime_secs: self.start_time.elapsed().as_secs(),
            components,
        }
    }
}

/// Wait for SIGTERM or SIGINT and return its name.
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Record build info and the number of running inputs.
fn record_daemon_metrics(inputs: usize) {
    metrics::gauge!(m::DAEMON_BUILD_INFO, "version" => env!("CARGO_PKG_VERSION")).set(1.0);
    #[allow(clippy::cast_precision_loss)]
    metrics::gauge!(m::DAEMON_INPUTS_RUNNING).set(inputs as f64);
}

/// Refresh the uptime gauge every [`UPTIME_INTERVAL`].
fn spawn_uptime_updater(start_time: Instant, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(UPTIME_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    #[allow(clippy::cast_precision_loss)]
                    metrics::gauge!(m::DAEMON_UPTIME_SECONDS).set(start_time.elapsed().as_secs() as f64);
                }
                _ = cancel.cancelled() => {
                    tracing::debug!("uptime updater shutting down");
                    break;
                }
            }
        }
    })
}
