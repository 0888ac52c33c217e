//! Aggregated health reporting.
//!
//! The daemon status is the worst status among its components: the
//! publisher pipeline and every running input.
//!
//! # Aggregation Rule
//!
//! - All Healthy -> Healthy
//! - Any Degraded, none Unhealthy -> Degraded(reason)
//! - Any Unhealthy -> Unhealthy(reason)

use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use ironbeat_core::pipeline::HealthStatus;

/// Aggregated health report for the whole daemon.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonHealth {
    /// Worst status of all components.
    pub status: HealthStatus,
    /// Seconds since the orchestrator was built.
    pub uptime_secs: u64,
    pub components: Vec<ComponentHealth>,
}

/// Health of one component (`"publisher"` or an input source key).
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
}

impl ComponentHealth {
    pub fn new(name: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            status,
        }
    }
}

/// Aggregate component statuses into a single status.
///
/// Returns the worst status found: Unhealthy > Degraded > Healthy. Reasons of
/// every non-healthy component at the worst level are joined with `"; "`.
pub fn aggregate_status(components: &[ComponentHealth]) -> HealthStatus {
    let unhealthy: Vec<String> = components
        .iter()
        .filter_map(|c| match &c.status {
            HealthStatus::Unhealthy(reason) => Some(format!("{}: {}", c.name, reason)),
            _ => None,
        })
        .collect();
    if !unhealthy.is_empty() {
        return HealthStatus::Unhealthy(unhealthy.join("; "));
    }

    let degraded: Vec<String> = components
        .iter()
        .filter_map(|c| match &c.status {
            HealthStatus::Degraded(reason) => Some(format!("{}: {}", c.name, reason)),
            _ => None,
        })
        .collect();
    if !degraded.is_empty() {
        return HealthStatus::Degraded(degraded.join("; "));
    }

    HealthStatus::Healthy
}

/// Spawn a task that logs the health report every `interval`.
///
/// `probe` is polled on each tick; non-healthy reports are logged at `warn`.
pub fn spawn_health_logger<F, Fut>(
    interval: Duration,
    cancel: CancellationToken,
    probe: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = DaemonHealth> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let health = probe().await;
                    if health.status.is_healthy() {
                        tracing::debug!(uptime_secs = health.uptime_secs, "daemon healthy");
                    } else {
                        tracing::warn!(
                            status = %health.status,
                            uptime_secs = health.uptime_secs,
                            "daemon health degraded"
                        );
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::debug!("health logger shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_healthy() {
        let components = vec![
            ComponentHealth::new("publisher", HealthStatus::Healthy),
            ComponentHealth::new("app:/var/log/app.log", HealthStatus::Healthy),
        ];
        assert_eq!(aggregate_status(&components), HealthStatus::Healthy);
    }

    #[test]
    fn empty_is_healthy() {
        assert_eq!(aggregate_status(&[]), HealthStatus::Healthy);
    }

    #[test]
    fn degraded_collects_reasons() {
        let components = vec![
            ComponentHealth::new("publisher", HealthStatus::Degraded("queue 95% full".into())),
            ComponentHealth::new("a", HealthStatus::Healthy),
            ComponentHealth::new("b", HealthStatus::Degraded("stopped".into())),
        ];
        assert_eq!(
            aggregate_status(&components),
            HealthStatus::Degraded("publisher: queue 95% full; b: stopped".into())
        );
    }

    #[test]
    fn unhealthy_wins_over_degraded() {
        let components = vec![
            ComponentHealth::new("a", HealthStatus::Degraded("slow".into())),
            ComponentHealth::new("publisher", HealthStatus::Unhealthy("intake halted".into())),
        ];
        assert_eq!(
            aggregate_status(&components),
            HealthStatus::Unhealthy("publisher: intake halted".into())
        );
    }

    #[tokio::test]
    async fn logger_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let task = spawn_health_logger(Duration::from_millis(5), cancel.clone(), || async {
            DaemonHealth {
                status: HealthStatus::Healthy,
                uptime_secs: 0,
                components: Vec::new(),
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
