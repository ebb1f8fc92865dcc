//! Aggregated health check reporting.
//!
//! Each pipeline stage exposes `health_check()`; the orchestrator folds
//! the per-stage statuses into a single [`DaemonHealth`] report. The
//! overall status is the worst status among all stages.

use serde::Serialize;

use watchpost_core::pipeline::HealthStatus;

/// Aggregated health report for the entire daemon.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonHealth {
    /// Overall daemon health status (worst of all stages).
    pub status: HealthStatus,
    /// Daemon uptime in seconds since start.
    pub uptime_secs: u64,
    /// Per-stage health reports.
    pub stages: Vec<StageHealth>,
}

/// Health status for a single pipeline stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageHealth {
    /// Stage name ("access", "detect", "alert", "action").
    pub name: String,
    /// Current health status of the stage.
    pub status: HealthStatus,
}

/// Fold stage statuses into one: Unhealthy > Degraded > Healthy.
pub fn aggregate_status(stages: &[StageHealth]) -> HealthStatus {
    let mut degraded = Vec::new();
    let mut unhealthy = Vec::new();

    for stage in stages {
        match &stage.status {
            HealthStatus::Healthy => {}
            HealthStatus::Degraded(reason) => {
                degraded.push(format!("{}: {}", stage.name, reason));
            }
            HealthStatus::Unhealthy(reason) => {
                unhealthy.push(format!("{}: {}", stage.name, reason));
            }
        }
    }

    if !unhealthy.is_empty() {
        HealthStatus::Unhealthy(unhealthy.join("; "))
    } else if !degraded.is_empty() {
        HealthStatus::Degraded(degraded.join("; "))
    } else {
        HealthStatus::Healthy
    }
}
