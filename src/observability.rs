use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::deploy::DeploymentStatus;
use crate::run::RunStatus;

#[cfg(feature = "metrics-server")]
pub mod server;

#[derive(Debug, Default, Serialize, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub runs: RunMetrics,
    pub total_duration_ms: f64,
    pub gate_passes: u64,
    pub gate_failures: u64,
    pub deployments: DeploymentMetrics,
}

#[derive(Debug, Default, Serialize, Clone, PartialEq)]
pub struct StageMetrics {
    pub calls: u64,
    pub failures: u64,
    pub retries: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Default, Serialize, Clone, PartialEq)]
pub struct RunMetrics {
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
}

#[derive(Debug, Default, Serialize, Clone, PartialEq)]
pub struct DeploymentMetrics {
    pub succeeded: u64,
    pub rolled_back: u64,
    pub failed: u64,
}

/// Shared, cheaply cloned counters. Every clone writes to the same snapshot.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Times one stage, retries included; the duration is recorded when the timer
    /// drops.
    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    fn update(&self, apply: impl FnOnce(&mut MetricsSnapshot)) {
        if let Ok(mut guard) = self.inner.lock() {
            apply(&mut guard);
        }
    }

    pub fn record_stage_failure(&self, stage: &str) {
        self.update(|s| s.stages.entry(stage.to_string()).or_default().failures += 1);
    }

    pub fn record_stage_retry(&self, stage: &str) {
        self.update(|s| s.stages.entry(stage.to_string()).or_default().retries += 1);
    }

    pub fn record_run(&self, status: RunStatus, duration: Duration) {
        self.update(|s| {
            match status {
                RunStatus::Succeeded => s.runs.succeeded += 1,
                RunStatus::Failed => s.runs.failed += 1,
                RunStatus::Cancelled => s.runs.cancelled += 1,
                RunStatus::Pending | RunStatus::Running => {}
            }
            s.total_duration_ms += duration.as_secs_f64() * 1_000.0;
        });
    }

    pub fn record_gate(&self, passed: bool) {
        self.update(|s| {
            if passed {
                s.gate_passes += 1;
            } else {
                s.gate_failures += 1;
            }
        });
    }

    pub fn record_deployment(&self, status: DeploymentStatus) {
        self.update(|s| match status {
            DeploymentStatus::Succeeded => s.deployments.succeeded += 1,
            DeploymentStatus::RolledBack => s.deployments.rolled_back += 1,
            DeploymentStatus::Failed => s.deployments.failed += 1,
        });
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    /// Record now and return the measured duration.
    pub fn finish(mut self) -> Duration {
        self.record()
    }

    fn record(&mut self) -> Duration {
        let duration = self.started_at.elapsed();
        if self.recorded {
            return duration;
        }
        let duration_ms = duration.as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(stage = self.stage.as_str(), duration_ms, "Stage duration recorded");
        self.recorded = true;
        duration
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        runs_succeeded = snapshot.runs.succeeded,
        runs_failed = snapshot.runs.failed,
        runs_cancelled = snapshot.runs.cancelled,
        gate_passes = snapshot.gate_passes,
        gate_failures = snapshot.gate_failures,
        "Pipeline metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            failures = metrics.failures,
            retries = metrics.retries,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
    let deployments = &snapshot.deployments;
    if deployments.succeeded + deployments.rolled_back + deployments.failed > 0 {
        info!(
            succeeded = deployments.succeeded,
            rolled_back = deployments.rolled_back,
            failed = deployments.failed,
            "Deployment metrics"
        );
    }
}

fn counter(output: &mut String, name: &str, help: &str, samples: &[(&str, f64)]) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    for (labels, value) in samples {
        if labels.is_empty() {
            let _ = writeln!(output, "{name} {value}");
        } else {
            let _ = writeln!(output, "{name}{{{labels}}} {value}");
        }
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        counter(
            &mut output,
            "shipyard_runs_total",
            "Finished pipeline runs by status",
            &[
                ("status=\"succeeded\"", self.runs.succeeded as f64),
                ("status=\"failed\"", self.runs.failed as f64),
                ("status=\"cancelled\"", self.runs.cancelled as f64),
            ],
        );
        counter(
            &mut output,
            "shipyard_gate_evaluations_total",
            "Quality gate evaluations by outcome",
            &[
                ("outcome=\"pass\"", self.gate_passes as f64),
                ("outcome=\"fail\"", self.gate_failures as f64),
            ],
        );
        counter(
            &mut output,
            "shipyard_deployments_total",
            "Deployments by final status",
            &[
                ("status=\"succeeded\"", self.deployments.succeeded as f64),
                ("status=\"rolledback\"", self.deployments.rolled_back as f64),
                ("status=\"failed\"", self.deployments.failed as f64),
            ],
        );

        output.push_str("# HELP shipyard_stage_calls_total Stage attempt count\n");
        output.push_str("# TYPE shipyard_stage_calls_total counter\n");
        output.push_str("# HELP shipyard_stage_failures_total Failed stage count\n");
        output.push_str("# TYPE shipyard_stage_failures_total counter\n");
        output.push_str("# HELP shipyard_stage_retries_total Stage retries after transient errors\n");
        output.push_str("# TYPE shipyard_stage_retries_total counter\n");
        output.push_str(
            "# HELP shipyard_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE shipyard_stage_duration_seconds_total counter\n");
        output.push_str(
            "# HELP shipyard_stage_duration_seconds_max Maximum stage duration in seconds\n",
        );
        output.push_str("# TYPE shipyard_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            let _ = writeln!(output, "shipyard_stage_calls_total{{stage=\"{stage}\"}} {}", metrics.calls);
            let _ = writeln!(
                output,
                "shipyard_stage_failures_total{{stage=\"{stage}\"}} {}",
                metrics.failures
            );
            let _ = writeln!(
                output,
                "shipyard_stage_retries_total{{stage=\"{stage}\"}} {}",
                metrics.retries
            );
            let _ = writeln!(
                output,
                "shipyard_stage_duration_seconds_total{{stage=\"{stage}\"}} {:.6}",
                metrics.total_duration_ms / 1_000.0
            );
            let _ = writeln!(
                output,
                "shipyard_stage_duration_seconds_max{{stage=\"{stage}\"}} {:.6}",
                metrics.max_duration_ms / 1_000.0
            );
        }
        output.push_str("# HELP shipyard_pipeline_duration_seconds Accumulated run duration\n");
        output.push_str("# TYPE shipyard_pipeline_duration_seconds counter\n");
        let _ = writeln!(
            output,
            "shipyard_pipeline_duration_seconds {:.6}",
            self.total_duration_ms / 1_000.0
        );
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_records_on_drop() {
        let collector = MetricsCollector::new();
        {
            let _timer = collector.start_stage("build");
        }
        let duration = collector.start_stage("build").finish();
        collector.record_stage_retry("build");
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.stages["build"].calls, 2);
        assert_eq!(snapshot.stages["build"].retries, 1);
        assert!(snapshot.stages["build"].max_duration_ms >= duration.as_secs_f64() * 1_000.0 - 1e-9);
    }

    #[test]
    fn prometheus_output_names_every_series() {
        let collector = MetricsCollector::new();
        collector.record_run(RunStatus::Failed, Duration::from_millis(1500));
        collector.record_gate(false);
        collector.record_deployment(DeploymentStatus::RolledBack);
        drop(collector.start_stage("deploy"));
        let text = collector.snapshot().to_prometheus();
        assert!(text.contains("shipyard_runs_total{status=\"failed\"} 1"));
        assert!(text.contains("shipyard_gate_evaluations_total{outcome=\"fail\"} 1"));
        assert!(text.contains("shipyard_deployments_total{status=\"rolledback\"} 1"));
        assert!(text.contains("shipyard_stage_calls_total{stage=\"deploy\"} 1"));
        assert!(text.contains("shipyard_pipeline_duration_seconds 1.500000"));
    }
}
