use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::HealthCheckSpec;
use crate::cancel::CancellationToken;
use crate::error::DeploymentHealthError;
use crate::process::{CommandSpec, run_command};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthScope {
    Instances(Vec<String>),
    Slot(String),
    Canary,
    Shadow,
    Fleet,
}

impl fmt::Display for HealthScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instances(ids) => write!(f, "instances [{}]", ids.join(", ")),
            Self::Slot(slot) => write!(f, "slot {slot}"),
            Self::Canary => f.write_str("canary"),
            Self::Shadow => f.write_str("shadow"),
            Self::Fleet => f.write_str("fleet"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRequest {
    pub environment: String,
    pub scope: HealthScope,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSample {
    pub healthy: bool,
    #[serde(default)]
    pub error_rate: f64,
    #[serde(default)]
    pub latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HealthSample {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            error_rate: 0.0,
            latency_ms: 0.0,
            detail: None,
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            error_rate: 1.0,
            latency_ms: 0.0,
            detail: Some(detail.into()),
        }
    }

    pub fn with_error_rate(error_rate: f64) -> Self {
        Self {
            error_rate,
            ..Self::healthy()
        }
    }
}

/// Black-box health signal for an environment.
pub trait HealthProbe: Send + Sync {
    fn check(&self, request: &HealthRequest) -> HealthSample;
}

/// Always answers with the same sample.
#[derive(Debug, Clone)]
pub struct StaticProbe(pub HealthSample);

impl Default for StaticProbe {
    fn default() -> Self {
        Self(HealthSample::healthy())
    }
}

impl HealthProbe for StaticProbe {
    fn check(&self, _request: &HealthRequest) -> HealthSample {
        self.0.clone()
    }
}

/// Runs a shell command per check. Exit 0 means healthy; `::metric
/// error_rate=` and `::metric latency_ms=` lines feed the thresholds.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    command: String,
    workdir: PathBuf,
    timeout: Duration,
}

impl CommandProbe {
    pub fn new(command: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            workdir: workdir.into(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl HealthProbe for CommandProbe {
    fn check(&self, request: &HealthRequest) -> HealthSample {
        let mut spec = CommandSpec::new(self.command.clone());
        spec.workdir = Some(self.workdir.clone());
        spec.env.insert("SHIPYARD_ENVIRONMENT".into(), request.environment.clone());
        spec.env.insert("SHIPYARD_HEALTH_SCOPE".into(), request.scope.to_string());
        spec.env.insert("SHIPYARD_VERSION".into(), request.version.clone());

        match run_command(&spec, None, Some(self.timeout)) {
            Ok(outcome) => HealthSample {
                healthy: outcome.success(),
                error_rate: outcome.metrics.get("error_rate").copied().unwrap_or(0.0),
                latency_ms: outcome.metrics.get("latency_ms").copied().unwrap_or(0.0),
                detail: (!outcome.success())
                    .then(|| format!("health command exited with {:?}", outcome.exit_code)),
            },
            Err(err) => HealthSample::unhealthy(err.to_string()),
        }
    }
}

/// Poll `probe` up to `spec.attempts` times until a sample passes.
pub fn await_healthy(
    probe: &dyn HealthProbe,
    request: &HealthRequest,
    spec: &HealthCheckSpec,
    cancel: &CancellationToken,
) -> Result<HealthSample, DeploymentHealthError> {
    let attempts = spec.attempts.max(1);
    let mut last_reason = String::new();
    for attempt in 1..=attempts {
        if attempt > 1 && !cancel.sleep(spec.interval()) {
            return Err(cancelled(request));
        }
        let sample = probe.check(request);
        match spec.judge(&sample) {
            Ok(()) => return Ok(sample),
            Err(reason) => {
                debug!(scope = %request.scope, attempt, %reason, "Health probe failed");
                last_reason = reason;
            }
        }
    }
    Err(DeploymentHealthError {
        scope: request.scope.to_string(),
        reason: format!("{last_reason} after {attempts} attempt(s)"),
    })
}

/// Sample once per interval across `duration`; the first breach fails.
pub fn monitor(
    probe: &dyn HealthProbe,
    request: &HealthRequest,
    spec: &HealthCheckSpec,
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), DeploymentHealthError> {
    let interval = spec.interval();
    let samples = if interval.is_zero() {
        1
    } else {
        (duration.as_millis() / interval.as_millis()).max(1)
    };
    for _ in 0..samples {
        if !cancel.sleep(interval) {
            return Err(cancelled(request));
        }
        let sample = probe.check(request);
        if let Err(reason) = spec.judge(&sample) {
            return Err(DeploymentHealthError {
                scope: request.scope.to_string(),
                reason,
            });
        }
    }
    Ok(())
}

fn cancelled(request: &HealthRequest) -> DeploymentHealthError {
    DeploymentHealthError {
        scope: request.scope.to_string(),
        reason: "cancelled".to_string(),
    }
}
