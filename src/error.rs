use thiserror::Error;

use crate::deploy::DeploymentResult;
use crate::gate::QualityGateVerdict;
use crate::run::RunStatus;

/// Errors that escape the orchestrator to its caller.
///
/// Stage-local failures never show up here: they are recorded as failed
/// [`crate::run::StageResult`]s. Only bad configuration, illegal state
/// transitions and infrastructure faults propagate.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown pipeline run '{0}'")]
    UnknownRun(String),

    #[error("invalid transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("system error: {0}")]
    System(String),
}

impl PipelineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::System(message.into())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::System(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::System(format!("serialization failed: {err}"))
    }
}

/// Outcome of a stage attempt that did not succeed.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    /// Worth retrying: spawn failures, flaky network, temp-fail exit codes.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Deterministic(String),

    #[error("quality gate '{}' rejected the stage (score {:.1})", .0.gate, .0.score)]
    Rejected(Box<QualityGateVerdict>),

    #[error("deployment to '{}' ended {}", .0.environment, .0.status)]
    Deployment(Box<DeploymentResult>),

    /// Artifact store or other shared infrastructure is unavailable.
    #[error("system error: {0}")]
    System(String),
}

impl StageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }
}

impl From<PipelineError> for StageError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::System(message) => Self::System(message),
            other => Self::Deterministic(other.to_string()),
        }
    }
}

/// A health gate that did not hold during a deployment.
#[derive(Debug, Clone, Error)]
#[error("health check failed for {scope}: {reason}")]
pub struct DeploymentHealthError {
    pub scope: String,
    pub reason: String,
}

pub type Result<T> = std::result::Result<T, PipelineError>;
