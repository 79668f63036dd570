//! Stage executors.
//!
//! Each [`StageKind`] maps to a constructor in the [`StageRegistry`]. The
//! constructor validates the stage's `params` up front so a bad definition is
//! rejected before any run starts; [`run_stage`] then drives the executor
//! with retries and turns whatever comes back into a [`StageResult`].

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::Utc;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::artifact::{ArtifactRef, ArtifactStore};
use crate::cancel::CancellationToken;
use crate::definition::{StageKind, StageParameters, StageTemplate};
use crate::deploy::{DeploymentEngine, DeploymentResult};
use crate::error::StageError;
use crate::gate::{GateDefinition, MetricSet, QualityGateVerdict};
use crate::observability::MetricsCollector;
use crate::run::{RunOptions, StageResult, StageStatus};
use crate::scheduler::RetryPolicy;
use crate::secrets::SecretStore;
use crate::trigger::TriggerContext;

pub mod build;
pub mod deploy;
pub mod performance;
pub mod quality;
pub mod security;

/// Everything a stage knows about the run it belongs to. Cloned per
/// dispatch so executors never touch shared run state.
#[derive(Debug, Clone)]
pub struct StageInputs {
    pub run_id: String,
    pub definition_id: String,
    pub stage: String,
    pub trigger: TriggerContext,
    pub options: RunOptions,
    /// Results of every transitive upstream stage, in completion order.
    pub upstream: Vec<StageResult>,
}

impl StageInputs {
    /// Upstream metrics merged in completion order; later stages win.
    pub fn upstream_metrics(&self) -> MetricSet {
        let mut merged = MetricSet::new();
        for result in &self.upstream {
            merged.extend(result.metrics.iter().map(|(k, v)| (k.clone(), *v)));
        }
        merged
    }

    pub fn upstream_artifacts(&self) -> impl Iterator<Item = &ArtifactRef> {
        self.upstream.iter().flat_map(|result| result.artifacts.iter())
    }
}

/// Shared collaborators, borrowed for the duration of one stage.
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    pub workdir: &'a Path,
    pub artifacts: &'a dyn ArtifactStore,
    pub secrets: &'a dyn SecretStore,
    pub deployer: &'a DeploymentEngine,
    pub metrics: &'a MetricsCollector,
    pub cancel: &'a CancellationToken,
    pub gates: &'a BTreeMap<String, GateDefinition>,
    /// Fixed when the stage is dispatched; retries and every command the
    /// stage runs share it.
    pub deadline: Option<Instant>,
}

impl StageContext<'_> {
    /// Time left before the stage deadline, to hand to the next command.
    pub fn remaining(&self) -> std::result::Result<Option<Duration>, StageError> {
        let Some(deadline) = self.deadline else {
            return Ok(None);
        };
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(StageError::Deterministic("stage timed out".into()));
        }
        Ok(Some(left))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    pub artifacts: Vec<ArtifactRef>,
    pub metrics: MetricSet,
    pub verdict: Option<QualityGateVerdict>,
    pub deployment: Option<DeploymentResult>,
}

impl StageOutput {
    pub fn with_metrics(metrics: MetricSet) -> Self {
        Self {
            metrics,
            ..Self::default()
        }
    }
}

pub trait StageExecutor: Send + Sync {
    fn kind(&self) -> StageKind;
    fn execute(
        &self,
        inputs: &StageInputs,
        ctx: &StageContext<'_>,
    ) -> std::result::Result<StageOutput, StageError>;
}

type ExecutorConstructor =
    Arc<dyn Fn(&StageParameters) -> Result<Box<dyn StageExecutor>> + Send + Sync>;

pub struct StageRegistry {
    factories: HashMap<StageKind, ExecutorConstructor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl StageRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        register_defaults(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, kind: StageKind, constructor: F)
    where
        F: Fn(&StageParameters) -> Result<Box<dyn StageExecutor>> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Arc::new(constructor));
    }

    pub fn create(&self, kind: StageKind, params: &StageParameters) -> Result<Box<dyn StageExecutor>> {
        let factory = self.factories.get(&kind).ok_or_else(|| {
            anyhow!(
                "No executor registered for stage kind '{}'. Available kinds: {}",
                kind,
                self.known_kinds()
                    .iter()
                    .map(StageKind::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        })?;
        factory(params)
    }

    pub fn known_kinds(&self) -> Vec<StageKind> {
        let mut kinds: Vec<_> = self.factories.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("kinds", &self.known_kinds())
            .finish()
    }
}

pub fn register_defaults(registry: &mut StageRegistry) {
    registry.register(StageKind::Build, |params| {
        Ok(Box::new(build::BuildStage::from_params(params)?))
    });
    registry.register(StageKind::Test, |params| {
        Ok(Box::new(test::TestStage::from_params(params)?))
    });
    registry.register(StageKind::QualityGate, |params| {
        Ok(Box::new(quality::QualityGateStage::from_params(params)?))
    });
    registry.register(StageKind::SecurityScan, |params| {
        Ok(Box::new(security::SecurityScanStage::from_params(params)?))
    });
    registry.register(StageKind::PerformanceCheck, |params| {
        Ok(Box::new(performance::PerformanceStage::from_params(params)?))
    });
    registry.register(StageKind::Deploy, |params| {
        Ok(Box::new(deploy::DeployStage::from_params(params)?))
    });
}

/// A finished stage plus the error that ended it, if any.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub result: StageResult,
    pub error: Option<StageError>,
}

impl StageOutcome {
    pub fn is_system_failure(&self) -> bool {
        self.error.as_ref().is_some_and(StageError::is_system)
    }
}

/// Run `executor` once, retrying transient failures per `retry` (the
/// template's `max_retries` wins when set).
#[instrument(skip_all, fields(stage = %template.name, kind = %template.kind))]
pub fn run_stage(
    template: &StageTemplate,
    executor: &dyn StageExecutor,
    inputs: &StageInputs,
    ctx: &StageContext<'_>,
    retry: &RetryPolicy,
) -> StageOutcome {
    let max_retries = template.max_retries.unwrap_or(retry.max_retries);
    let started_at = Utc::now();
    let timer = ctx.metrics.start_stage(&template.name);
    let mut attempts = 0u32;

    let outcome = loop {
        attempts += 1;
        match executor.execute(inputs, ctx) {
            Ok(output) => break Ok(output),
            Err(err) if err.is_retryable() && attempts <= max_retries => {
                let delay = retry.backoff(attempts);
                warn!(attempt = attempts, delay_ms = delay.as_millis() as u64, error = %err, "Retrying stage");
                ctx.metrics.record_stage_retry(&template.name);
                if !ctx.cancel.sleep(delay) {
                    break Err(err);
                }
            }
            Err(err) => break Err(err),
        }
    };

    let duration = timer.finish();
    let mut result = StageResult {
        stage: template.name.clone(),
        kind: template.kind,
        status: StageStatus::Succeeded,
        artifacts: Vec::new(),
        metrics: MetricSet::new(),
        attempts,
        error: None,
        verdict: None,
        deployment: None,
        started_at,
        finished_at: Utc::now(),
    };

    let error = match outcome {
        Ok(output) => {
            result.artifacts = output.artifacts;
            result.metrics = output.metrics;
            result.verdict = output.verdict;
            result.deployment = output.deployment;
            info!(attempts, "Stage succeeded");
            None
        }
        Err(err) => {
            result.status = StageStatus::Failed;
            result.error = Some(err.to_string());
            match &err {
                StageError::Rejected(verdict) => result.verdict = Some((**verdict).clone()),
                StageError::Deployment(deployment) => {
                    result.deployment = Some((**deployment).clone())
                }
                _ => {}
            }
            ctx.metrics.record_stage_failure(&template.name);
            warn!(attempts, error = %err, "Stage failed");
            Some(err)
        }
    };
    result
        .metrics
        .insert("duration_ms".to_string(), duration.as_secs_f64() * 1_000.0);

    StageOutcome { result, error }
}

pub(crate) fn param_string(params: &StageParameters, key: &str) -> Result<Option<String>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(anyhow!("'{key}' must be a string, got {other}")),
    }
}

pub(crate) fn param_strings(params: &StageParameters, key: &str) -> Result<Vec<String>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("'{key}' entries must be strings"))
            })
            .collect(),
        Some(other) => Err(anyhow!("'{key}' must be a string or list, got {other}")),
    }
}

pub(crate) fn param_f64(params: &StageParameters, key: &str) -> Result<Option<f64>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| anyhow!("'{key}' must be a number, got {value}")),
    }
}

pub(crate) fn param_u64(params: &StageParameters, key: &str) -> Result<Option<u64>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| anyhow!("'{key}' must be a non-negative integer, got {value}")),
    }
}

pub(crate) fn param_metrics(params: &StageParameters, key: &str) -> Result<MetricSet> {
    let Some(value) = params.get(key) else {
        return Ok(MetricSet::new());
    };
    let map = value
        .as_object()
        .ok_or_else(|| anyhow!("'{key}' must be a map of metric values"))?;
    map.iter()
        .map(|(name, value)| {
            value
                .as_f64()
                .map(|v| (name.clone(), v))
                .ok_or_else(|| anyhow!("metric '{name}' must be numeric"))
        })
        .collect()
}
