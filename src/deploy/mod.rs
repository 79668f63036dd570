//! Deployment strategy engine.
//!
//! A [`DeploymentPlan`] names an environment, a strategy and the artifact to
//! ship. The engine looks the environment up, runs the strategy against the
//! environment's [`DeploymentTarget`] while gating on its [`HealthProbe`], and
//! reports a [`DeploymentResult`]. Strategies never panic or bubble errors:
//! target faults and failed health gates end in a rollback or a `failed`
//! result.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::artifact::ArtifactRef;
use crate::cancel::CancellationToken;
use crate::error::{DeploymentHealthError, PipelineError, Result};
use crate::observability::MetricsCollector;

mod blue_green;
mod canary;
pub mod health;
mod recreate;
mod rolling;
mod shadow;
pub mod target;

pub use health::{HealthProbe, HealthRequest, HealthSample, HealthScope, StaticProbe};
pub use target::{DeploymentTarget, FleetState, FleetTarget, Slot, TargetError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Rolling,
    BlueGreen,
    Canary,
    Recreate,
    Shadow,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rolling => "rolling",
            Self::BlueGreen => "blue_green",
            Self::Canary => "canary",
            Self::Recreate => "recreate",
            Self::Shadow => "shadow",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "rolling" => Ok(Self::Rolling),
            "blue_green" | "bluegreen" => Ok(Self::BlueGreen),
            "canary" => Ok(Self::Canary),
            "recreate" => Ok(Self::Recreate),
            "shadow" => Ok(Self::Shadow),
            other => Err(PipelineError::configuration(format!(
                "unknown deployment strategy '{other}'"
            ))),
        }
    }
}

/// Strategy plus its tuning knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeploymentStrategy {
    Rolling {
        batch_size: usize,
        #[serde(default)]
        stabilization_ms: u64,
    },
    BlueGreen,
    Canary {
        traffic_percentage: f64,
        monitoring_duration_ms: u64,
        #[serde(default = "default_true")]
        auto_promote: bool,
    },
    Recreate,
    Shadow {
        monitoring_duration_ms: u64,
    },
}

fn default_true() -> bool {
    true
}

impl DeploymentStrategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::Rolling { .. } => StrategyKind::Rolling,
            Self::BlueGreen => StrategyKind::BlueGreen,
            Self::Canary { .. } => StrategyKind::Canary,
            Self::Recreate => StrategyKind::Recreate,
            Self::Shadow { .. } => StrategyKind::Shadow,
        }
    }

    /// Defaults for a strategy kind; callers override individual knobs.
    pub fn defaults(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::Rolling => Self::Rolling {
                batch_size: 1,
                stabilization_ms: 0,
            },
            StrategyKind::BlueGreen => Self::BlueGreen,
            StrategyKind::Canary => Self::Canary {
                traffic_percentage: 10.0,
                monitoring_duration_ms: 30_000,
                auto_promote: true,
            },
            StrategyKind::Recreate => Self::Recreate,
            StrategyKind::Shadow => Self::Shadow {
                monitoring_duration_ms: 30_000,
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Rolling { batch_size: 0, .. } => Err(PipelineError::configuration(
                "rolling batch_size must be at least 1",
            )),
            Self::Canary {
                traffic_percentage, ..
            } if !(*traffic_percentage > 0.0 && *traffic_percentage <= 100.0) => {
                Err(PipelineError::configuration(format!(
                    "canary traffic_percentage {traffic_percentage} must be within (0, 100]"
                )))
            }
            _ => Ok(()),
        }
    }
}

/// How a health gate is polled and judged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Probes per gate before it is declared failed.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_latency_ms: Option<f64>,
}

fn default_interval_ms() -> u64 {
    1_000
}

fn default_attempts() -> u32 {
    3
}

fn default_max_error_rate() -> f64 {
    0.05
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            attempts: default_attempts(),
            max_error_rate: default_max_error_rate(),
            max_latency_ms: None,
        }
    }
}

impl HealthCheckSpec {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// `Err` carries the reason a sample breaches the thresholds.
    pub fn judge(&self, sample: &HealthSample) -> std::result::Result<(), String> {
        if !sample.healthy {
            return Err(sample
                .detail
                .clone()
                .unwrap_or_else(|| "probe reported unhealthy".to_string()));
        }
        if sample.error_rate > self.max_error_rate {
            return Err(format!(
                "error rate {:.4} above {:.4}",
                sample.error_rate, self.max_error_rate
            ));
        }
        if let Some(max_latency) = self.max_latency_ms
            && sample.latency_ms > max_latency
        {
            return Err(format!(
                "latency {:.1}ms above {:.1}ms",
                sample.latency_ms, max_latency
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackScope {
    /// Only the batch whose health gate failed goes back.
    #[default]
    FailedBatch,
    AllUpdated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackSpec {
    #[serde(default = "default_true")]
    pub automatic: bool,
    #[serde(default)]
    pub scope: RollbackScope,
    #[serde(default = "default_true")]
    pub restore_from_backup: bool,
}

impl Default for RollbackSpec {
    fn default() -> Self {
        Self {
            automatic: true,
            scope: RollbackScope::default(),
            restore_from_backup: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub id: String,
    pub environment: String,
    pub strategy: DeploymentStrategy,
    pub artifact: ArtifactRef,
    #[serde(default)]
    pub health: HealthCheckSpec,
    #[serde(default)]
    pub rollback: RollbackSpec,
    pub created_at: DateTime<Utc>,
}

impl DeploymentPlan {
    pub fn new(
        environment: impl Into<String>,
        strategy: DeploymentStrategy,
        artifact: ArtifactRef,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            environment: environment.into(),
            strategy,
            artifact,
            health: HealthCheckSpec::default(),
            rollback: RollbackSpec::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_health(mut self, health: HealthCheckSpec) -> Self {
        self.health = health;
        self
    }

    pub fn with_rollback(mut self, rollback: RollbackSpec) -> Self {
        self.rollback = rollback;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Succeeded,
    #[serde(rename = "rolledback")]
    RolledBack,
    Failed,
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Succeeded => "succeeded",
            Self::RolledBack => "rolledback",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub plan_id: String,
    pub environment: String,
    pub strategy: StrategyKind,
    pub artifact: String,
    pub status: DeploymentStatus,
    pub elapsed_ms: u64,
    pub health_gates: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updated_instances: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rolled_back_instances: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Per-environment promotion rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentPolicy {
    #[serde(default = "default_true")]
    pub auto_deploy: bool,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default = "default_strategy")]
    pub default_strategy: StrategyKind,
}

fn default_strategy() -> StrategyKind {
    StrategyKind::Rolling
}

impl Default for EnvironmentPolicy {
    fn default() -> Self {
        Self {
            auto_deploy: true,
            approval_required: false,
            default_strategy: default_strategy(),
        }
    }
}

#[derive(Clone)]
pub struct Environment {
    pub name: String,
    pub target: Arc<dyn DeploymentTarget>,
    pub probe: Arc<dyn HealthProbe>,
    pub policy: EnvironmentPolicy,
}

impl Environment {
    pub fn new(
        name: impl Into<String>,
        target: Arc<dyn DeploymentTarget>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            name: name.into(),
            target,
            probe,
            policy: EnvironmentPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: EnvironmentPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct DeploymentEngine {
    environments: HashMap<String, Environment>,
    plans: Mutex<HashMap<String, DeploymentPlan>>,
    metrics: MetricsCollector,
}

impl DeploymentEngine {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self {
            environments: HashMap::new(),
            plans: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn register(&mut self, environment: Environment) {
        self.environments
            .insert(environment.name.clone(), environment);
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.register(environment);
        self
    }

    pub fn environment(&self, name: &str) -> Option<&Environment> {
        self.environments.get(name)
    }

    pub fn environment_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.environments.keys().cloned().collect();
        names.sort();
        names
    }

    fn lookup(&self, name: &str) -> Result<&Environment> {
        self.environments.get(name).ok_or_else(|| {
            PipelineError::configuration(format!(
                "unknown environment '{name}'. Available environments: {}",
                self.environment_names().join(", ")
            ))
        })
    }

    /// Release history of `environment`, oldest first.
    pub fn releases(&self, environment: &str) -> Result<Vec<String>> {
        self.lookup(environment)?
            .target
            .releases()
            .map_err(|err| PipelineError::system(format!("could not read releases of '{environment}': {err}")))
    }

    /// The plan most recently handed to [`Self::deploy`] for `environment`.
    pub fn current_plan(&self, environment: &str) -> Option<DeploymentPlan> {
        self.plans
            .lock()
            .ok()
            .and_then(|plans| plans.get(environment).cloned())
    }

    #[instrument(skip(self, plan, cancel), fields(environment = %plan.environment, strategy = %plan.strategy.kind()))]
    pub fn deploy(
        &self,
        plan: &DeploymentPlan,
        cancel: &CancellationToken,
    ) -> Result<DeploymentResult> {
        let environment = self.lookup(&plan.environment)?;
        plan.strategy.validate()?;

        if let Ok(mut plans) = self.plans.lock()
            && let Some(previous) = plans.insert(plan.environment.clone(), plan.clone())
        {
            info!(superseded = %previous.id, plan = %plan.id, "Deployment plan superseded");
        }

        let rollout = Rollout::new(plan, environment, cancel);
        let result = match &plan.strategy {
            DeploymentStrategy::Rolling {
                batch_size,
                stabilization_ms,
            } => rolling::execute(rollout, *batch_size, Duration::from_millis(*stabilization_ms)),
            DeploymentStrategy::BlueGreen => blue_green::execute(rollout),
            DeploymentStrategy::Canary {
                traffic_percentage,
                monitoring_duration_ms,
                auto_promote,
            } => canary::execute(
                rollout,
                *traffic_percentage,
                Duration::from_millis(*monitoring_duration_ms),
                *auto_promote,
            ),
            DeploymentStrategy::Recreate => recreate::execute(rollout),
            DeploymentStrategy::Shadow {
                monitoring_duration_ms,
            } => shadow::execute(rollout, Duration::from_millis(*monitoring_duration_ms)),
        };

        self.metrics.record_deployment(result.status);
        // a shadow release never takes live traffic
        if result.status == DeploymentStatus::Succeeded
            && plan.strategy.kind() != StrategyKind::Shadow
            && let Err(err) = environment.target.record_release(&plan.artifact.digest)
        {
            warn!(error = %err, "Failed to record release");
        }
        match result.status {
            DeploymentStatus::Succeeded => info!(
                elapsed_ms = result.elapsed_ms,
                health_gates = result.health_gates,
                "Deployment succeeded"
            ),
            status => warn!(
                %status,
                detail = result.detail.as_deref().unwrap_or(""),
                "Deployment did not succeed"
            ),
        }
        Ok(result)
    }

    /// Put `environment` back on an earlier release: `version` (a digest or
    /// a digest prefix) when given, otherwise the release before the current
    /// one. The fleet is recreated from a backup, so a rollback that fails
    /// its health gate restores the fleet it started from.
    #[instrument(skip(self, health, cancel))]
    pub fn rollback(
        &self,
        environment: &str,
        version: Option<&str>,
        health: HealthCheckSpec,
        cancel: &CancellationToken,
    ) -> Result<DeploymentResult> {
        let releases = self.releases(environment)?;
        let Some((current, earlier)) = releases.split_last() else {
            return Err(PipelineError::configuration(format!(
                "environment '{environment}' has no recorded releases"
            )));
        };
        let target = match version {
            None => earlier.last().ok_or_else(|| {
                PipelineError::configuration(format!(
                    "environment '{environment}' has no release before {}",
                    short_digest(current)
                ))
            })?,
            Some(wanted) if current.starts_with(wanted) => {
                return Err(PipelineError::configuration(format!(
                    "{} is already the current release of '{environment}'",
                    short_digest(current)
                )));
            }
            Some(wanted) => earlier
                .iter()
                .rev()
                .find(|release| release.starts_with(wanted))
                .ok_or_else(|| {
                    PipelineError::configuration(format!(
                        "'{wanted}' is not an earlier release of '{environment}'"
                    ))
                })?,
        };

        info!(from = short_digest(current), to = short_digest(target), "Rolling back");
        let artifact = ArtifactRef {
            name: format!("rollback-{}", short_digest(target)),
            digest: target.clone(),
            location: format!("release://{target}"),
            size: 0,
        };
        let plan = DeploymentPlan::new(environment, DeploymentStrategy::Recreate, artifact)
            .with_health(health)
            .with_rollback(RollbackSpec::default());
        self.deploy(&plan, cancel)
    }
}

fn short_digest(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}

/// Bookkeeping shared by every strategy while it runs.
pub(crate) struct Rollout<'a> {
    plan: &'a DeploymentPlan,
    env: &'a Environment,
    cancel: &'a CancellationToken,
    started: Instant,
    health_gates: u32,
    updated: Vec<String>,
    rolled_back: Vec<String>,
}

impl<'a> Rollout<'a> {
    fn new(plan: &'a DeploymentPlan, env: &'a Environment, cancel: &'a CancellationToken) -> Self {
        Self {
            plan,
            env,
            cancel,
            started: Instant::now(),
            health_gates: 0,
            updated: Vec::new(),
            rolled_back: Vec::new(),
        }
    }

    fn version(&self) -> &str {
        &self.plan.artifact.digest
    }

    fn target(&self) -> &dyn DeploymentTarget {
        self.env.target.as_ref()
    }

    fn request(&self, scope: HealthScope) -> HealthRequest {
        HealthRequest {
            environment: self.env.name.clone(),
            scope,
            version: self.version().to_string(),
        }
    }

    /// One health gate: poll until a sample passes or attempts run out.
    fn gate(&mut self, scope: HealthScope) -> std::result::Result<HealthSample, DeploymentHealthError> {
        self.health_gates += 1;
        let request = self.request(scope);
        health::await_healthy(
            self.env.probe.as_ref(),
            &request,
            &self.plan.health,
            self.cancel,
        )
    }

    /// Sample once per interval for `duration`; any breach fails.
    fn monitor(
        &mut self,
        scope: HealthScope,
        duration: Duration,
    ) -> std::result::Result<(), DeploymentHealthError> {
        self.health_gates += 1;
        let request = self.request(scope);
        health::monitor(
            self.env.probe.as_ref(),
            &request,
            &self.plan.health,
            duration,
            self.cancel,
        )
    }

    fn finish(self, status: DeploymentStatus, detail: Option<String>) -> DeploymentResult {
        DeploymentResult {
            plan_id: self.plan.id.clone(),
            environment: self.env.name.clone(),
            strategy: self.plan.strategy.kind(),
            artifact: self.plan.artifact.digest.clone(),
            status,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            health_gates: self.health_gates,
            updated_instances: self.updated,
            rolled_back_instances: self.rolled_back,
            detail,
        }
    }

    /// Failure without any rollback (automatic rollback disabled or
    /// nothing to revert).
    fn fail(self, reason: impl Into<String>) -> DeploymentResult {
        self.finish(DeploymentStatus::Failed, Some(reason.into()))
    }
}

/// Instance id → version, captured before a strategy touches the fleet.
pub(crate) type VersionMap = BTreeMap<String, Option<String>>;
