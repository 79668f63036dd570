use anyhow::{Context, Result, anyhow};
use tracing::info;

use super::{StageContext, StageExecutor, StageInputs, StageOutput, param_f64, param_string, param_u64};
use crate::artifact::ArtifactRef;
use crate::definition::{StageKind, StageParameters};
use crate::deploy::{
    DeploymentPlan, DeploymentStatus, DeploymentStrategy, HealthCheckSpec, RollbackSpec,
    StrategyKind,
};
use crate::error::StageError;
use crate::trigger::TriggerKind;

/// Strategy knobs given in params; unset ones keep the strategy defaults.
#[derive(Debug, Clone, Default)]
struct StrategyOverrides {
    batch_size: Option<u64>,
    stabilization_ms: Option<u64>,
    traffic_percentage: Option<f64>,
    monitoring_duration_ms: Option<u64>,
    auto_promote: Option<bool>,
}

impl StrategyOverrides {
    fn apply(&self, kind: StrategyKind) -> DeploymentStrategy {
        match DeploymentStrategy::defaults(kind) {
            DeploymentStrategy::Rolling {
                batch_size,
                stabilization_ms,
            } => DeploymentStrategy::Rolling {
                batch_size: self.batch_size.map_or(batch_size, |v| v as usize),
                stabilization_ms: self.stabilization_ms.unwrap_or(stabilization_ms),
            },
            DeploymentStrategy::Canary {
                traffic_percentage,
                monitoring_duration_ms,
                auto_promote,
            } => DeploymentStrategy::Canary {
                traffic_percentage: self.traffic_percentage.unwrap_or(traffic_percentage),
                monitoring_duration_ms: self.monitoring_duration_ms.unwrap_or(monitoring_duration_ms),
                auto_promote: self.auto_promote.unwrap_or(auto_promote),
            },
            DeploymentStrategy::Shadow {
                monitoring_duration_ms,
            } => DeploymentStrategy::Shadow {
                monitoring_duration_ms: self.monitoring_duration_ms.unwrap_or(monitoring_duration_ms),
            },
            other => other,
        }
    }
}

/// Ships an upstream artifact into an environment through the deployment
/// engine, after checking the environment's promotion policy.
pub struct DeployStage {
    environment: Option<String>,
    strategy: Option<StrategyKind>,
    overrides: StrategyOverrides,
    artifact: Option<String>,
    health: HealthCheckSpec,
    rollback: RollbackSpec,
}

impl DeployStage {
    pub fn from_params(params: &StageParameters) -> Result<Self> {
        let strategy = param_string(params, "strategy")?
            .map(|name| name.parse::<StrategyKind>())
            .transpose()?;
        let overrides = StrategyOverrides {
            batch_size: param_u64(params, "batch_size")?,
            stabilization_ms: param_u64(params, "stabilization_ms")?,
            traffic_percentage: param_f64(params, "traffic_percentage")?,
            monitoring_duration_ms: param_u64(params, "monitoring_duration_ms")?,
            auto_promote: match params.get("auto_promote") {
                None => None,
                Some(value) => Some(
                    value
                        .as_bool()
                        .ok_or_else(|| anyhow!("'auto_promote' must be a boolean"))?,
                ),
            },
        };
        for kind in [StrategyKind::Rolling, StrategyKind::Canary] {
            overrides.apply(kind).validate()?;
        }
        let health = match params.get("health") {
            Some(value) => serde_json::from_value(value.clone())
                .context("Failed to parse deploy 'health' settings")?,
            None => HealthCheckSpec::default(),
        };
        let rollback = match params.get("rollback") {
            Some(value) => serde_json::from_value(value.clone())
                .context("Failed to parse deploy 'rollback' settings")?,
            None => RollbackSpec::default(),
        };
        Ok(Self {
            environment: param_string(params, "environment")?,
            strategy,
            overrides,
            artifact: param_string(params, "artifact")?,
            health,
            rollback,
        })
    }

    fn pick_artifact(&self, inputs: &StageInputs) -> std::result::Result<ArtifactRef, StageError> {
        let picked = match &self.artifact {
            Some(name) => inputs.upstream_artifacts().filter(|a| a.name == *name).last(),
            None => inputs.upstream_artifacts().last(),
        };
        picked.cloned().ok_or_else(|| {
            StageError::Deterministic(match &self.artifact {
                Some(name) => format!("no upstream artifact named '{name}'"),
                None => "no upstream artifact to deploy".to_string(),
            })
        })
    }
}

impl StageExecutor for DeployStage {
    fn kind(&self) -> StageKind {
        StageKind::Deploy
    }

    fn execute(
        &self,
        inputs: &StageInputs,
        ctx: &StageContext<'_>,
    ) -> std::result::Result<StageOutput, StageError> {
        let name = self
            .environment
            .clone()
            .or_else(|| inputs.options.environment.clone())
            .ok_or_else(|| StageError::Deterministic("no target environment given".into()))?;
        let environment = ctx.deployer.environment(&name).ok_or_else(|| {
            StageError::Deterministic(format!(
                "unknown environment '{name}'. Available environments: {}",
                ctx.deployer.environment_names().join(", ")
            ))
        })?;

        let policy = &environment.policy;
        if policy.approval_required && !inputs.trigger.approved {
            return Err(StageError::Deterministic(format!(
                "deployment to '{name}' requires approval"
            )));
        }
        if !policy.auto_deploy && inputs.trigger.kind != TriggerKind::Manual {
            return Err(StageError::Deterministic(format!(
                "'{name}' does not auto-deploy; trigger a manual run to promote"
            )));
        }

        let kind = inputs
            .options
            .strategy
            .or(self.strategy)
            .unwrap_or(policy.default_strategy);
        let artifact = self.pick_artifact(inputs)?;
        let plan = DeploymentPlan::new(name.clone(), self.overrides.apply(kind), artifact)
            .with_health(self.health.clone())
            .with_rollback(self.rollback.clone());
        info!(environment = name.as_str(), strategy = %kind, plan = plan.id.as_str(), "Deploying");

        let result = ctx.deployer.deploy(&plan, ctx.cancel)?;
        if result.status != DeploymentStatus::Succeeded {
            return Err(StageError::Deployment(Box::new(result)));
        }

        let mut output = StageOutput::default();
        output
            .metrics
            .insert("deploy.health_gates".to_string(), f64::from(result.health_gates));
        output
            .metrics
            .insert("deploy.elapsed_ms".to_string(), result.elapsed_ms as f64);
        output.deployment = Some(result);
        Ok(output)
    }
}

/// Keys a deploy stage understands; anything else is flagged by validation.
pub const PARAM_KEYS: &[&str] = &[
    "environment",
    "strategy",
    "artifact",
    "batch_size",
    "stabilization_ms",
    "traffic_percentage",
    "monitoring_duration_ms",
    "auto_promote",
    "health",
    "rollback",
];
