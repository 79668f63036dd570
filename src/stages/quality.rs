use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::info;

use super::{StageContext, StageExecutor, StageInputs, StageOutput, param_metrics, param_string};
use crate::definition::{StageKind, StageParameters};
use crate::error::StageError;
use crate::gate::{GateDefinition, MetricRule, MetricSet, evaluate};
use crate::process::{CommandSpec, run_command};

#[derive(Debug, Clone)]
enum GateSource {
    /// Looked up in the pipeline's `gates`, then among the presets.
    Named(String),
    Inline(GateDefinition),
}

/// Evaluates a gate against upstream metrics, static `metrics` params and
/// the output of an optional `run` command (later sources win).
pub struct QualityGateStage {
    gate: GateSource,
    metrics: MetricSet,
    command: Option<CommandSpec>,
}

impl QualityGateStage {
    pub fn from_params(params: &StageParameters) -> Result<Self> {
        let gate = match (param_string(params, "gate")?, params.get("rules")) {
            (Some(_), Some(_)) => bail!("quality gate stage takes either 'gate' or 'rules', not both"),
            (Some(name), None) => GateSource::Named(name),
            (None, Some(rules)) => {
                let rules: Vec<MetricRule> = serde_json::from_value(rules.clone())
                    .context("Failed to parse inline gate rules")?;
                let mut gate = GateDefinition::new("inline", rules);
                gate.block_on_non_critical = params
                    .get("block_on_non_critical")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                gate.min_score = params.get("min_score").and_then(Value::as_f64);
                gate.validate()?;
                GateSource::Inline(gate)
            }
            (None, None) => bail!("quality gate stage requires 'gate' or 'rules'"),
        };
        Ok(Self {
            gate,
            metrics: param_metrics(params, "metrics")?,
            command: CommandSpec::from_params(params)?,
        })
    }

    /// Name of the referenced gate, if the stage does not define one inline.
    pub fn gate_reference(params: &StageParameters) -> Option<String> {
        param_string(params, "gate").ok().flatten()
    }
}

impl StageExecutor for QualityGateStage {
    fn kind(&self) -> StageKind {
        StageKind::QualityGate
    }

    fn execute(
        &self,
        inputs: &StageInputs,
        ctx: &StageContext<'_>,
    ) -> std::result::Result<StageOutput, StageError> {
        let gate = match &self.gate {
            GateSource::Inline(gate) => gate.clone(),
            GateSource::Named(name) => ctx
                .gates
                .get(name)
                .cloned()
                .or_else(|| GateDefinition::preset(name))
                .ok_or_else(|| StageError::Deterministic(format!("unknown gate '{name}'")))?,
        };

        let mut metrics = inputs.upstream_metrics();
        metrics.extend(self.metrics.iter().map(|(k, v)| (k.clone(), *v)));
        if let Some(command) = &self.command {
            let spec = command.rooted_at(ctx.workdir);
            let outcome = run_command(&spec, Some(ctx.secrets), ctx.remaining()?)?.check(&spec)?;
            metrics.extend(outcome.metrics);
        }
        metrics.remove("duration_ms");

        let verdict = evaluate(&metrics, &gate);
        ctx.metrics.record_gate(verdict.passed);
        info!(
            gate = verdict.gate.as_str(),
            score = verdict.score,
            passed = verdict.passed,
            "Quality gate evaluated"
        );
        if !verdict.passed {
            return Err(StageError::Rejected(Box::new(verdict)));
        }

        let mut output = StageOutput::default();
        output.metrics.insert("gate.score".to_string(), verdict.score);
        output.verdict = Some(verdict);
        Ok(output)
    }
}
