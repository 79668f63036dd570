use anyhow::{Result, bail};

use super::{StageContext, StageExecutor, StageInputs, StageOutput, param_f64, param_u64};
use crate::definition::{StageKind, StageParameters};
use crate::error::StageError;
use crate::gate::{GateDefinition, MetricRule, MetricSet, evaluate};
use crate::process::{CommandSpec, run_command};

/// Times `iterations` runs of a command and gates the latency summary.
pub struct PerformanceStage {
    command: CommandSpec,
    iterations: usize,
    warmup: usize,
    max_mean_ms: Option<f64>,
    max_p95_ms: Option<f64>,
}

impl PerformanceStage {
    pub fn from_params(params: &StageParameters) -> Result<Self> {
        let Some(command) = CommandSpec::from_params(params)? else {
            bail!("performance check requires a 'run' command");
        };
        let iterations = param_u64(params, "iterations")?.unwrap_or(5);
        if iterations == 0 {
            bail!("'iterations' must be at least 1");
        }
        let max_mean_ms = param_f64(params, "max_mean_ms")?;
        let max_p95_ms = param_f64(params, "max_p95_ms")?;
        for (key, value) in [("max_mean_ms", max_mean_ms), ("max_p95_ms", max_p95_ms)] {
            if let Some(v) = value
                && v <= 0.0
            {
                bail!("'{key}' must be positive");
            }
        }
        Ok(Self {
            command,
            iterations: iterations as usize,
            warmup: param_u64(params, "warmup")?.unwrap_or(0) as usize,
            max_mean_ms,
            max_p95_ms,
        })
    }

    fn gate(&self) -> Option<GateDefinition> {
        let mut rules = Vec::new();
        if let Some(limit) = self.max_mean_ms {
            rules.push(MetricRule::max("perf.mean_ms", limit));
        }
        if let Some(limit) = self.max_p95_ms {
            rules.push(MetricRule::max("perf.p95_ms", limit));
        }
        (!rules.is_empty()).then(|| GateDefinition::new("performance", rules))
    }
}

/// Mean, nearest-rank p95 and max of the samples.
pub fn summarize(samples_ms: &[f64]) -> MetricSet {
    let mut metrics = MetricSet::new();
    if samples_ms.is_empty() {
        return metrics;
    }
    let mut sorted = samples_ms.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
    let rank = ((0.95 * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    metrics.insert("perf.mean_ms".to_string(), mean);
    metrics.insert("perf.p95_ms".to_string(), sorted[rank - 1]);
    metrics.insert("perf.max_ms".to_string(), sorted[sorted.len() - 1]);
    metrics.insert("perf.iterations".to_string(), sorted.len() as f64);
    metrics
}

impl StageExecutor for PerformanceStage {
    fn kind(&self) -> StageKind {
        StageKind::PerformanceCheck
    }

    fn execute(
        &self,
        _inputs: &StageInputs,
        ctx: &StageContext<'_>,
    ) -> std::result::Result<StageOutput, StageError> {
        let spec = self.command.rooted_at(ctx.workdir);
        let mut samples = Vec::with_capacity(self.iterations);
        for round in 0..self.warmup + self.iterations {
            if ctx.cancel.is_cancelled() {
                return Err(StageError::Deterministic("performance check cancelled".into()));
            }
            let outcome = run_command(&spec, Some(ctx.secrets), ctx.remaining()?)?.check(&spec)?;
            if round >= self.warmup {
                samples.push(outcome.duration.as_secs_f64() * 1_000.0);
            }
        }

        let metrics = summarize(&samples);
        let mut output = StageOutput::with_metrics(metrics);
        if let Some(gate) = self.gate() {
            let verdict = evaluate(&output.metrics, &gate);
            ctx.metrics.record_gate(verdict.passed);
            if !verdict.passed {
                return Err(StageError::Rejected(Box::new(verdict)));
            }
            output.verdict = Some(verdict);
        }
        Ok(output)
    }
}
