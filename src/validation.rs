use std::collections::HashSet;

use serde::Serialize;

use crate::definition::{PipelineDefinition, StageKind, StageTemplate};
use crate::error::{PipelineError, Result};
use crate::gate::GateDefinition;
use crate::scheduler::{ancestors, execution_order};
use crate::stages::quality::QualityGateStage;
use crate::stages::{StageRegistry, deploy};

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Every error folded into one configuration error.
    pub fn into_result(self, definition_id: &str) -> Result<()> {
        if self.errors.is_empty() {
            return Ok(());
        }
        Err(PipelineError::configuration(format!(
            "pipeline '{definition_id}' is invalid: {}",
            self.errors.join("; ")
        )))
    }
}

pub fn validate_definition(
    definition: &PipelineDefinition,
    registry: &StageRegistry,
) -> ValidationReport {
    let mut report = ValidationReport::default();

    if definition.id.trim().is_empty() {
        report.errors.push("Pipeline id cannot be empty".into());
    }
    if definition.stages.is_empty() {
        report
            .errors
            .push("Pipeline must contain at least one stage".into());
    }
    if definition.timeout_secs == 0 {
        report.errors.push("timeout_secs must be greater than 0".into());
    }
    if definition.max_parallelism == 0 {
        report
            .errors
            .push("max_parallelism must be greater than 0".into());
    }
    if definition.retry.multiplier < 1.0 {
        report.warnings.push(format!(
            "Retry multiplier {} is below 1; backoff will not grow",
            definition.retry.multiplier
        ));
    }

    for (idx, rule) in definition.triggers.iter().enumerate() {
        for pattern in &rule.branches {
            if let Err(err) = glob::Pattern::new(pattern) {
                report.errors.push(format!(
                    "Trigger {} branch pattern '{}' is not a valid glob: {}",
                    idx + 1,
                    pattern,
                    err
                ));
            }
        }
    }

    for (name, gate) in &definition.gates {
        if let Err(err) = gate.validate() {
            report.errors.push(format!("Gate '{name}': {err}"));
        }
    }

    report.merge(validate_graph(definition));
    for (idx, stage) in definition.stages.iter().enumerate() {
        report.merge(validate_stage(idx, stage, definition, registry));
    }
    report
}

fn validate_graph(definition: &PipelineDefinition) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut seen = HashSet::new();
    let mut structural = false;
    for stage in &definition.stages {
        if stage.name.trim().is_empty() {
            report.errors.push("Stage names cannot be empty".into());
            structural = true;
        } else if !seen.insert(stage.name.as_str()) {
            report
                .errors
                .push(format!("Stage '{}' is declared more than once", stage.name));
            structural = true;
        }
    }
    for stage in &definition.stages {
        for upstream in &stage.needs {
            if definition.stage(upstream).is_none() {
                report.errors.push(format!(
                    "Stage '{}' needs unknown stage '{}'",
                    stage.name, upstream
                ));
                structural = true;
            }
        }
    }
    // cycle detection assumes every name resolves to exactly one stage
    if !structural && let Err(err) = execution_order(definition) {
        report.errors.push(match err {
            PipelineError::Configuration(message) => message,
            other => other.to_string(),
        });
    }
    report
}

fn validate_stage(
    idx: usize,
    stage: &StageTemplate,
    definition: &PipelineDefinition,
    registry: &StageRegistry,
) -> ValidationReport {
    let mut report = ValidationReport::default();
    let label = format!("Stage {} ('{}')", idx + 1, stage.name);

    if let Err(err) = registry.create(stage.kind, &stage.params) {
        report.errors.push(format!(
            "{label}: failed to instantiate {} executor: {err:#}",
            stage.kind
        ));
    }
    if stage.timeout_secs == Some(0) {
        report.errors.push(format!("{label}: timeout_secs must be greater than 0"));
    }

    match stage.kind {
        StageKind::QualityGate => {
            if let Some(gate) = QualityGateStage::gate_reference(&stage.params)
                && !definition.gates.contains_key(&gate)
                && GateDefinition::preset(&gate).is_none()
            {
                report.errors.push(format!(
                    "{label}: references unknown gate '{gate}'. Declared gates: {}",
                    gate_names(definition)
                ));
            }
        }
        StageKind::Deploy => {
            let has_producer = ancestors(definition, &stage.name).iter().any(|name| {
                definition
                    .stage(name)
                    .is_some_and(|upstream| upstream.kind == StageKind::Build)
            });
            if !has_producer {
                report.warnings.push(format!(
                    "{label}: no upstream build stage produces an artifact to deploy"
                ));
            }
            for key in stage.params.keys() {
                if !deploy::PARAM_KEYS.contains(&key.as_str()) {
                    report
                        .warnings
                        .push(format!("{label}: unknown deploy parameter '{key}'"));
                }
            }
        }
        _ => {}
    }
    if stage.always_run && stage.needs.is_empty() {
        report.warnings.push(format!(
            "{label}: always_run has no effect on a stage without upstreams"
        ));
    }
    report
}

fn gate_names(definition: &PipelineDefinition) -> String {
    if definition.gates.is_empty() {
        "none (presets: strict, standard, relaxed)".to_string()
    } else {
        definition.gates.keys().cloned().collect::<Vec<_>>().join(", ")
    }
}
