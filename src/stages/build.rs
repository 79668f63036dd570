use anyhow::{Result, bail};
use glob::glob;
use serde_json::json;
use tracing::debug;

use super::{StageContext, StageExecutor, StageInputs, StageOutput, param_strings};
use crate::definition::{StageKind, StageParameters};
use crate::error::StageError;
use crate::process::{CommandSpec, run_command};

/// Runs the build command, then stores every file matched by `artifacts`.
/// Without patterns a JSON build manifest is stored instead so later stages
/// always have something to ship.
pub struct BuildStage {
    command: Option<CommandSpec>,
    patterns: Vec<String>,
}

impl BuildStage {
    pub fn from_params(params: &StageParameters) -> Result<Self> {
        let command = CommandSpec::from_params(params)?;
        let patterns = param_strings(params, "artifacts")?;
        if patterns.iter().any(|p| p.trim().is_empty()) {
            bail!("artifact patterns must not be empty");
        }
        Ok(Self { command, patterns })
    }
}

impl StageExecutor for BuildStage {
    fn kind(&self) -> StageKind {
        StageKind::Build
    }

    fn execute(
        &self,
        inputs: &StageInputs,
        ctx: &StageContext<'_>,
    ) -> std::result::Result<StageOutput, StageError> {
        let mut output = StageOutput::default();
        if let Some(command) = &self.command {
            let spec = command.rooted_at(ctx.workdir);
            let outcome = run_command(&spec, Some(ctx.secrets), ctx.remaining()?)?.check(&spec)?;
            output.metrics = outcome.metrics;
        }

        if self.patterns.is_empty() {
            let manifest = json!({
                "run_id": inputs.run_id,
                "pipeline": inputs.definition_id,
                "stage": inputs.stage,
                "commit": inputs.trigger.commit,
                "branch": inputs.trigger.branch,
            });
            let bytes = serde_json::to_vec_pretty(&manifest)
                .map_err(|err| StageError::Deterministic(err.to_string()))?;
            let name = format!("{}-manifest.json", inputs.stage);
            output.artifacts.push(ctx.artifacts.put(&name, &bytes)?);
        } else {
            for pattern in &self.patterns {
                let full = ctx.workdir.join(pattern);
                let entries = glob(&full.to_string_lossy()).map_err(|err| {
                    StageError::Deterministic(format!("invalid artifact pattern '{pattern}': {err}"))
                })?;
                for entry in entries.flatten().filter(|path| path.is_file()) {
                    let name = entry
                        .strip_prefix(ctx.workdir)
                        .unwrap_or(&entry)
                        .to_string_lossy()
                        .to_string();
                    let artifact = ctx.artifacts.put_file(&name, &entry)?;
                    debug!(name = artifact.name.as_str(), digest = artifact.digest.as_str(), "Artifact stored");
                    output.artifacts.push(artifact);
                }
            }
            if output.artifacts.is_empty() {
                return Err(StageError::Deterministic(format!(
                    "no artifacts matched {}",
                    self.patterns.join(", ")
                )));
            }
        }

        output
            .metrics
            .insert("artifacts".to_string(), output.artifacts.len() as f64);
        output.metrics.insert(
            "artifact_bytes".to_string(),
            output.artifacts.iter().map(|a| a.size as f64).sum(),
        );
        Ok(output)
    }
}
