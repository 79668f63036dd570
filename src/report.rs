use std::fmt::Write as _;
use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::definition::StageKind;
use crate::deploy::DeploymentStatus;
use crate::run::{PipelineRun, RunFailure, RunStatus, StageStatus};

/// One executed stage as shown to humans and written to report files.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageLine {
    pub name: String,
    pub kind: StageKind,
    pub status: StageStatus,
    pub attempts: u32,
    pub duration_ms: f64,
    pub artifacts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub definition_id: String,
    pub status: RunStatus,
    /// Results in completion order.
    pub stages: Vec<StageLine>,
    /// Stages in the execution order that never ran.
    pub skipped: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

impl PipelineReport {
    pub fn from_run(run: &PipelineRun) -> Self {
        let stages = run
            .results
            .iter()
            .map(|result| StageLine {
                name: result.stage.clone(),
                kind: result.kind,
                status: result.status,
                attempts: result.attempts,
                duration_ms: result.duration_ms(),
                artifacts: result.artifacts.len(),
                gate_score: result.verdict.as_ref().map(|v| v.score),
                deployment: result.deployment.as_ref().map(|d| d.status),
                error: result.error.clone(),
            })
            .collect();
        let skipped = run
            .execution_order
            .iter()
            .filter(|stage| run.result(stage).is_none())
            .cloned()
            .collect();
        let duration_ms = match (run.started_at, run.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        };
        Self {
            run_id: run.id.clone(),
            definition_id: run.definition_id.clone(),
            status: run.status,
            stages,
            skipped,
            failure: run.failure.clone(),
            duration_ms,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Pipeline '{}' run {}: {}",
            self.definition_id, self.run_id, self.status
        );
        for line in &self.stages {
            let _ = write!(
                out,
                "  {:<8} {:<20} {:>8.0} ms  attempts={}",
                line.status.to_string(),
                line.name,
                line.duration_ms,
                line.attempts
            );
            if line.artifacts > 0 {
                let _ = write!(out, "  artifacts={}", line.artifacts);
            }
            if let Some(score) = line.gate_score {
                let _ = write!(out, "  score={score:.2}");
            }
            if let Some(deployment) = line.deployment {
                let _ = write!(out, "  deployment={deployment}");
            }
            if let Some(error) = &line.error {
                let _ = write!(out, "  error: {error}");
            }
            out.push('\n');
        }
        for stage in &self.skipped {
            let _ = writeln!(out, "  {:<8} {stage}", "skipped");
        }
        if let Some(failure) = &self.failure {
            match &failure.stage {
                Some(stage) => {
                    let _ = writeln!(out, "Failed at '{stage}': {}", failure.detail);
                }
                None => {
                    let _ = writeln!(out, "Stopped: {}", failure.detail);
                }
            }
        }
        if let Some(ms) = self.duration_ms {
            let _ = writeln!(out, "Total: {ms} ms");
        }
        out
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create report directory: {}", parent.display()))?;
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create report file: {}", path.display()))?;
        serde_json::to_writer_pretty(file, self)
            .with_context(|| format!("Failed to write report JSON: {}", path.display()))?;
        Ok(())
    }
}
