use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactRef;
use crate::definition::{PipelineDefinition, StageKind};
use crate::deploy::{DeploymentResult, StrategyKind};
use crate::error::{PipelineError, Result};
use crate::gate::{MetricSet, QualityGateVerdict};
use crate::trigger::TriggerContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        })
    }
}

/// Outcome of one stage. Appended to the run once and never changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: String,
    pub kind: StageKind,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactRef>,
    #[serde(default)]
    pub metrics: MetricSet,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<QualityGateVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl StageResult {
    pub fn succeeded(&self) -> bool {
        self.status == StageStatus::Succeeded
    }

    pub fn duration_ms(&self) -> f64 {
        self.metrics.get("duration_ms").copied().unwrap_or_default()
    }
}

/// Caller-supplied knobs for a single run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub definition_id: String,
    pub definition_fingerprint: String,
    pub trigger: TriggerContext,
    #[serde(default)]
    pub options: RunOptions,
    pub execution_order: Vec<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub in_flight: BTreeSet<String>,
    #[serde(default)]
    pub results: Vec<StageResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(
        definition: &PipelineDefinition,
        execution_order: Vec<String>,
        trigger: TriggerContext,
        options: RunOptions,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            definition_id: definition.id.clone(),
            definition_fingerprint: definition.fingerprint(),
            trigger,
            options,
            execution_order,
            status: RunStatus::Pending,
            in_flight: BTreeSet::new(),
            results: Vec::new(),
            failure: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn result(&self, stage: &str) -> Option<&StageResult> {
        self.results.iter().find(|r| r.stage == stage)
    }

    pub fn transition(&mut self, next: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                run_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        if next == RunStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Record a completed stage. Rejects duplicates so results stay
    /// append-only.
    pub fn append(&mut self, result: StageResult) -> Result<()> {
        if self.result(&result.stage).is_some() {
            return Err(PipelineError::system(format!(
                "stage '{}' already has a result in run {}",
                result.stage, self.id
            )));
        }
        self.in_flight.remove(&result.stage);
        self.results.push(result);
        Ok(())
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id.clone(),
            definition_id: self.definition_id.clone(),
            status: self.status,
            stages_completed: self.results.len(),
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: String,
    pub definition_id: String,
    pub status: RunStatus,
    pub stages_completed: usize,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
