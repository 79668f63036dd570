use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// The kind of event that started a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Push,
    PullRequest,
    Tag,
    Schedule,
    Manual,
    Webhook,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Push => "push",
            Self::PullRequest => "pull_request",
            Self::Tag => "tag",
            Self::Schedule => "schedule",
            Self::Manual => "manual",
            Self::Webhook => "webhook",
        };
        f.write_str(label)
    }
}

/// A rule in a pipeline definition saying which events may start it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRule {
    pub kind: TriggerKind,
    /// Glob patterns matched against the branch; empty means any branch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<String>,
}

impl TriggerRule {
    pub fn on(kind: TriggerKind) -> Self {
        Self {
            kind,
            branches: Vec::new(),
        }
    }

    pub fn matches(&self, ctx: &TriggerContext) -> bool {
        if self.kind != ctx.kind {
            return false;
        }
        if self.branches.is_empty() {
            return true;
        }
        let Some(branch) = ctx.branch.as_deref() else {
            return false;
        };
        self.branches.iter().any(|pattern| {
            glob::Pattern::new(pattern)
                .map(|p| p.matches(branch))
                .unwrap_or(false)
        })
    }
}

/// Context delivered by whatever fired the trigger (webhook receiver,
/// scheduler, a human at the CLI).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerContext {
    pub kind: TriggerKind,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
    /// Set when a human approved promotion into gated environments.
    #[serde(default)]
    pub approved: bool,
    pub received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub payload: BTreeMap<String, String>,
}

impl TriggerContext {
    pub fn new(kind: TriggerKind) -> Self {
        Self {
            kind,
            branch: None,
            commit: None,
            actor: None,
            approved: false,
            received_at: Utc::now(),
            payload: BTreeMap::new(),
        }
    }

    pub fn manual() -> Self {
        Self::new(TriggerKind::Manual)
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = Some(commit.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn approved(mut self, approved: bool) -> Self {
        self.approved = approved;
        self
    }
}
