use anyhow::{Context, Result, bail};
use once_cell::sync::Lazy;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::definition::{PipelineDefinition, StageKind, StageTemplate};
use crate::gate::{GateDefinition, MetricRule};
use crate::trigger::{TriggerKind, TriggerRule};

static TEMPLATES: Lazy<BTreeMap<&'static str, PipelineDefinition>> = Lazy::new(|| {
    BTreeMap::from([
        ("basic", basic_template()),
        ("advanced", advanced_template()),
        ("enterprise", enterprise_template()),
    ])
});

pub fn template_names() -> Vec<&'static str> {
    TEMPLATES.keys().copied().collect()
}

pub fn template(name: &str) -> Option<PipelineDefinition> {
    TEMPLATES.get(name).cloned()
}

/// Write the named template as YAML to `destination`.
pub fn generate_template(name: &str, destination: &Path) -> Result<PathBuf> {
    let Some(definition) = template(name) else {
        bail!(
            "Unknown template '{name}'. Available templates: {}",
            template_names().join(", ")
        );
    };

    let rendered = serde_yaml::to_string(&definition)?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write pipeline template: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}

fn on_branches(kind: TriggerKind, branches: &[&str]) -> TriggerRule {
    let mut rule = TriggerRule::on(kind);
    rule.branches = branches.iter().map(|b| b.to_string()).collect();
    rule
}

fn basic_template() -> PipelineDefinition {
    let mut definition = PipelineDefinition::new(
        "basic",
        vec![
            StageTemplate::new("build", StageKind::Build)
                .param("run", "make build")
                .param("artifacts", json!(["dist/*"])),
            StageTemplate::new("test", StageKind::Test)
                .needs(&["build"])
                .param("run", "make test"),
            StageTemplate::new("deploy", StageKind::Deploy)
                .needs(&["test"])
                .param("environment", "development"),
        ],
    );
    definition.description = Some("Build, test and deploy to development".into());
    definition.timeout_secs = 1800;
    definition.triggers = vec![
        TriggerRule::on(TriggerKind::Push),
        TriggerRule::on(TriggerKind::Manual),
    ];
    definition
}

fn advanced_template() -> PipelineDefinition {
    let mut definition = PipelineDefinition::new(
        "advanced",
        vec![
            StageTemplate::new("build", StageKind::Build)
                .param("run", "make build")
                .param("artifacts", json!(["dist/*"])),
            StageTemplate::new("test", StageKind::Test)
                .needs(&["build"])
                .param("run", "make test")
                .param("shards", 2),
            StageTemplate::new("security", StageKind::SecurityScan).needs(&["build"]),
            StageTemplate::new("quality", StageKind::QualityGate)
                .needs(&["test", "security"])
                .param("gate", "standard")
                .param("run", "make quality-metrics"),
            StageTemplate::new("deploy", StageKind::Deploy)
                .needs(&["quality"])
                .param("environment", "staging")
                .param("strategy", "canary")
                .param("traffic_percentage", 10.0),
        ],
    );
    definition.description = Some("Parallel test and scan, standard gate, canary to staging".into());
    definition.max_parallelism = 2;
    definition.triggers = vec![
        on_branches(TriggerKind::Push, &["main", "release/*"]),
        TriggerRule::on(TriggerKind::PullRequest),
        TriggerRule::on(TriggerKind::Manual),
    ];
    definition.retry.max_retries = 2;
    definition
}

fn enterprise_template() -> PipelineDefinition {
    let mut definition = PipelineDefinition::new(
        "enterprise",
        vec![
            StageTemplate::new("build", StageKind::Build)
                .param("run", "make build")
                .param("artifacts", json!(["dist/*"])),
            StageTemplate::new("test", StageKind::Test)
                .needs(&["build"])
                .param("run", "make test")
                .param("shards", 4),
            StageTemplate::new("security", StageKind::SecurityScan).needs(&["build"]),
            StageTemplate::new("performance", StageKind::PerformanceCheck)
                .needs(&["build"])
                .param("run", "make bench")
                .param("iterations", 10)
                .param("max_p95_ms", 250.0),
            StageTemplate::new("quality", StageKind::QualityGate)
                .needs(&["test", "security", "performance"])
                .param("gate", "release")
                .param("run", "make quality-metrics"),
            StageTemplate::new("staging", StageKind::Deploy)
                .needs(&["quality"])
                .param("environment", "staging")
                .param("strategy", "rolling"),
            StageTemplate::new("production", StageKind::Deploy)
                .needs(&["staging"])
                .param("environment", "production")
                .param("strategy", "blue_green"),
        ],
    );
    definition.description = Some("Full release train with approval-gated production".into());
    definition.max_parallelism = 3;
    definition.timeout_secs = 7200;
    definition.triggers = vec![
        on_branches(TriggerKind::Push, &["main"]),
        TriggerRule::on(TriggerKind::Tag),
        TriggerRule::on(TriggerKind::Manual),
    ];
    definition.retry.max_retries = 3;

    let mut release = GateDefinition::new(
        "release",
        vec![
            MetricRule::min("test_coverage", 90.0).weighted(0.3),
            MetricRule::min("code_quality_score", 85.0).weighted(0.3),
            MetricRule::max("vulnerabilities", 0.0).weighted(0.3),
            MetricRule::max("perf.p95_ms", 250.0).weighted(0.1).non_critical(),
        ],
    );
    release.min_score = Some(80.0);
    definition.gates.insert("release".into(), release);
    definition
}
