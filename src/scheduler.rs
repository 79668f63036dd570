use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::definition::PipelineDefinition;
use crate::error::{PipelineError, Result};
use crate::run::{PipelineRun, StageStatus};

/// Exponential backoff for transient stage failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff_ms: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 || self.initial_backoff_ms == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1.0).powi(retry as i32 - 1);
        let millis = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Topological order of the stage graph; among stages that are ready at the
/// same time the one declared first wins.
pub fn execution_order(definition: &PipelineDefinition) -> Result<Vec<String>> {
    let index: HashMap<&str, usize> = definition
        .stages
        .iter()
        .enumerate()
        .map(|(idx, stage)| (stage.name.as_str(), idx))
        .collect();

    let mut in_degree = vec![0usize; definition.stages.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); definition.stages.len()];
    for (idx, stage) in definition.stages.iter().enumerate() {
        for upstream in &stage.needs {
            let Some(&up) = index.get(upstream.as_str()) else {
                return Err(PipelineError::configuration(format!(
                    "stage '{}' needs unknown stage '{}'",
                    stage.name, upstream
                )));
            };
            in_degree[idx] += 1;
            dependents[up].push(idx);
        }
    }

    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(idx, _)| idx)
        .collect();
    let mut order = Vec::with_capacity(definition.stages.len());
    while let Some(idx) = ready.pop_first() {
        order.push(definition.stages[idx].name.clone());
        for &next in &dependents[idx] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() != definition.stages.len() {
        let mut cyclic: Vec<_> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree > 0)
            .map(|(idx, _)| definition.stages[idx].name.as_str())
            .collect();
        cyclic.sort();
        return Err(PipelineError::configuration(format!(
            "stage dependency cycle involving: {}",
            cyclic.join(", ")
        )));
    }
    Ok(order)
}

/// Every stage `stage` transitively depends on.
pub fn ancestors(definition: &PipelineDefinition, stage: &str) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut stack: Vec<&str> = definition
        .stage(stage)
        .map(|s| s.needs.iter().map(String::as_str).collect())
        .unwrap_or_default();
    while let Some(name) = stack.pop() {
        if seen.insert(name.to_string())
            && let Some(template) = definition.stage(name)
        {
            stack.extend(template.needs.iter().map(String::as_str));
        }
    }
    seen
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Already finished or in flight.
    Done,
    Ready,
    Waiting,
    /// An upstream failed; the stage can never start in this run.
    Blocked,
}

pub fn readiness(definition: &PipelineDefinition, run: &PipelineRun, stage: &str) -> Readiness {
    readiness_map(definition, run)
        .get(stage)
        .copied()
        .unwrap_or(Readiness::Blocked)
}

/// Readiness of every stage in one forward sweep; `execution_order` is
/// topological, so each upstream is classified before its dependents.
pub fn readiness_map<'a>(
    definition: &PipelineDefinition,
    run: &'a PipelineRun,
) -> HashMap<&'a str, Readiness> {
    let mut states = HashMap::with_capacity(run.execution_order.len());
    for stage in &run.execution_order {
        let state = classify(definition, run, stage, &states);
        states.insert(stage.as_str(), state);
    }
    states
}

fn classify(
    definition: &PipelineDefinition,
    run: &PipelineRun,
    stage: &str,
    known: &HashMap<&str, Readiness>,
) -> Readiness {
    if run.result(stage).is_some() || run.in_flight.contains(stage) {
        return Readiness::Done;
    }
    let Some(template) = definition.stage(stage) else {
        return Readiness::Blocked;
    };
    let mut waiting = false;
    for upstream in &template.needs {
        match run.result(upstream).map(|r| r.status) {
            Some(StageStatus::Succeeded) => {}
            Some(StageStatus::Failed) if template.always_run => {}
            Some(StageStatus::Failed) => return Readiness::Blocked,
            None => match known.get(upstream.as_str()).copied().unwrap_or(Readiness::Blocked) {
                // a skipped upstream counts as finished for always_run stages
                Readiness::Blocked if template.always_run => {}
                Readiness::Blocked => return Readiness::Blocked,
                _ => waiting = true,
            },
        }
    }
    if waiting {
        Readiness::Waiting
    } else {
        Readiness::Ready
    }
}

fn stages_in(definition: &PipelineDefinition, run: &PipelineRun, wanted: Readiness) -> Vec<String> {
    let states = readiness_map(definition, run);
    run.execution_order
        .iter()
        .filter(|stage| states.get(stage.as_str()) == Some(&wanted))
        .cloned()
        .collect()
}

/// Stages that may be dispatched now, in execution order.
pub fn ready_stages(definition: &PipelineDefinition, run: &PipelineRun) -> Vec<String> {
    stages_in(definition, run, Readiness::Ready)
}

/// Stages that were never dispatched and never can be.
pub fn blocked_stages(definition: &PipelineDefinition, run: &PipelineRun) -> Vec<String> {
    stages_in(definition, run, Readiness::Blocked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::definition::{StageKind, StageTemplate};
    use crate::run::RunOptions;
    use crate::trigger::TriggerContext;

    fn def(stages: Vec<StageTemplate>) -> PipelineDefinition {
        PipelineDefinition::new("p", stages)
    }

    #[test]
    fn ties_follow_declaration_order() {
        let definition = def(vec![
            StageTemplate::new("deploy", StageKind::Deploy).needs(&["lint", "test"]),
            StageTemplate::new("test", StageKind::Test).needs(&["build"]),
            StageTemplate::new("build", StageKind::Build),
            StageTemplate::new("lint", StageKind::QualityGate).needs(&["build"]),
        ]);
        let order = execution_order(&definition).unwrap();
        assert_eq!(order, vec!["build", "test", "lint", "deploy"]);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let definition = def(vec![StageTemplate::new("a", StageKind::Build).needs(&["a"])]);
        let err = execution_order(&definition).unwrap_err();
        assert!(err.to_string().contains("cycle involving: a"));
    }

    #[test]
    fn ancestors_are_transitive() {
        let definition = def(vec![
            StageTemplate::new("build", StageKind::Build),
            StageTemplate::new("test", StageKind::Test).needs(&["build"]),
            StageTemplate::new("deploy", StageKind::Deploy).needs(&["test"]),
        ]);
        let found = ancestors(&definition, "deploy");
        assert!(found.contains("build") && found.contains("test"));
        assert_eq!(found.len(), 2);
    }

    fn ladder(stages: usize) -> PipelineDefinition {
        let templates = (0..stages)
            .map(|i| {
                let needs: Vec<String> = (i.saturating_sub(2)..i).map(|n| format!("s{n}")).collect();
                let needs: Vec<&str> = needs.iter().map(String::as_str).collect();
                StageTemplate::new(format!("s{i}"), StageKind::Build).needs(&needs)
            })
            .collect();
        def(templates)
    }

    #[test]
    fn layered_graph_readiness_is_linear() {
        let definition = ladder(40);
        let order = execution_order(&definition).unwrap();
        let run = PipelineRun::new(&definition, order, TriggerContext::manual(), RunOptions::default());

        let started = Instant::now();
        for _ in 0..100 {
            assert_eq!(ready_stages(&definition, &run), vec!["s0"]);
            assert!(blocked_stages(&definition, &run).is_empty());
        }
        assert!(started.elapsed() < Duration::from_secs(2));

        let states = readiness_map(&definition, &run);
        assert_eq!(states["s39"], Readiness::Waiting);
        assert_eq!(readiness(&definition, &run, "missing"), Readiness::Blocked);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff_ms: 100,
            multiplier: 2.0,
            max_backoff_ms: 300,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
        assert_eq!(policy.backoff(4), Duration::from_millis(300));
        assert_eq!(RetryPolicy::immediate(3).backoff(2), Duration::ZERO);
    }
}
