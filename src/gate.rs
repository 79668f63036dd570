use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result as AnyResult};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Observed metric values keyed by name.
pub type MetricSet = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Min,
    Max,
}

/// One threshold in a gate: `metric` must be at least `min` or at most `max`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRule {
    pub metric: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_critical")]
    pub critical: bool,
}

fn default_weight() -> f64 {
    1.0
}

fn default_critical() -> bool {
    true
}

impl MetricRule {
    pub fn min(metric: impl Into<String>, threshold: f64) -> Self {
        Self {
            metric: metric.into(),
            min: Some(threshold),
            max: None,
            weight: default_weight(),
            critical: true,
        }
    }

    pub fn max(metric: impl Into<String>, threshold: f64) -> Self {
        Self {
            metric: metric.into(),
            min: None,
            max: Some(threshold),
            weight: default_weight(),
            critical: true,
        }
    }

    pub fn weighted(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }

    /// The comparison and threshold this rule declares.
    pub fn bound(&self) -> Option<(Comparison, f64)> {
        match (self.min, self.max) {
            (Some(min), None) => Some((Comparison::Min, min)),
            (None, Some(max)) => Some((Comparison::Max, max)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateDefinition {
    #[serde(default)]
    pub name: String,
    pub rules: Vec<MetricRule>,
    /// Let failing non-critical rules block promotion too.
    #[serde(default)]
    pub block_on_non_critical: bool,
    /// Minimum weighted score (0-100) required to pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f64>,
}

impl GateDefinition {
    pub fn new(name: impl Into<String>, rules: Vec<MetricRule>) -> Self {
        Self {
            name: name.into(),
            rules,
            block_on_non_critical: false,
            min_score: None,
        }
    }

    pub fn load(path: &Path) -> AnyResult<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read gate file: {}", path.display()))?;
        let mut gate: GateDefinition = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse gate YAML: {}", path.display()))?;
        if gate.name.is_empty() {
            gate.name = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "gate".to_string());
        }
        gate.validate()?;
        Ok(gate)
    }

    /// Built-in gate levels.
    pub fn preset(name: &str) -> Option<Self> {
        let (code, coverage, performance) = match name {
            "strict" => (90.0, 90.0, 85.0),
            "standard" => (80.0, 80.0, 75.0),
            "relaxed" => (70.0, 70.0, 65.0),
            _ => return None,
        };
        Some(Self::new(
            name,
            vec![
                MetricRule::min("code_quality_score", code).weighted(0.3),
                MetricRule::min("test_coverage", coverage).weighted(0.3),
                MetricRule::min("performance_score", performance).weighted(0.2),
                MetricRule::max("vulnerabilities", 0.0).weighted(0.2),
            ],
        ))
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.rules.is_empty() {
            problems.push("gate has no rules".to_string());
        }
        let mut seen = BTreeSet::new();
        for rule in &self.rules {
            if rule.metric.trim().is_empty() {
                problems.push("rule is missing a metric name".to_string());
                continue;
            }
            if !seen.insert(rule.metric.as_str()) {
                problems.push(format!("metric '{}' is declared twice", rule.metric));
            }
            match rule.bound() {
                Some((_, threshold)) if !threshold.is_finite() => {
                    problems.push(format!("metric '{}' has a non-finite threshold", rule.metric))
                }
                Some(_) => {}
                None => problems.push(format!(
                    "metric '{}' must declare exactly one of min/max",
                    rule.metric
                )),
            }
            if !rule.weight.is_finite() || rule.weight < 0.0 {
                problems.push(format!("metric '{}' has an invalid weight", rule.metric));
            }
        }
        if let Some(score) = self.min_score
            && !(0.0..=100.0).contains(&score)
        {
            problems.push(format!("min_score {score} is outside 0..=100"));
        }
        if problems.is_empty() {
            Ok(())
        } else {
            let label = if self.name.is_empty() {
                "gate"
            } else {
                self.name.as_str()
            };
            Err(PipelineError::configuration(format!(
                "invalid gate '{label}': {}",
                problems.join("; ")
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricVerdict {
    pub value: Option<f64>,
    pub threshold: f64,
    pub comparison: Comparison,
    pub weight: f64,
    pub critical: bool,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGateVerdict {
    pub gate: String,
    pub metrics: BTreeMap<String, MetricVerdict>,
    pub score: f64,
    pub passed: bool,
}

impl QualityGateVerdict {
    pub fn failures(&self) -> Vec<String> {
        self.metrics
            .iter()
            .filter(|(_, verdict)| !verdict.passed)
            .map(|(name, verdict)| {
                let op = match verdict.comparison {
                    Comparison::Min => ">=",
                    Comparison::Max => "<=",
                };
                match verdict.value {
                    Some(value) => format!("{name} {value} (want {op} {})", verdict.threshold),
                    None => format!("{name} missing (want {op} {})", verdict.threshold),
                }
            })
            .collect()
    }
}

/// Compare `metrics` against every rule of `gate`.
///
/// Pure: identical inputs always yield an identical verdict.
pub fn evaluate(metrics: &MetricSet, gate: &GateDefinition) -> QualityGateVerdict {
    let mut verdicts = BTreeMap::new();
    let mut total_weight = 0.0;
    let mut passed_weight = 0.0;
    let mut blocked = false;

    for rule in &gate.rules {
        let Some((comparison, threshold)) = rule.bound() else {
            continue;
        };
        let value = metrics.get(&rule.metric).copied();
        let passed = match (value, comparison) {
            (Some(v), Comparison::Min) => v.is_finite() && v >= threshold,
            (Some(v), Comparison::Max) => v.is_finite() && v <= threshold,
            (None, _) => false,
        };

        total_weight += rule.weight;
        if passed {
            passed_weight += rule.weight;
        } else if rule.critical || gate.block_on_non_critical {
            blocked = true;
        }

        verdicts.insert(
            rule.metric.clone(),
            MetricVerdict {
                value,
                threshold,
                comparison,
                weight: rule.weight,
                critical: rule.critical,
                passed,
            },
        );
    }

    let score = if total_weight > 0.0 {
        passed_weight / total_weight * 100.0
    } else {
        100.0
    };
    if let Some(min_score) = gate.min_score
        && score < min_score
    {
        blocked = true;
    }

    QualityGateVerdict {
        gate: gate.name.clone(),
        metrics: verdicts,
        score,
        passed: !blocked,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(pairs: &[(&str, f64)]) -> MetricSet {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn missing_metric_fails_rule() {
        let gate = GateDefinition::new("g", vec![MetricRule::min("coverage", 80.0)]);
        let verdict = evaluate(&MetricSet::new(), &gate);
        assert!(!verdict.passed);
        assert_eq!(verdict.metrics["coverage"].value, None);
        assert_eq!(verdict.failures(), vec!["coverage missing (want >= 80)"]);
    }

    #[test]
    fn min_score_blocks_even_without_critical_failures() {
        let mut gate = GateDefinition::new(
            "g",
            vec![
                MetricRule::min("coverage", 80.0),
                MetricRule::max("duplication", 3.0).non_critical().weighted(3.0),
            ],
        );
        gate.min_score = Some(50.0);
        let verdict = evaluate(&metrics(&[("coverage", 90.0), ("duplication", 5.0)]), &gate);
        assert_eq!(verdict.score, 25.0);
        assert!(!verdict.passed);
    }

    #[test]
    fn validate_rejects_ambiguous_rules() {
        let mut rule = MetricRule::min("coverage", 80.0);
        rule.max = Some(90.0);
        let gate = GateDefinition::new("bad", vec![rule, MetricRule::min("coverage", 1.0)]);
        let err = gate.validate().unwrap_err();
        assert!(err.is_configuration());
        let message = err.to_string();
        assert!(message.contains("exactly one of min/max"));
        assert!(message.contains("declared twice"));
    }

    #[test]
    fn presets_are_valid() {
        for name in ["strict", "standard", "relaxed"] {
            GateDefinition::preset(name).unwrap().validate().unwrap();
        }
        assert!(GateDefinition::preset("lenient").is_none());
    }
}
