use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use glob::glob;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::gate::GateDefinition;
use crate::scheduler::RetryPolicy;
use crate::trigger::{TriggerContext, TriggerRule};

pub type StageParameters = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Build,
    Test,
    QualityGate,
    SecurityScan,
    PerformanceCheck,
    Deploy,
}

impl StageKind {
    pub const ALL: [StageKind; 6] = [
        StageKind::Build,
        StageKind::Test,
        StageKind::QualityGate,
        StageKind::SecurityScan,
        StageKind::PerformanceCheck,
        StageKind::Deploy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Test => "test",
            Self::QualityGate => "quality_gate",
            Self::SecurityScan => "security_scan",
            Self::PerformanceCheck => "performance_check",
            Self::Deploy => "deploy",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTemplate {
    pub name: String,
    pub kind: StageKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub continue_on_error: bool,
    /// Start once every upstream finished, whatever its status.
    #[serde(default, skip_serializing_if = "is_false")]
    pub always_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: StageParameters,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl StageTemplate {
    pub fn new(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            needs: Vec::new(),
            continue_on_error: false,
            always_run: false,
            timeout_secs: None,
            max_retries: None,
            params: StageParameters::new(),
        }
    }

    pub fn needs(mut self, upstream: &[&str]) -> Self {
        self.needs = upstream.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn always_run(mut self) -> Self {
        self.always_run = true;
        self
    }
}

/// A named pipeline template. Immutable once registered with the
/// orchestrator, which hands it out as `Arc<PipelineDefinition>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub stages: Vec<StageTemplate>,
    /// Events allowed to start the pipeline; empty accepts any event.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<TriggerRule>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub gates: BTreeMap<String, GateDefinition>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_timeout_secs() -> u64 {
    3600
}

fn default_max_parallelism() -> usize {
    1
}

impl PipelineDefinition {
    pub fn new(id: impl Into<String>, stages: Vec<StageTemplate>) -> Self {
        Self {
            id: id.into(),
            description: None,
            stages,
            triggers: Vec::new(),
            timeout_secs: default_timeout_secs(),
            max_parallelism: default_max_parallelism(),
            gates: BTreeMap::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
        let mut definition: PipelineDefinition = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse pipeline YAML: {}", path.display()))?;
        definition.name_gates();
        Ok(definition)
    }

    /// Gates declared in the `gates` map take their key as name.
    pub fn name_gates(&mut self) {
        for (name, gate) in self.gates.iter_mut() {
            if gate.name.is_empty() {
                gate.name = name.clone();
            }
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageTemplate> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    pub fn accepts(&self, trigger: &TriggerContext) -> bool {
        self.triggers.is_empty() || self.triggers.iter().any(|rule| rule.matches(trigger))
    }

    /// Stable sha256 over the canonical JSON form of the definition.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        let serialized = serde_json::to_vec(self).unwrap_or_default();
        hasher.update(self.id.as_bytes());
        hasher.update(serialized);
        format!("{:x}", hasher.finalize())
    }
}

/// Definitions loaded from disk, keyed by id.
#[derive(Debug, Default)]
pub struct DefinitionCatalog {
    definitions: HashMap<String, (PathBuf, Arc<PipelineDefinition>)>,
}

impl DefinitionCatalog {
    pub fn load_glob(pattern: &str) -> Result<Self> {
        let mut catalog = Self::default();
        let matches = glob(pattern).with_context(|| format!("Invalid glob pattern: {pattern}"))?;
        for entry in matches {
            let path = entry?;
            if !path.is_file() {
                continue;
            }
            let definition = PipelineDefinition::load(&path)?;
            if let Some((previous, _)) = catalog.definitions.get(&definition.id) {
                bail!(
                    "Pipeline id '{}' is defined twice: {} and {}",
                    definition.id,
                    previous.display(),
                    path.display()
                );
            }
            catalog
                .definitions
                .insert(definition.id.clone(), (path, Arc::new(definition)));
        }
        Ok(catalog)
    }

    pub fn get(&self, id: &str) -> Option<Arc<PipelineDefinition>> {
        self.definitions.get(id).map(|(_, def)| def.clone())
    }

    pub fn path_of(&self, id: &str) -> Option<&Path> {
        self.definitions.get(id).map(|(path, _)| path.as_path())
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.definitions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
