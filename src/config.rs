use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::deploy::health::{CommandProbe, HealthProbe, StaticProbe};
use crate::deploy::target::FleetTarget;
use crate::deploy::{DeploymentEngine, Environment, EnvironmentPolicy, StrategyKind};
use crate::observability::MetricsCollector;

pub const DEFAULT_CONFIG_FILE: &str = "shipyard.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSettings {
    #[serde(default = "default_true")]
    pub auto_deploy: bool,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default = "default_strategy")]
    pub default_strategy: StrategyKind,
    #[serde(default = "default_instances")]
    pub instances: usize,
    /// Shell command run by health gates; without one every check passes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_command: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_strategy() -> StrategyKind {
    StrategyKind::Rolling
}

fn default_instances() -> usize {
    2
}

impl EnvironmentSettings {
    fn new(auto_deploy: bool, approval_required: bool, default_strategy: StrategyKind, instances: usize) -> Self {
        Self {
            auto_deploy,
            approval_required,
            default_strategy,
            instances,
            health_command: None,
        }
    }

    pub fn policy(&self) -> EnvironmentPolicy {
        EnvironmentPolicy {
            auto_deploy: self.auto_deploy,
            approval_required: self.approval_required,
            default_strategy: self.default_strategy,
        }
    }
}

fn default_environments() -> BTreeMap<String, EnvironmentSettings> {
    BTreeMap::from([
        (
            "development".to_string(),
            EnvironmentSettings::new(true, false, StrategyKind::Recreate, 1),
        ),
        (
            "staging".to_string(),
            EnvironmentSettings::new(true, false, StrategyKind::Rolling, 2),
        ),
        (
            "production".to_string(),
            EnvironmentSettings::new(false, true, StrategyKind::Rolling, 4),
        ),
    ])
}

/// Contents of `shipyard.yaml`. Every field is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    #[serde(default = "default_definitions")]
    pub definitions: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_environments")]
    pub environments: BTreeMap<String, EnvironmentSettings>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".shipyard")
}

fn default_workdir() -> PathBuf {
    PathBuf::from(".")
}

fn default_definitions() -> String {
    "pipelines/*.yaml".to_string()
}

fn default_retention_days() -> u32 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            workdir: default_workdir(),
            definitions: default_definitions(),
            retention_days: default_retention_days(),
            environments: default_environments(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let settings: Settings = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config YAML: {}", path.display()))?;
        Ok(settings)
    }

    /// `path` when given, otherwise `shipyard.yaml` in the current directory
    /// if it exists, otherwise the defaults.
    pub fn discover(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let candidate = Path::new(DEFAULT_CONFIG_FILE);
                if candidate.is_file() {
                    Self::load(candidate)
                } else {
                    debug!("No {DEFAULT_CONFIG_FILE} found; using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    /// One file-backed fleet per environment under `<state_dir>/fleets/`.
    pub fn deployment_engine(&self, metrics: MetricsCollector) -> Result<DeploymentEngine> {
        let mut engine = DeploymentEngine::new(metrics);
        let fleets = self.state_dir.join("fleets");
        for (name, settings) in &self.environments {
            let target = FleetTarget::open(fleets.join(format!("{name}.json")), settings.instances)
                .with_context(|| format!("Failed to open fleet for environment '{name}'"))?;
            let probe: Arc<dyn HealthProbe> = match &settings.health_command {
                Some(command) => Arc::new(CommandProbe::new(command.clone(), self.workdir.clone())),
                None => Arc::new(StaticProbe::default()),
            };
            engine.register(
                Environment::new(name.clone(), Arc::new(target), probe).with_policy(settings.policy()),
            );
        }
        Ok(engine)
    }
}
