//! Deployment targets.
//!
//! Strategies only see the [`DeploymentTarget`] trait. [`FleetTarget`] is a
//! simulated fleet kept in memory and optionally persisted as JSON so the CLI
//! can deploy across invocations.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::VersionMap;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct TargetError(pub String);

impl TargetError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type TargetResult<T> = std::result::Result<T, TargetError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    #[default]
    Blue,
    Green,
}

impl Slot {
    pub fn other(&self) -> Slot {
        match self {
            Slot::Blue => Slot::Green,
            Slot::Green => Slot::Blue,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Slot::Blue => "blue",
            Slot::Green => "green",
        })
    }
}

/// Operations a strategy may perform against an environment.
pub trait DeploymentTarget: Send + Sync {
    /// Instance id to running version (`None` for a never-deployed instance).
    fn versions(&self) -> TargetResult<VersionMap>;
    fn update_instance(&self, id: &str, version: Option<&str>) -> TargetResult<()>;

    fn active_slot(&self) -> TargetResult<Slot>;
    fn provision_slot(&self, slot: Slot, version: &str) -> TargetResult<()>;
    fn switch_traffic(&self, slot: Slot) -> TargetResult<()>;
    fn decommission_slot(&self, slot: Slot) -> TargetResult<()>;

    /// Route `percentage` of traffic to `version`; `None` clears the canary.
    fn set_canary(&self, version: Option<&str>, percentage: f64) -> TargetResult<()>;
    /// Move every instance to `version` and clear the canary.
    fn promote(&self, version: &str) -> TargetResult<()>;
    fn set_mirror(&self, version: Option<&str>) -> TargetResult<()>;

    fn terminate_all(&self) -> TargetResult<()>;
    fn start_all(&self, version: &str) -> TargetResult<()>;
    /// Snapshot instance versions; returns the backup id.
    fn backup(&self) -> TargetResult<String>;
    fn restore(&self, backup_id: &str) -> TargetResult<()>;

    /// Versions that finished a successful deployment, oldest first.
    fn releases(&self) -> TargetResult<Vec<String>>;
    /// Append `version` to the release history. A version already in the
    /// history rewinds it to that entry, dropping the releases after it.
    fn record_release(&self, version: &str) -> TargetResult<()>;
}

/// Releases kept per environment.
pub const RELEASE_HISTORY: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetState {
    pub instances: VersionMap,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub active_slot: Slot,
    #[serde(default)]
    pub slots: BTreeMap<Slot, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary: Option<Canary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<String>,
    #[serde(default)]
    pub backups: BTreeMap<String, VersionMap>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub releases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Canary {
    pub version: String,
    pub percentage: f64,
}

impl FleetState {
    pub fn with_instances(count: usize) -> Self {
        Self {
            instances: (1..=count).map(|i| (format!("instance-{i}"), None)).collect(),
            running: true,
            ..Self::default()
        }
    }

    /// Version currently serving the bulk of traffic.
    pub fn live_version(&self) -> Option<&str> {
        if let Some(version) = self.slots.get(&self.active_slot) {
            return Some(version.as_str());
        }
        let mut versions = self.instances.values().flatten();
        let first = versions.next()?;
        versions.all(|v| v == first).then_some(first.as_str())
    }
}

/// Simulated fleet. `open` persists every mutation to a JSON file.
#[derive(Debug)]
pub struct FleetTarget {
    state: Mutex<FleetState>,
    path: Option<PathBuf>,
    faults: Mutex<HashSet<String>>,
}

impl FleetTarget {
    pub fn in_memory(instances: usize) -> Self {
        Self {
            state: Mutex::new(FleetState::with_instances(instances)),
            path: None,
            faults: Mutex::new(HashSet::new()),
        }
    }

    /// Load the fleet from `path`, creating `instances` fresh instances when
    /// the file does not exist yet.
    pub fn open(path: impl AsRef<Path>, instances: usize) -> anyhow::Result<Self> {
        use anyhow::Context;

        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read fleet state {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse fleet state {}", path.display()))?
        } else {
            FleetState::with_instances(instances)
        };
        Ok(Self {
            state: Mutex::new(state),
            path: Some(path),
            faults: Mutex::new(HashSet::new()),
        })
    }

    pub fn snapshot(&self) -> FleetState {
        self.state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    /// Make the named operation (e.g. `"switch_traffic"`) fail from now on.
    pub fn inject_fault(&self, operation: &str) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.insert(operation.to_string());
        }
    }

    fn mutate<T>(
        &self,
        operation: &str,
        apply: impl FnOnce(&mut FleetState) -> TargetResult<T>,
    ) -> TargetResult<T> {
        if self
            .faults
            .lock()
            .map(|faults| faults.contains(operation))
            .unwrap_or(false)
        {
            return Err(TargetError::new(format!("{operation} failed: injected fault")));
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| TargetError::new("fleet state lock poisoned"))?;
        let value = apply(&mut state)?;
        if let Some(path) = &self.path {
            persist(path, &state)?;
        }
        debug!(operation, "Fleet updated");
        Ok(value)
    }

    fn read<T>(&self, apply: impl FnOnce(&FleetState) -> T) -> TargetResult<T> {
        self.state
            .lock()
            .map(|state| apply(&state))
            .map_err(|_| TargetError::new("fleet state lock poisoned"))
    }
}

fn persist(path: &Path, state: &FleetState) -> TargetResult<()> {
    let io = |err: std::io::Error| TargetError::new(format!("{}: {err}", path.display()));
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(io)?;
    }
    let json = serde_json::to_vec_pretty(state)
        .map_err(|err| TargetError::new(format!("failed to encode fleet state: {err}")))?;
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, json).map_err(io)?;
    fs::rename(&staging, path).map_err(io)
}

impl DeploymentTarget for FleetTarget {
    fn versions(&self) -> TargetResult<VersionMap> {
        self.read(|state| state.instances.clone())
    }

    fn update_instance(&self, id: &str, version: Option<&str>) -> TargetResult<()> {
        self.mutate("update_instance", |state| {
            let slot = state
                .instances
                .get_mut(id)
                .ok_or_else(|| TargetError::new(format!("unknown instance '{id}'")))?;
            *slot = version.map(str::to_string);
            Ok(())
        })
    }

    fn active_slot(&self) -> TargetResult<Slot> {
        self.read(|state| state.active_slot)
    }

    fn provision_slot(&self, slot: Slot, version: &str) -> TargetResult<()> {
        self.mutate("provision_slot", |state| {
            state.slots.insert(slot, version.to_string());
            Ok(())
        })
    }

    fn switch_traffic(&self, slot: Slot) -> TargetResult<()> {
        self.mutate("switch_traffic", |state| {
            let version = state
                .slots
                .get(&slot)
                .cloned()
                .ok_or_else(|| TargetError::new(format!("slot {slot} is not provisioned")))?;
            state.active_slot = slot;
            for instance in state.instances.values_mut() {
                *instance = Some(version.clone());
            }
            Ok(())
        })
    }

    fn decommission_slot(&self, slot: Slot) -> TargetResult<()> {
        self.mutate("decommission_slot", |state| {
            if state.active_slot == slot {
                return Err(TargetError::new(format!(
                    "refusing to decommission live slot {slot}"
                )));
            }
            state.slots.remove(&slot);
            Ok(())
        })
    }

    fn set_canary(&self, version: Option<&str>, percentage: f64) -> TargetResult<()> {
        self.mutate("set_canary", |state| {
            state.canary = version.map(|version| Canary {
                version: version.to_string(),
                percentage,
            });
            Ok(())
        })
    }

    fn promote(&self, version: &str) -> TargetResult<()> {
        self.mutate("promote", |state| {
            for instance in state.instances.values_mut() {
                *instance = Some(version.to_string());
            }
            state.canary = None;
            Ok(())
        })
    }

    fn set_mirror(&self, version: Option<&str>) -> TargetResult<()> {
        self.mutate("set_mirror", |state| {
            state.mirror = version.map(str::to_string);
            Ok(())
        })
    }

    fn terminate_all(&self) -> TargetResult<()> {
        self.mutate("terminate_all", |state| {
            state.running = false;
            Ok(())
        })
    }

    fn start_all(&self, version: &str) -> TargetResult<()> {
        self.mutate("start_all", |state| {
            for instance in state.instances.values_mut() {
                *instance = Some(version.to_string());
            }
            state.running = true;
            Ok(())
        })
    }

    fn backup(&self) -> TargetResult<String> {
        self.mutate("backup", |state| {
            let id = format!("backup-{}", uuid::Uuid::new_v4());
            state.backups.insert(id.clone(), state.instances.clone());
            Ok(id)
        })
    }

    fn restore(&self, backup_id: &str) -> TargetResult<()> {
        self.mutate("restore", |state| {
            let snapshot = state
                .backups
                .get(backup_id)
                .cloned()
                .ok_or_else(|| TargetError::new(format!("unknown backup '{backup_id}'")))?;
            state.instances = snapshot;
            state.running = true;
            Ok(())
        })
    }

    fn releases(&self) -> TargetResult<Vec<String>> {
        self.read(|state| state.releases.clone())
    }

    fn record_release(&self, version: &str) -> TargetResult<()> {
        self.mutate("record_release", |state| {
            match state.releases.iter().position(|known| known == version) {
                Some(index) => state.releases.truncate(index + 1),
                None => state.releases.push(version.to_string()),
            }
            let excess = state.releases.len().saturating_sub(RELEASE_HISTORY);
            state.releases.drain(..excess);
            Ok(())
        })
    }
}
