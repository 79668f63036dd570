use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::run::{PipelineRun, RunSummary};

/// Durable home of pipeline runs. Failures here are infrastructure faults
/// and surface as [`PipelineError::System`].
pub trait RunStore: Send + Sync {
    fn save(&self, run: &PipelineRun) -> Result<()>;
    fn load(&self, id: &str) -> Result<Option<PipelineRun>>;
    /// Summaries, oldest first.
    fn list(&self) -> Result<Vec<RunSummary>>;
    /// `Ok(false)` when there was nothing to remove.
    fn remove(&self, id: &str) -> Result<bool>;
}

#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: RwLock<HashMap<String, PipelineRun>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> PipelineError {
    PipelineError::system("run store lock poisoned")
}

impl RunStore for MemoryRunStore {
    fn save(&self, run: &PipelineRun) -> Result<()> {
        self.runs
            .write()
            .map_err(|_| poisoned())?
            .insert(run.id.clone(), run.clone());
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<PipelineRun>> {
        Ok(self.runs.read().map_err(|_| poisoned())?.get(id).cloned())
    }

    fn list(&self) -> Result<Vec<RunSummary>> {
        let mut summaries: Vec<_> = self
            .runs
            .read()
            .map_err(|_| poisoned())?
            .values()
            .map(PipelineRun::summary)
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(summaries)
    }

    fn remove(&self, id: &str) -> Result<bool> {
        Ok(self
            .runs
            .write()
            .map_err(|_| poisoned())?
            .remove(id)
            .is_some())
    }
}

/// One pretty-printed JSON file per run under `<root>/runs/`.
#[derive(Debug, Clone)]
pub struct FsRunStore {
    dir: PathBuf,
}

impl FsRunStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let dir = root.as_ref().join("runs");
        fs::create_dir_all(&dir).map_err(|err| {
            PipelineError::system(format!("failed to create {}: {err}", dir.display()))
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(PipelineError::UnknownRun(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    fn read(path: &Path) -> Result<PipelineRun> {
        let raw = fs::read(path).map_err(|err| {
            PipelineError::system(format!("failed to read {}: {err}", path.display()))
        })?;
        serde_json::from_slice(&raw).map_err(|err| {
            PipelineError::system(format!("corrupt run file {}: {err}", path.display()))
        })
    }
}

impl RunStore for FsRunStore {
    fn save(&self, run: &PipelineRun) -> Result<()> {
        let path = self.path_for(&run.id)?;
        let staging = self.dir.join(format!(".{}.tmp", run.id));
        let json = serde_json::to_vec_pretty(run)?;
        fs::write(&staging, json)
            .and_then(|_| fs::rename(&staging, &path))
            .map_err(|err| {
                PipelineError::system(format!("failed to persist run {}: {err}", run.id))
            })?;
        debug!(run_id = run.id.as_str(), status = %run.status, "Run persisted");
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<PipelineRun>> {
        let path = match self.path_for(id) {
            Ok(path) => path,
            Err(PipelineError::UnknownRun(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::read(&path).map(Some)
    }

    fn list(&self) -> Result<Vec<RunSummary>> {
        let entries = fs::read_dir(&self.dir).map_err(|err| {
            PipelineError::system(format!("failed to list {}: {err}", self.dir.display()))
        })?;
        let mut summaries = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path) {
                Ok(run) => summaries.push(run.summary()),
                Err(err) => warn!(path = %path.display(), error = %err, "Skipping unreadable run"),
            }
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(summaries)
    }

    fn remove(&self, id: &str) -> Result<bool> {
        let path = self.path_for(id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(PipelineError::system(format!(
                "failed to remove {}: {err}",
                path.display()
            ))),
        }
    }
}
