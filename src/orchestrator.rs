//! Pipeline orchestrator.
//!
//! Owns pipeline definitions and the runs created from them. A run is driven
//! by [`Orchestrator::advance`]: ready stages are dispatched onto scoped
//! threads (at most `max_parallelism` at a time), their results come back
//! over a channel and the dispatch loop, the only writer of the run, appends
//! them in completion order until nothing else can start.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, info_span, instrument, warn};

use crate::artifact::{ArtifactStore, MemoryArtifactStore};
use crate::cancel::CancellationToken;
use crate::definition::{PipelineDefinition, StageTemplate};
use crate::deploy::DeploymentEngine;
use crate::error::{PipelineError, Result, StageError};
use crate::gate::MetricSet;
use crate::notify::{Notifier, RunEvent, TracingNotifier};
use crate::observability::MetricsCollector;
use crate::run::{PipelineRun, RunFailure, RunOptions, RunStatus, RunSummary, StageResult, StageStatus};
use crate::scheduler::{ancestors, execution_order, ready_stages};
use crate::secrets::{EnvSecretStore, SecretStore};
use crate::stages::{StageContext, StageInputs, StageOutcome, StageRegistry, run_stage};
use crate::store::{MemoryRunStore, RunStore};
use crate::trigger::TriggerContext;
use crate::validation::validate_definition;

/// A run that lives in memory while it can still change.
struct ActiveRun {
    run: Mutex<PipelineRun>,
    cancel: CancellationToken,
    /// Held for the whole of `advance`; `cancel` uses it to tell whether a
    /// dispatch loop is running.
    driver: Mutex<()>,
}

impl ActiveRun {
    fn new(run: PipelineRun) -> Arc<Self> {
        Arc::new(Self {
            run: Mutex::new(run),
            cancel: CancellationToken::new(),
            driver: Mutex::new(()),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, PipelineRun>> {
        self.run
            .lock()
            .map_err(|_| PipelineError::system("pipeline run state lock poisoned"))
    }
}

pub struct Orchestrator {
    definitions: RwLock<HashMap<String, Arc<PipelineDefinition>>>,
    active: RwLock<HashMap<String, Arc<ActiveRun>>>,
    registry: StageRegistry,
    store: Arc<dyn RunStore>,
    artifacts: Arc<dyn ArtifactStore>,
    secrets: Arc<dyn SecretStore>,
    deployer: Arc<DeploymentEngine>,
    notifier: Arc<dyn Notifier>,
    metrics: MetricsCollector,
    workdir: PathBuf,
}

impl Orchestrator {
    /// In-memory collaborators everywhere; swap them with the `with_*`
    /// builders.
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        let metrics = MetricsCollector::new();
        Self {
            definitions: RwLock::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
            registry: StageRegistry::with_defaults(),
            store: Arc::new(MemoryRunStore::new()),
            artifacts: Arc::new(MemoryArtifactStore::new()),
            secrets: Arc::new(EnvSecretStore::default()),
            deployer: Arc::new(DeploymentEngine::new(metrics.clone())),
            notifier: Arc::new(TracingNotifier),
            metrics,
            workdir: workdir.into(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_deployer(mut self, deployer: DeploymentEngine) -> Self {
        self.deployer = Arc::new(deployer);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_registry(mut self, registry: StageRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn deployer(&self) -> &DeploymentEngine {
        &self.deployer
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Validate and register a definition, replacing any earlier one with the
    /// same id. Every problem found is listed in the returned error.
    pub fn define_pipeline(&self, mut definition: PipelineDefinition) -> Result<Arc<PipelineDefinition>> {
        definition.name_gates();
        let report = validate_definition(&definition, &self.registry);
        for warning in &report.warnings {
            warn!(pipeline = definition.id.as_str(), "{warning}");
        }
        report.into_result(&definition.id)?;

        let definition = Arc::new(definition);
        let mut definitions = self
            .definitions
            .write()
            .map_err(|_| PipelineError::system("definition registry lock poisoned"))?;
        if definitions
            .insert(definition.id.clone(), definition.clone())
            .is_some()
        {
            info!(pipeline = definition.id.as_str(), "Pipeline definition replaced");
        }
        Ok(definition)
    }

    pub fn definition(&self, id: &str) -> Option<Arc<PipelineDefinition>> {
        self.definitions
            .read()
            .ok()
            .and_then(|definitions| definitions.get(id).cloned())
    }

    fn require_definition(&self, id: &str) -> Result<Arc<PipelineDefinition>> {
        self.definition(id).ok_or_else(|| {
            PipelineError::configuration(format!("unknown pipeline definition '{id}'"))
        })
    }

    /// Create a run for `definition_id` and move it to `running`. No stage
    /// is dispatched until [`Self::advance`].
    #[instrument(skip(self, trigger, options), fields(trigger = %trigger.kind))]
    pub fn start(
        &self,
        definition_id: &str,
        trigger: TriggerContext,
        options: RunOptions,
    ) -> Result<PipelineRun> {
        let definition = self.require_definition(definition_id)?;
        if !definition.accepts(&trigger) {
            return Err(PipelineError::configuration(format!(
                "pipeline '{definition_id}' is not triggered by {} events{}",
                trigger.kind,
                trigger
                    .branch
                    .as_deref()
                    .map(|b| format!(" on branch '{b}'"))
                    .unwrap_or_default()
            )));
        }
        let order = execution_order(&definition)?;

        let mut run = PipelineRun::new(&definition, order, trigger, options);
        self.store.save(&run)?;
        run.transition(RunStatus::Running)?;
        self.store.save(&run)?;

        self.active
            .write()
            .map_err(|_| PipelineError::system("active run table lock poisoned"))?
            .insert(run.id.clone(), ActiveRun::new(run.clone()));
        self.notifier.notify(&RunEvent::RunStarted {
            run_id: run.id.clone(),
            definition_id: run.definition_id.clone(),
        });
        Ok(run)
    }

    /// `start` followed by `advance`.
    pub fn run(
        &self,
        definition_id: &str,
        trigger: TriggerContext,
        options: RunOptions,
    ) -> Result<PipelineRun> {
        let run = self.start(definition_id, trigger, options)?;
        self.advance(&run.id)
    }

    fn active_run(&self, run_id: &str) -> Result<Option<Arc<ActiveRun>>> {
        Ok(self
            .active
            .read()
            .map_err(|_| PipelineError::system("active run table lock poisoned"))?
            .get(run_id)
            .cloned())
    }

    /// The active entry for `run_id`, reviving a persisted run that never
    /// reached a terminal state.
    fn resume(&self, run_id: &str) -> Result<Option<Arc<ActiveRun>>> {
        if let Some(active) = self.active_run(run_id)? {
            return Ok(Some(active));
        }
        let Some(mut run) = self.store.load(run_id)? else {
            return Err(PipelineError::UnknownRun(run_id.to_string()));
        };
        if run.status.is_terminal() {
            return Ok(None);
        }
        // stages that were in flight when the previous driver stopped run again
        run.in_flight.clear();
        let mut active = self
            .active
            .write()
            .map_err(|_| PipelineError::system("active run table lock poisoned"))?;
        Ok(Some(
            active
                .entry(run_id.to_string())
                .or_insert_with(|| ActiveRun::new(run))
                .clone(),
        ))
    }

    fn retire(&self, run_id: &str) {
        if let Ok(mut active) = self.active.write() {
            active.remove(run_id);
        }
    }

    /// Drive the run until no further stage can start, then settle its
    /// terminal status. Only infrastructure faults come back as `Err`.
    #[instrument(skip(self))]
    pub fn advance(&self, run_id: &str) -> Result<PipelineRun> {
        let Some(active) = self.resume(run_id)? else {
            return self.get_run(run_id);
        };
        let _driver = active
            .driver
            .lock()
            .map_err(|_| PipelineError::system("run driver lock poisoned"))?;

        let (definition, deadline) = {
            let mut run = active.lock()?;
            if run.status.is_terminal() {
                return Ok(run.clone());
            }
            if run.status == RunStatus::Pending {
                run.transition(RunStatus::Running)?;
                self.store.save(&run)?;
            }
            let definition = self.require_definition(&run.definition_id)?;
            if definition.fingerprint() != run.definition_fingerprint {
                warn!(
                    pipeline = definition.id.as_str(),
                    "Definition changed since the run started; continuing with the current one"
                );
            }
            let elapsed = run
                .started_at
                .and_then(|at| (Utc::now() - at).to_std().ok())
                .unwrap_or_default();
            let budget = Duration::from_secs(definition.timeout_secs).saturating_sub(elapsed);
            (definition, Instant::now() + budget)
        };

        let outcome = self.dispatch(&active, &definition, deadline);
        let finished = self.settle(&active, outcome);
        self.retire(run_id);
        finished
    }

    fn dispatch(
        &self,
        active: &ActiveRun,
        definition: &PipelineDefinition,
        deadline: Instant,
    ) -> DispatchOutcome {
        let mut state = DispatchOutcome::default();
        let (tx, rx) = mpsc::channel::<StageOutcome>();

        thread::scope(|scope| {
            let mut in_flight = 0usize;
            loop {
                if !active.cancel.is_cancelled() && state.system_error.is_none() {
                    let ready = match active.lock() {
                        Ok(run) => ready_stages(definition, &run),
                        Err(err) => {
                            state.system_error = Some(err);
                            Vec::new()
                        }
                    };
                    for stage in ready {
                        if in_flight >= definition.max_parallelism {
                            break;
                        }
                        let Some(template) = definition.stage(&stage) else {
                            continue;
                        };
                        if state.failure.is_some() && !template.always_run {
                            continue;
                        }
                        let executor = match self.registry.create(template.kind, &template.params) {
                            Ok(executor) => executor,
                            Err(err) => {
                                let failed = unstarted_failure(template, format!("{err:#}"));
                                self.record(active, definition, failed, &mut state);
                                continue;
                            }
                        };
                        let inputs = match self.claim(active, definition, template) {
                            Ok(inputs) => inputs,
                            Err(err) => {
                                state.system_error.get_or_insert(err);
                                break;
                            }
                        };

                        let remaining = deadline.saturating_duration_since(Instant::now());
                        let timeout = template
                            .timeout_secs
                            .map(Duration::from_secs)
                            .map_or(remaining, |limit| limit.min(remaining));
                        let ctx = StageContext {
                            workdir: &self.workdir,
                            artifacts: self.artifacts.as_ref(),
                            secrets: self.secrets.as_ref(),
                            deployer: self.deployer.as_ref(),
                            metrics: &self.metrics,
                            cancel: &active.cancel,
                            gates: &definition.gates,
                            deadline: Some(Instant::now() + timeout),
                        };
                        let retry = &definition.retry;
                        let tx = tx.clone();
                        let span = info_span!("stage", run_id = inputs.run_id.as_str(), stage = stage.as_str());
                        scope.spawn(move || {
                            let _entered = span.enter();
                            let outcome = run_stage(template, executor.as_ref(), &inputs, &ctx, retry);
                            let _ = tx.send(outcome);
                        });
                        in_flight += 1;
                    }
                }

                if in_flight == 0 {
                    break;
                }
                let received = if state.timed_out {
                    rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
                } else {
                    rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                };
                match received {
                    Ok(outcome) => {
                        in_flight -= 1;
                        self.record(active, definition, outcome, &mut state);
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        warn!(timeout_secs = definition.timeout_secs, "Pipeline timed out");
                        state.timed_out = true;
                        state.failure.get_or_insert(RunFailure {
                            stage: None,
                            detail: "pipeline timed out".to_string(),
                        });
                        active.cancel.cancel();
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        state
    }

    /// Mark `template` in flight and snapshot what it needs from the run.
    fn claim(
        &self,
        active: &ActiveRun,
        definition: &PipelineDefinition,
        template: &StageTemplate,
    ) -> Result<StageInputs> {
        let mut run = active.lock()?;
        run.in_flight.insert(template.name.clone());
        let upstream_names = ancestors(definition, &template.name);
        let upstream = run
            .results
            .iter()
            .filter(|result| upstream_names.contains(&result.stage))
            .cloned()
            .collect();
        self.store.save(&run)?;
        Ok(StageInputs {
            run_id: run.id.clone(),
            definition_id: run.definition_id.clone(),
            stage: template.name.clone(),
            trigger: run.trigger.clone(),
            options: run.options.clone(),
            upstream,
        })
    }

    /// Append a finished stage and decide whether the run can go on.
    fn record(
        &self,
        active: &ActiveRun,
        definition: &PipelineDefinition,
        outcome: StageOutcome,
        state: &mut DispatchOutcome,
    ) {
        let system = outcome.is_system_failure();
        let StageOutcome { result, error } = outcome;
        let stage = result.stage.clone();
        let tolerated = definition
            .stage(&stage)
            .is_some_and(|template| template.continue_on_error)
            && !system;
        let detail = error.as_ref().map(StageError::to_string);

        if result.status == StageStatus::Failed {
            if system {
                state
                    .system_error
                    .get_or_insert_with(|| PipelineError::system(detail.clone().unwrap_or_default()));
            }
            if tolerated {
                info!(stage = stage.as_str(), "Stage failure tolerated (continue_on_error)");
            } else if state.failure.is_none() {
                state.failure = Some(RunFailure {
                    stage: Some(stage.clone()),
                    detail: detail.clone().unwrap_or_else(|| "stage failed".to_string()),
                });
            }
        }

        let status = result.status;
        let persisted = active.lock().and_then(|mut run| {
            run.append(result)?;
            self.store.save(&run)?;
            Ok(run.id.clone())
        });
        match persisted {
            Ok(run_id) => self.notifier.notify(&RunEvent::StageFinished {
                run_id,
                stage,
                status,
                detail,
            }),
            Err(err) => {
                state.system_error.get_or_insert(err);
            }
        }
    }

    fn settle(&self, active: &ActiveRun, outcome: DispatchOutcome) -> Result<PipelineRun> {
        let mut run = active.lock()?;
        run.in_flight.clear();
        let status = if outcome.timed_out {
            RunStatus::Failed
        } else if active.cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if outcome.failure.is_some() || outcome.system_error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        run.failure = match (&outcome.failure, &outcome.system_error) {
            (Some(failure), _) => Some(failure.clone()),
            (None, Some(err)) => Some(RunFailure {
                stage: None,
                detail: err.to_string(),
            }),
            (None, None) if status == RunStatus::Cancelled => Some(RunFailure {
                stage: None,
                detail: "cancelled".to_string(),
            }),
            (None, None) => None,
        };
        run.transition(status)?;
        let saved = self.store.save(&run);

        let duration = match (run.started_at, run.finished_at) {
            (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        };
        self.metrics.record_run(status, duration);
        self.notifier.notify(&RunEvent::RunFinished {
            run_id: run.id.clone(),
            definition_id: run.definition_id.clone(),
            status,
        });

        if let Some(err) = outcome.system_error {
            return Err(err);
        }
        saved?;
        Ok(run.clone())
    }

    /// Ask a run to stop. Running stages finish their current step and the
    /// run ends `cancelled`; nothing new is dispatched.
    pub fn cancel(&self, run_id: &str) -> Result<PipelineRun> {
        let Some(active) = self.resume(run_id)? else {
            let run = self.get_run(run_id)?;
            return Err(PipelineError::InvalidTransition {
                run_id: run.id,
                from: run.status,
                to: RunStatus::Cancelled,
            });
        };
        active.cancel.cancel();

        match active.driver.try_lock() {
            Ok(_idle) => {
                let mut run = active.lock()?;
                if !run.status.is_terminal() {
                    run.in_flight.clear();
                    run.failure.get_or_insert(RunFailure {
                        stage: None,
                        detail: "cancelled".to_string(),
                    });
                    run.transition(RunStatus::Cancelled)?;
                    self.store.save(&run)?;
                    self.metrics.record_run(RunStatus::Cancelled, Duration::ZERO);
                    self.notifier.notify(&RunEvent::RunFinished {
                        run_id: run.id.clone(),
                        definition_id: run.definition_id.clone(),
                        status: RunStatus::Cancelled,
                    });
                }
                let snapshot = run.clone();
                drop(run);
                self.retire(run_id);
                Ok(snapshot)
            }
            // the dispatch loop owns the run; it settles it as cancelled
            Err(TryLockError::WouldBlock) => Ok(active.lock()?.clone()),
            Err(TryLockError::Poisoned(_)) => Err(PipelineError::system("run driver lock poisoned")),
        }
    }

    pub fn get_run(&self, run_id: &str) -> Result<PipelineRun> {
        if let Some(active) = self.active_run(run_id)? {
            return Ok(active.lock()?.clone());
        }
        self.store
            .load(run_id)?
            .ok_or_else(|| PipelineError::UnknownRun(run_id.to_string()))
    }

    pub fn list_runs(&self) -> Result<Vec<RunSummary>> {
        self.store.list()
    }

    /// Drop finished runs older than `retention`; returns the removed ids.
    pub fn prune(&self, retention: chrono::Duration) -> Result<Vec<String>> {
        let cutoff = Utc::now() - retention;
        let mut removed = Vec::new();
        for summary in self.store.list()? {
            let expired = summary.status.is_terminal()
                && summary.finished_at.is_some_and(|finished| finished < cutoff);
            if expired && self.store.remove(&summary.id)? {
                removed.push(summary.id);
            }
        }
        if !removed.is_empty() {
            info!(removed = removed.len(), "Pruned finished runs");
        }
        Ok(removed)
    }
}

#[derive(Default)]
struct DispatchOutcome {
    failure: Option<RunFailure>,
    system_error: Option<PipelineError>,
    timed_out: bool,
}

fn unstarted_failure(template: &StageTemplate, detail: String) -> StageOutcome {
    let now = Utc::now();
    StageOutcome {
        result: StageResult {
            stage: template.name.clone(),
            kind: template.kind,
            status: StageStatus::Failed,
            artifacts: Vec::new(),
            metrics: MetricSet::new(),
            attempts: 0,
            error: Some(detail.clone()),
            verdict: None,
            deployment: None,
            started_at: now,
            finished_at: now,
        },
        error: Some(StageError::Deterministic(detail)),
    }
}
