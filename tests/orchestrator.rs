use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use shipyard::artifact::{ArtifactRef, ArtifactStore};
use shipyard::deploy::target::FleetTarget;
use shipyard::deploy::{DeploymentEngine, DeploymentStatus, Environment, EnvironmentPolicy, StaticProbe};
use shipyard::error::{PipelineError, Result as PipelineResult};
use shipyard::notify::{Notifier, NotifierSet, RunEvent, TracingNotifier};
use shipyard::observability::MetricsCollector;
use shipyard::report::PipelineReport;
use shipyard::run::{RunOptions, RunStatus, StageStatus};
use shipyard::scheduler::blocked_stages;
use shipyard::stages::{StageContext, StageExecutor, StageInputs, StageOutput, StageRegistry};
use shipyard::store::FsRunStore;
use shipyard::trigger::{TriggerContext, TriggerKind, TriggerRule};
use shipyard::{Orchestrator, PipelineDefinition, StageError, StageKind, StageTemplate};

fn orchestrator(workdir: &Path) -> Orchestrator {
    let metrics = MetricsCollector::new();
    let deployer = DeploymentEngine::new(metrics.clone())
        .with_environment(Environment::new(
            "staging",
            Arc::new(FleetTarget::in_memory(4)),
            Arc::new(StaticProbe::default()),
        ))
        .with_environment(
            Environment::new(
                "production",
                Arc::new(FleetTarget::in_memory(2)),
                Arc::new(StaticProbe::default()),
            )
            .with_policy(EnvironmentPolicy {
                auto_deploy: false,
                approval_required: true,
                ..EnvironmentPolicy::default()
            }),
        );
    Orchestrator::new(workdir)
        .with_deployer(deployer)
        .with_metrics(metrics)
}

fn build() -> StageTemplate {
    StageTemplate::new("build", StageKind::Build).param("run", "echo '::metric build_ok=1'")
}

fn test_stage(run: &str) -> StageTemplate {
    StageTemplate::new("test", StageKind::Test)
        .needs(&["build"])
        .param("run", run)
}

fn deploy(environment: &str) -> StageTemplate {
    StageTemplate::new("deploy", StageKind::Deploy)
        .needs(&["test"])
        .param("environment", environment)
        .param("batch_size", 2)
        .param("health", serde_json::json!({ "interval_ms": 1, "attempts": 1 }))
}

fn quick_retries(mut definition: PipelineDefinition) -> PipelineDefinition {
    definition.retry.initial_backoff_ms = 1;
    definition
}

#[test]
fn build_test_deploy_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path());
    orch.define_pipeline(PipelineDefinition::new(
        "app",
        vec![build(), test_stage("echo '::metric tests_passed=12'"), deploy("staging")],
    ))
    .unwrap();

    let run = orch
        .run("app", TriggerContext::manual(), RunOptions::default())
        .unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    let stages: Vec<_> = run.results.iter().map(|r| r.stage.as_str()).collect();
    assert_eq!(stages, vec!["build", "test", "deploy"]);
    let deployment = run.result("deploy").unwrap().deployment.as_ref().unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Succeeded);
    assert_eq!(deployment.health_gates, 2);
    assert_eq!(run.result("test").unwrap().metrics["tests_passed"], 12.0);
    assert!(run.failure.is_none());
    assert!(run.finished_at.is_some());

    let snapshot = orch.metrics().snapshot();
    assert_eq!(snapshot.runs.succeeded, 1);
    assert_eq!(snapshot.deployments.succeeded, 1);
}

#[test]
fn failing_test_stops_before_deploy() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path());
    orch.define_pipeline(PipelineDefinition::new(
        "app",
        vec![build(), test_stage("echo 'assertion failed' >&2; exit 1"), deploy("staging")],
    ))
    .unwrap();

    let run = orch
        .run("app", TriggerContext::manual(), RunOptions::default())
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.results.len(), 2);
    assert!(run.result("deploy").is_none());
    let failure = run.failure.as_ref().unwrap();
    assert_eq!(failure.stage.as_deref(), Some("test"));
    assert!(failure.detail.contains("assertion failed"));
    assert_eq!(run.result("build").unwrap().status, StageStatus::Succeeded);

    let report = PipelineReport::from_run(&run);
    assert_eq!(report.skipped, vec!["deploy".to_string()]);
}

#[test]
fn results_follow_dependencies() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path());
    let mut definition = PipelineDefinition::new(
        "diamond",
        vec![
            StageTemplate::new("package", StageKind::Build).needs(&["unit", "lint"]),
            StageTemplate::new("unit", StageKind::Test)
                .needs(&["compile"])
                .param("run", "sleep 0.05"),
            StageTemplate::new("lint", StageKind::Test)
                .needs(&["compile"])
                .param("run", "true"),
            StageTemplate::new("compile", StageKind::Build),
        ],
    );
    definition.max_parallelism = 2;
    orch.define_pipeline(definition).unwrap();

    let run = orch
        .run("diamond", TriggerContext::manual(), RunOptions::default())
        .unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.execution_order, vec!["compile", "unit", "lint", "package"]);
    let position = |name: &str| run.results.iter().position(|r| r.stage == name).unwrap();
    assert!(position("compile") < position("unit"));
    assert!(position("compile") < position("lint"));
    assert!(position("unit") < position("package"));
    assert!(position("lint") < position("package"));
    let package = run.result("package").unwrap();
    assert!(package.started_at >= run.result("unit").unwrap().finished_at);
}

#[test]
fn tolerated_failure_skips_dependents_but_run_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path());
    orch.define_pipeline(PipelineDefinition::new(
        "lenient",
        vec![
            build(),
            StageTemplate::new("lint", StageKind::Test)
                .needs(&["build"])
                .param("run", "exit 3")
                .continue_on_error(),
            StageTemplate::new("docs", StageKind::Build).needs(&["lint"]),
            test_stage("true"),
        ],
    ))
    .unwrap();

    let run = orch
        .run("lenient", TriggerContext::manual(), RunOptions::default())
        .unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.result("lint").unwrap().status, StageStatus::Failed);
    assert!(run.result("docs").is_none());
    assert!(run.result("test").unwrap().succeeded());
    assert_eq!(PipelineReport::from_run(&run).skipped, vec!["docs".to_string()]);
    let definition = orch.definition("lenient").unwrap();
    assert_eq!(blocked_stages(&definition, &run), vec!["docs".to_string()]);
}

#[test]
fn always_run_stage_runs_after_failure() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path());
    orch.define_pipeline(PipelineDefinition::new(
        "cleanup",
        vec![
            build(),
            test_stage("exit 1"),
            StageTemplate::new("teardown", StageKind::Build)
                .needs(&["test"])
                .param("run", "true")
                .always_run(),
        ],
    ))
    .unwrap();

    let run = orch
        .run("cleanup", TriggerContext::manual(), RunOptions::default())
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.result("teardown").unwrap().succeeded());
    assert_eq!(run.failure.unwrap().stage.as_deref(), Some("test"));
}

#[test]
fn transient_failures_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path());
    let mut definition = quick_retries(PipelineDefinition::new(
        "flaky",
        vec![
            build(),
            test_stage("if [ -f tried ]; then exit 0; else touch tried; exit 75; fi"),
        ],
    ));
    definition.retry.max_retries = 2;
    orch.define_pipeline(definition).unwrap();

    let run = orch
        .run("flaky", TriggerContext::manual(), RunOptions::default())
        .unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.result("test").unwrap().attempts, 2);
    assert_eq!(orch.metrics().snapshot().stages["test"].retries, 1);
}

#[test]
fn deterministic_failures_are_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path());
    let mut definition = quick_retries(PipelineDefinition::new(
        "broken",
        vec![build(), test_stage("exit 1")],
    ));
    definition.retry.max_retries = 3;
    orch.define_pipeline(definition).unwrap();

    let run = orch
        .run("broken", TriggerContext::manual(), RunOptions::default())
        .unwrap();
    assert_eq!(run.result("test").unwrap().attempts, 1);
}

#[test]
fn cycles_are_rejected_at_definition() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path());
    let err = orch
        .define_pipeline(PipelineDefinition::new(
            "loop",
            vec![
                StageTemplate::new("a", StageKind::Build).needs(&["c"]),
                StageTemplate::new("b", StageKind::Build).needs(&["a"]),
                StageTemplate::new("c", StageKind::Build).needs(&["b"]),
            ],
        ))
        .unwrap_err();
    assert!(err.is_configuration());
    assert!(orch.definition("loop").is_none());
}

#[test]
fn triggers_outside_the_rules_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path());
    let mut definition = PipelineDefinition::new("main-only", vec![build()]);
    let mut rule = TriggerRule::on(TriggerKind::Push);
    rule.branches = vec!["main".into(), "release/*".into()];
    definition.triggers = vec![rule];
    orch.define_pipeline(definition).unwrap();

    let err = orch
        .start(
            "main-only",
            TriggerContext::new(TriggerKind::Push).with_branch("feature/x"),
            RunOptions::default(),
        )
        .unwrap_err();
    assert!(err.is_configuration());

    let run = orch
        .run(
            "main-only",
            TriggerContext::new(TriggerKind::Push).with_branch("release/1.2"),
            RunOptions::default(),
        )
        .unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
}

#[test]
fn unknown_definition_and_run_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path());
    let err = orch
        .start("nope", TriggerContext::manual(), RunOptions::default())
        .unwrap_err();
    assert!(err.is_configuration());
    assert!(matches!(
        orch.get_run("missing").unwrap_err(),
        PipelineError::UnknownRun(_)
    ));
    assert!(matches!(
        orch.advance("missing").unwrap_err(),
        PipelineError::UnknownRun(_)
    ));
}

#[test]
fn cancel_before_advance_ends_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path());
    orch.define_pipeline(PipelineDefinition::new("app", vec![build()]))
        .unwrap();

    let run = orch
        .start("app", TriggerContext::manual(), RunOptions::default())
        .unwrap();
    assert_eq!(run.status, RunStatus::Running);

    let cancelled = orch.cancel(&run.id).unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    assert!(cancelled.results.is_empty());

    // terminal runs stay terminal
    let advanced = orch.advance(&run.id).unwrap();
    assert_eq!(advanced.status, RunStatus::Cancelled);
    assert!(matches!(
        orch.cancel(&run.id).unwrap_err(),
        PipelineError::InvalidTransition { .. }
    ));
}

#[test]
fn cancel_drains_in_flight_stages() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path());
    orch.define_pipeline(PipelineDefinition::new(
        "slow",
        vec![
            StageTemplate::new("build", StageKind::Build).param("run", "sleep 0.3"),
            test_stage("true"),
        ],
    ))
    .unwrap();

    let run = orch
        .start("slow", TriggerContext::manual(), RunOptions::default())
        .unwrap();
    let finished = thread::scope(|scope| {
        let driver = scope.spawn(|| orch.advance(&run.id));
        let deadline = Instant::now() + Duration::from_secs(5);
        while !orch.get_run(&run.id).unwrap().in_flight.contains("build") {
            assert!(Instant::now() < deadline, "build never dispatched");
            thread::sleep(Duration::from_millis(5));
        }
        orch.cancel(&run.id).unwrap();
        driver.join().unwrap()
    })
    .unwrap();

    assert_eq!(finished.status, RunStatus::Cancelled);
    assert_eq!(finished.results.len(), 1);
    assert!(finished.result("test").is_none());
    assert_eq!(orch.metrics().snapshot().runs.cancelled, 1);
}

#[test]
fn pipeline_timeout_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path());
    let mut definition = PipelineDefinition::new(
        "sluggish",
        vec![
            StageTemplate::new("build", StageKind::Build).param("run", "sleep 5"),
            test_stage("true"),
        ],
    );
    definition.timeout_secs = 1;
    orch.define_pipeline(definition).unwrap();

    let run = orch
        .run("sluggish", TriggerContext::manual(), RunOptions::default())
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.failure.as_ref().unwrap().detail.contains("timed out"));
    assert!(run.result("test").is_none());
}

#[test]
fn production_requires_approval() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path());
    orch.define_pipeline(PipelineDefinition::new(
        "release",
        vec![build(), test_stage("true"), deploy("production")],
    ))
    .unwrap();

    let denied = orch
        .run("release", TriggerContext::manual(), RunOptions::default())
        .unwrap();
    assert_eq!(denied.status, RunStatus::Failed);
    assert!(denied.failure.unwrap().detail.contains("requires approval"));

    let approved = orch
        .run(
            "release",
            TriggerContext::manual().approved(true),
            RunOptions::default(),
        )
        .unwrap();
    assert_eq!(approved.status, RunStatus::Succeeded);
}

#[test]
fn quality_gate_rejection_attaches_verdict() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path());
    orch.define_pipeline(PipelineDefinition::new(
        "gated",
        vec![
            build(),
            test_stage("echo '::metric test_coverage=61'"),
            StageTemplate::new("quality", StageKind::QualityGate)
                .needs(&["test"])
                .param(
                    "rules",
                    serde_json::json!([{ "metric": "test_coverage", "min": 80.0 }]),
                ),
        ],
    ))
    .unwrap();

    let run = orch
        .run("gated", TriggerContext::manual(), RunOptions::default())
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let verdict = run.result("quality").unwrap().verdict.as_ref().unwrap();
    assert!(!verdict.passed);
    assert_eq!(verdict.metrics["test_coverage"].value, Some(61.0));
    assert_eq!(orch.metrics().snapshot().gate_failures, 1);
}

struct UnavailableArtifacts;

impl ArtifactStore for UnavailableArtifacts {
    fn put(&self, _name: &str, _data: &[u8]) -> PipelineResult<ArtifactRef> {
        Err(PipelineError::system("artifact store unreachable"))
    }

    fn get(&self, digest: &str) -> PipelineResult<Vec<u8>> {
        Err(PipelineError::system(format!("artifact {digest} unreachable")))
    }

    fn contains(&self, _digest: &str) -> bool {
        false
    }
}

#[test]
fn storage_outage_propagates_as_system_error() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path()).with_artifacts(Arc::new(UnavailableArtifacts));
    orch.define_pipeline(PipelineDefinition::new("app", vec![build(), test_stage("true")]))
        .unwrap();

    let run = orch
        .start("app", TriggerContext::manual(), RunOptions::default())
        .unwrap();
    let err = orch.advance(&run.id).unwrap_err();
    assert!(matches!(err, PipelineError::System(_)));
    assert!(err.to_string().contains("unreachable"));

    let recorded = orch.get_run(&run.id).unwrap();
    assert_eq!(recorded.status, RunStatus::Failed);
    assert_eq!(recorded.results.len(), 1);
}

#[test]
fn runs_persist_and_prune() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state");
    let store = Arc::new(FsRunStore::open(&state).unwrap());
    let orch = orchestrator(dir.path()).with_store(store.clone());
    orch.define_pipeline(PipelineDefinition::new("app", vec![build()]))
        .unwrap();
    let run = orch
        .run("app", TriggerContext::manual(), RunOptions::default())
        .unwrap();

    let reopened = Orchestrator::new(dir.path()).with_store(Arc::new(FsRunStore::open(&state).unwrap()));
    let loaded = reopened.get_run(&run.id).unwrap();
    assert_eq!(loaded, run);
    assert_eq!(reopened.list_runs().unwrap().len(), 1);

    assert!(reopened.prune(chrono::Duration::days(1)).unwrap().is_empty());
    thread::sleep(Duration::from_millis(5));
    let removed = reopened.prune(chrono::Duration::zero()).unwrap();
    assert_eq!(removed, vec![run.id.clone()]);
    assert!(reopened.list_runs().unwrap().is_empty());
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<RunEvent>>>);

impl Notifier for Recorder {
    fn notify(&self, event: &RunEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

#[test]
fn lifecycle_events_reach_every_channel() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let orch = orchestrator(dir.path()).with_notifier(Arc::new(
        NotifierSet::new().with(TracingNotifier).with(recorder.clone()),
    ));
    orch.define_pipeline(PipelineDefinition::new(
        "app",
        vec![build(), test_stage("exit 1")],
    ))
    .unwrap();

    let run = orch
        .run("app", TriggerContext::manual(), RunOptions::default())
        .unwrap();

    let events = recorder.0.lock().unwrap().clone();
    assert_eq!(events.len(), 4);
    assert_eq!(
        events[0],
        RunEvent::RunStarted {
            run_id: run.id.clone(),
            definition_id: "app".to_string(),
        }
    );
    assert!(matches!(
        &events[2],
        RunEvent::StageFinished { stage, status: StageStatus::Failed, detail: Some(_), .. } if stage == "test"
    ));
    assert_eq!(
        events[3],
        RunEvent::RunFinished {
            run_id: run.id,
            definition_id: "app".to_string(),
            status: RunStatus::Failed,
        }
    );
}

/// Counts concurrent executions and remembers the peak.
#[derive(Default)]
struct Occupancy {
    current: AtomicUsize,
    peak: AtomicUsize,
}

struct CountingStage {
    occupancy: Arc<Occupancy>,
    hold: Duration,
}

impl StageExecutor for CountingStage {
    fn kind(&self) -> StageKind {
        StageKind::Build
    }

    fn execute(&self, _inputs: &StageInputs, _ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
        let now = self.occupancy.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.occupancy.peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(self.hold);
        self.occupancy.current.fetch_sub(1, Ordering::SeqCst);
        Ok(StageOutput::default())
    }
}

fn counting_registry(occupancy: &Arc<Occupancy>, hold: Duration) -> StageRegistry {
    let mut registry = StageRegistry::with_defaults();
    let occupancy = occupancy.clone();
    registry.register(StageKind::Build, move |_| {
        Ok(Box::new(CountingStage {
            occupancy: occupancy.clone(),
            hold,
        }))
    });
    registry
}

#[test]
fn independent_stages_run_up_to_the_parallelism_cap() {
    let dir = tempfile::tempdir().unwrap();
    let occupancy = Arc::new(Occupancy::default());
    let orch = orchestrator(dir.path()).with_registry(counting_registry(&occupancy, Duration::from_millis(150)));
    let stages = (0..6)
        .map(|i| StageTemplate::new(format!("compile-{i}"), StageKind::Build))
        .collect();
    let mut definition = PipelineDefinition::new("fanout", stages);
    definition.max_parallelism = 3;
    orch.define_pipeline(definition).unwrap();

    let run = orch
        .run("fanout", TriggerContext::manual(), RunOptions::default())
        .unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.results.len(), 6);
    assert_eq!(occupancy.peak.load(Ordering::SeqCst), 3);
    assert_eq!(occupancy.current.load(Ordering::SeqCst), 0);
}

#[test]
fn layered_graph_of_forty_stages_finishes_quickly() {
    let dir = tempfile::tempdir().unwrap();
    let occupancy = Arc::new(Occupancy::default());
    let orch = orchestrator(dir.path()).with_registry(counting_registry(&occupancy, Duration::ZERO));
    let stages = (0..40)
        .map(|i: usize| {
            let needs: Vec<String> = (i.saturating_sub(2)..i).map(|n| format!("step-{n}")).collect();
            let needs: Vec<&str> = needs.iter().map(String::as_str).collect();
            StageTemplate::new(format!("step-{i}"), StageKind::Build).needs(&needs)
        })
        .collect();
    orch.define_pipeline(PipelineDefinition::new("ladder", stages))
        .unwrap();

    let started = Instant::now();
    let run = orch
        .run("ladder", TriggerContext::manual(), RunOptions::default())
        .unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.results.len(), 40);
    assert_eq!(occupancy.peak.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_secs(10), "took {:?}", started.elapsed());
}
