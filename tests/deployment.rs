use std::sync::{Arc, Mutex};

use shipyard::artifact::{ArtifactRef, ArtifactStore, MemoryArtifactStore};
use shipyard::cancel::CancellationToken;
use shipyard::deploy::{
    DeploymentEngine, DeploymentPlan, DeploymentStatus, DeploymentStrategy, Environment,
    HealthCheckSpec, HealthProbe, HealthRequest, HealthSample, HealthScope, RollbackScope,
    RollbackSpec, Slot, StrategyKind,
};
use shipyard::deploy::target::FleetTarget;
use shipyard::observability::MetricsCollector;

type Verdict = Box<dyn Fn(&HealthRequest) -> HealthSample + Send + Sync>;

/// Answers from a closure and remembers every scope it was asked about.
struct ScriptedProbe {
    seen: Mutex<Vec<HealthScope>>,
    verdict: Verdict,
}

impl ScriptedProbe {
    fn new(verdict: impl Fn(&HealthRequest) -> HealthSample + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            verdict: Box::new(verdict),
        })
    }

    fn healthy() -> Arc<Self> {
        Self::new(|_| HealthSample::healthy())
    }

    fn scopes(&self) -> Vec<HealthScope> {
        self.seen.lock().unwrap().clone()
    }
}

impl HealthProbe for ScriptedProbe {
    fn check(&self, request: &HealthRequest) -> HealthSample {
        self.seen.lock().unwrap().push(request.scope.clone());
        (self.verdict)(request)
    }
}

struct Fixture {
    engine: DeploymentEngine,
    fleet: Arc<FleetTarget>,
    probe: Arc<ScriptedProbe>,
    metrics: MetricsCollector,
    artifact: ArtifactRef,
}

fn fixture(instances: usize, probe: Arc<ScriptedProbe>) -> Fixture {
    let metrics = MetricsCollector::new();
    let fleet = Arc::new(FleetTarget::in_memory(instances));
    let engine = DeploymentEngine::new(metrics.clone()).with_environment(Environment::new(
        "staging",
        fleet.clone(),
        probe.clone(),
    ));
    let artifact = MemoryArtifactStore::new().put("app.tar", b"release-2").unwrap();
    Fixture {
        engine,
        fleet,
        probe,
        metrics,
        artifact,
    }
}

fn fast_health() -> HealthCheckSpec {
    HealthCheckSpec {
        interval_ms: 1,
        attempts: 1,
        ..HealthCheckSpec::default()
    }
}

fn plan(fx: &Fixture, strategy: DeploymentStrategy) -> DeploymentPlan {
    DeploymentPlan::new("staging", strategy, fx.artifact.clone()).with_health(fast_health())
}

fn rolling(batch_size: usize) -> DeploymentStrategy {
    DeploymentStrategy::Rolling {
        batch_size,
        stabilization_ms: 0,
    }
}

#[test]
fn rolling_runs_one_gate_per_batch() {
    let fx = fixture(4, ScriptedProbe::healthy());
    let result = fx
        .engine
        .deploy(&plan(&fx, rolling(2)), &CancellationToken::new())
        .unwrap();

    assert_eq!(result.status, DeploymentStatus::Succeeded);
    assert_eq!(result.health_gates, 2);
    assert_eq!(result.updated_instances.len(), 4);
    let state = fx.fleet.snapshot();
    assert!(
        state
            .instances
            .values()
            .all(|v| v.as_deref() == Some(fx.artifact.digest.as_str()))
    );
    assert_eq!(fx.metrics.snapshot().deployments.succeeded, 1);
}

#[test]
fn failed_second_batch_reverts_only_that_batch() {
    let probe = ScriptedProbe::new(|request| match &request.scope {
        HealthScope::Instances(ids) if ids.iter().any(|id| id == "instance-3") => {
            HealthSample::unhealthy("5xx spike")
        }
        _ => HealthSample::healthy(),
    });
    let fx = fixture(4, probe);
    let result = fx
        .engine
        .deploy(&plan(&fx, rolling(2)), &CancellationToken::new())
        .unwrap();

    assert_eq!(result.status, DeploymentStatus::RolledBack);
    assert_eq!(result.health_gates, 2);
    assert_eq!(result.rolled_back_instances, vec!["instance-3", "instance-4"]);
    for id in &result.rolled_back_instances {
        assert!(result.updated_instances.contains(id));
    }
    let state = fx.fleet.snapshot();
    assert_eq!(
        state.instances["instance-1"].as_deref(),
        Some(fx.artifact.digest.as_str())
    );
    assert_eq!(state.instances["instance-3"], None);
    assert_eq!(state.instances["instance-4"], None);
    assert!(result.detail.unwrap().contains("batch 2/2"));
}

#[test]
fn all_updated_scope_reverts_every_touched_instance() {
    let probe = ScriptedProbe::new(|request| match &request.scope {
        HealthScope::Instances(ids) if ids.iter().any(|id| id == "instance-3") => {
            HealthSample::unhealthy("down")
        }
        _ => HealthSample::healthy(),
    });
    let fx = fixture(4, probe);
    let plan = plan(&fx, rolling(2)).with_rollback(RollbackSpec {
        scope: RollbackScope::AllUpdated,
        ..RollbackSpec::default()
    });
    let result = fx.engine.deploy(&plan, &CancellationToken::new()).unwrap();

    assert_eq!(result.status, DeploymentStatus::RolledBack);
    assert_eq!(result.rolled_back_instances.len(), 4);
    assert!(fx.fleet.snapshot().instances.values().all(Option::is_none));
}

#[test]
fn manual_rollback_leaves_fleet_as_is() {
    let probe = ScriptedProbe::new(|request| match &request.scope {
        HealthScope::Instances(ids) if ids.iter().any(|id| id == "instance-2") => {
            HealthSample::unhealthy("down")
        }
        _ => HealthSample::healthy(),
    });
    let fx = fixture(2, probe);
    let plan = plan(&fx, rolling(1)).with_rollback(RollbackSpec {
        automatic: false,
        ..RollbackSpec::default()
    });
    let result = fx.engine.deploy(&plan, &CancellationToken::new()).unwrap();

    assert_eq!(result.status, DeploymentStatus::Failed);
    assert!(result.rolled_back_instances.is_empty());
    assert_eq!(
        fx.fleet.snapshot().instances["instance-2"].as_deref(),
        Some(fx.artifact.digest.as_str())
    );
}

#[test]
fn canary_breach_withdraws_the_canary() {
    let probe = ScriptedProbe::new(|request| match request.scope {
        HealthScope::Canary => HealthSample::with_error_rate(0.2),
        _ => HealthSample::healthy(),
    });
    let fx = fixture(3, probe);
    let strategy = DeploymentStrategy::Canary {
        traffic_percentage: 10.0,
        monitoring_duration_ms: 5,
        auto_promote: true,
    };
    let result = fx
        .engine
        .deploy(&plan(&fx, strategy), &CancellationToken::new())
        .unwrap();

    assert_eq!(result.status, DeploymentStatus::RolledBack);
    assert!(result.updated_instances.is_empty());
    let state = fx.fleet.snapshot();
    assert!(state.canary.is_none());
    assert!(state.instances.values().all(Option::is_none));
    assert_eq!(fx.metrics.snapshot().deployments.rolled_back, 1);
}

#[test]
fn healthy_canary_is_promoted() {
    let fx = fixture(3, ScriptedProbe::healthy());
    let strategy = DeploymentStrategy::Canary {
        traffic_percentage: 25.0,
        monitoring_duration_ms: 3,
        auto_promote: true,
    };
    let result = fx
        .engine
        .deploy(&plan(&fx, strategy), &CancellationToken::new())
        .unwrap();

    assert_eq!(result.status, DeploymentStatus::Succeeded);
    let state = fx.fleet.snapshot();
    assert!(state.canary.is_none());
    assert_eq!(state.live_version(), Some(fx.artifact.digest.as_str()));
    assert!(fx.probe.scopes().contains(&HealthScope::Fleet));
}

#[test]
fn blue_green_switches_slots() {
    let fx = fixture(2, ScriptedProbe::healthy());
    let result = fx
        .engine
        .deploy(
            &plan(&fx, DeploymentStrategy::BlueGreen),
            &CancellationToken::new(),
        )
        .unwrap();

    assert_eq!(result.status, DeploymentStatus::Succeeded);
    assert_eq!(fx.fleet.snapshot().active_slot, Slot::Green);
    assert_eq!(
        fx.probe.scopes(),
        vec![HealthScope::Slot("green".to_string()), HealthScope::Fleet]
    );
}

#[test]
fn blue_green_switches_back_when_fleet_is_unhealthy() {
    let probe = ScriptedProbe::new(|request| match request.scope {
        HealthScope::Fleet => HealthSample::unhealthy("latency"),
        _ => HealthSample::healthy(),
    });
    let fx = fixture(2, probe);
    let result = fx
        .engine
        .deploy(
            &plan(&fx, DeploymentStrategy::BlueGreen),
            &CancellationToken::new(),
        )
        .unwrap();

    assert_eq!(result.status, DeploymentStatus::RolledBack);
    assert!(fx.fleet.snapshot().instances.values().all(Option::is_none));
}

#[test]
fn unhealthy_idle_slot_keeps_live_slot_when_cleanup_fails() {
    let probe = ScriptedProbe::new(|request| match request.scope {
        HealthScope::Slot(_) => HealthSample::unhealthy("boot failure"),
        _ => HealthSample::healthy(),
    });
    let fx = fixture(2, probe);
    fx.fleet.inject_fault("decommission_slot");
    let result = fx
        .engine
        .deploy(
            &plan(&fx, DeploymentStrategy::BlueGreen),
            &CancellationToken::new(),
        )
        .unwrap();

    assert_eq!(result.status, DeploymentStatus::Failed);
    let detail = result.detail.unwrap();
    assert!(detail.contains("slot green failed health check"), "{detail}");
    let state = fx.fleet.snapshot();
    assert_eq!(state.active_slot, Slot::Blue);
    assert!(state.slots.contains_key(&Slot::Green));
    assert!(state.instances.values().all(Option::is_none));
}

#[test]
fn recreate_restores_backup_on_failure() {
    let probe = ScriptedProbe::new(|_| HealthSample::unhealthy("crash loop"));
    let fx = fixture(2, probe);
    let result = fx
        .engine
        .deploy(
            &plan(&fx, DeploymentStrategy::Recreate),
            &CancellationToken::new(),
        )
        .unwrap();

    assert_eq!(result.status, DeploymentStatus::RolledBack);
    assert_eq!(result.rolled_back_instances.len(), 2);
    assert!(fx.fleet.snapshot().instances.values().all(Option::is_none));
}

#[test]
fn shadow_is_never_promoted() {
    let fx = fixture(2, ScriptedProbe::healthy());
    let strategy = DeploymentStrategy::Shadow {
        monitoring_duration_ms: 3,
    };
    let result = fx
        .engine
        .deploy(&plan(&fx, strategy), &CancellationToken::new())
        .unwrap();

    assert_eq!(result.status, DeploymentStatus::Succeeded);
    assert_eq!(result.strategy, StrategyKind::Shadow);
    let state = fx.fleet.snapshot();
    assert!(state.mirror.is_none());
    assert!(state.instances.values().all(Option::is_none));
}

#[test]
fn cancelled_rollout_reverts_updated_instances() {
    let fx = fixture(4, ScriptedProbe::healthy());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = fx.engine.deploy(&plan(&fx, rolling(2)), &cancel).unwrap();

    assert_ne!(result.status, DeploymentStatus::Succeeded);
    assert!(fx.fleet.snapshot().instances.values().all(Option::is_none));
}

#[test]
fn newer_plan_supersedes_the_previous_one() {
    let fx = fixture(2, ScriptedProbe::healthy());
    let first = plan(&fx, rolling(1));
    let second = plan(&fx, rolling(2));
    fx.engine.deploy(&first, &CancellationToken::new()).unwrap();
    fx.engine.deploy(&second, &CancellationToken::new()).unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(fx.engine.current_plan("staging").unwrap().id, second.id);
    assert!(fx.engine.current_plan("production").is_none());
}

#[test]
fn unknown_environment_is_a_configuration_error() {
    let fx = fixture(1, ScriptedProbe::healthy());
    let plan = DeploymentPlan::new("prod-eu", rolling(1), fx.artifact.clone());
    let err = fx.engine.deploy(&plan, &CancellationToken::new()).unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("staging"));
}

fn release(fx: &Fixture, payload: &[u8]) -> ArtifactRef {
    let artifact = MemoryArtifactStore::new().put("app.tar", payload).unwrap();
    let plan = DeploymentPlan::new("staging", rolling(2), artifact.clone()).with_health(fast_health());
    let result = fx.engine.deploy(&plan, &CancellationToken::new()).unwrap();
    assert_eq!(result.status, DeploymentStatus::Succeeded);
    artifact
}

#[test]
fn rollback_returns_to_the_previous_release() {
    let fx = fixture(2, ScriptedProbe::healthy());
    let v1 = release(&fx, b"release-1");
    let v2 = release(&fx, b"release-2");
    assert_eq!(fx.engine.releases("staging").unwrap(), vec![v1.digest.clone(), v2.digest.clone()]);

    let result = fx
        .engine
        .rollback("staging", None, fast_health(), &CancellationToken::new())
        .unwrap();

    assert_eq!(result.status, DeploymentStatus::Succeeded);
    assert_eq!(result.strategy, StrategyKind::Recreate);
    assert_eq!(result.artifact, v1.digest);
    assert_eq!(fx.fleet.snapshot().live_version(), Some(v1.digest.as_str()));
    assert_eq!(fx.engine.releases("staging").unwrap(), vec![v1.digest.clone()]);
    assert_eq!(fx.metrics.snapshot().deployments.succeeded, 3);
}

#[test]
fn rollback_to_a_named_release_by_prefix() {
    let fx = fixture(2, ScriptedProbe::healthy());
    let v1 = release(&fx, b"release-1");
    release(&fx, b"release-2");
    release(&fx, b"release-3");

    let result = fx
        .engine
        .rollback("staging", Some(&v1.digest[..10]), fast_health(), &CancellationToken::new())
        .unwrap();
    assert_eq!(result.artifact, v1.digest);
    assert_eq!(fx.fleet.snapshot().live_version(), Some(v1.digest.as_str()));
}

#[test]
fn unhealthy_rollback_restores_the_fleet_it_started_from() {
    let fx = fixture(2, ScriptedProbe::healthy());
    let v1 = release(&fx, b"release-1");
    let v2 = release(&fx, b"release-2");

    let failing = fixture(2, ScriptedProbe::new(move |request| {
        if request.version == v1.digest {
            HealthSample::unhealthy("old schema")
        } else {
            HealthSample::healthy()
        }
    }));
    // same fleet, stricter health checks
    let engine = DeploymentEngine::new(failing.metrics.clone()).with_environment(Environment::new(
        "staging",
        fx.fleet.clone(),
        failing.probe.clone(),
    ));
    let result = engine
        .rollback("staging", None, fast_health(), &CancellationToken::new())
        .unwrap();

    assert_eq!(result.status, DeploymentStatus::RolledBack);
    assert_eq!(fx.fleet.snapshot().live_version(), Some(v2.digest.as_str()));
    assert_eq!(engine.releases("staging").unwrap().last(), Some(&v2.digest));
    assert_eq!(failing.metrics.snapshot().deployments.rolled_back, 1);
}

#[test]
fn rollback_needs_an_earlier_release() {
    let fx = fixture(1, ScriptedProbe::healthy());
    let cancel = CancellationToken::new();
    let err = fx.engine.rollback("staging", None, fast_health(), &cancel).unwrap_err();
    assert!(err.is_configuration());

    let only = release(&fx, b"release-1");
    let err = fx.engine.rollback("staging", None, fast_health(), &cancel).unwrap_err();
    assert!(err.to_string().contains("no release before"), "{err}");
    let err = fx
        .engine
        .rollback("staging", Some(&only.digest), fast_health(), &cancel)
        .unwrap_err();
    assert!(err.to_string().contains("already the current release"), "{err}");
    let err = fx
        .engine
        .rollback("staging", Some("feedface"), fast_health(), &cancel)
        .unwrap_err();
    assert!(err.is_configuration());
    assert!(fx.engine.rollback("qa", None, fast_health(), &cancel).unwrap_err().is_configuration());
}
