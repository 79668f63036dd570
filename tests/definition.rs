use std::fs;

use shipyard::definition::DefinitionCatalog;
use shipyard::scheduler::{RetryPolicy, ancestors, execution_order};
use shipyard::stages::StageRegistry;
use shipyard::trigger::{TriggerContext, TriggerKind, TriggerRule};
use shipyard::validation::validate_definition;
use shipyard::{PipelineDefinition, StageKind, StageTemplate};
use tempfile::tempdir;

const WEB: &str = r#"
id: web
description: Build and ship the web frontend
triggers:
  - kind: push
    branches: ["main", "release/*"]
timeout_secs: 900
max_parallelism: 2
gates:
  release:
    min_score: 75
    rules:
      - metric: test_coverage
        min: 80
        weight: 2
      - metric: vulnerabilities
        max: 0
stages:
  - name: build
    kind: build
    params:
      run: make dist
      artifacts: ["dist/*.tar.gz"]
  - name: test
    kind: test
    needs: [build]
    params:
      run: make test
  - name: gate
    kind: quality_gate
    needs: [test]
    params:
      gate: release
  - name: deploy
    kind: deploy
    needs: [gate]
    params:
      environment: staging
"#;

fn stage(name: &str, needs: &[&str]) -> StageTemplate {
    StageTemplate::new(name, StageKind::Test)
        .needs(needs)
        .param("run", "true")
}

#[test]
fn load_names_gates_from_their_keys() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("web.yaml");
    fs::write(&path, WEB).unwrap();

    let definition = PipelineDefinition::load(&path).unwrap();
    assert_eq!(definition.id, "web");
    assert_eq!(definition.timeout_secs, 900);
    assert_eq!(definition.stages.len(), 4);
    assert_eq!(definition.gates["release"].name, "release");
    assert_eq!(definition.gates["release"].min_score, Some(75.0));
    assert_eq!(definition.gates["release"].rules[0].weight, 2.0);
    assert!(definition.gates["release"].rules[1].critical);

    let report = validate_definition(&definition, &StageRegistry::with_defaults());
    assert!(report.is_ok(), "unexpected errors: {:?}", report.errors);
}

#[test]
fn load_reports_the_offending_file() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("broken.yaml");
    fs::write(&path, "id: broken\nstages: 7\n").unwrap();

    let err = PipelineDefinition::load(&path).unwrap_err();
    assert!(format!("{err:#}").contains("broken.yaml"));
}

#[test]
fn catalog_rejects_duplicate_ids() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("a.yaml"), WEB).unwrap();
    fs::write(temp.path().join("b.yaml"), WEB).unwrap();

    let pattern = format!("{}/*.yaml", temp.path().display());
    let err = DefinitionCatalog::load_glob(&pattern).unwrap_err();
    assert!(err.to_string().contains("defined twice"));
}

#[test]
fn catalog_lists_ids_sorted() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("web.yaml"), WEB).unwrap();
    fs::write(
        temp.path().join("api.yaml"),
        "id: api\nstages:\n  - name: build\n    kind: build\n    params:\n      run: cargo build\n",
    )
    .unwrap();

    let pattern = format!("{}/*.yaml", temp.path().display());
    let catalog = DefinitionCatalog::load_glob(&pattern).unwrap();
    assert_eq!(catalog.ids(), vec!["api", "web"]);
    assert!(catalog.path_of("api").unwrap().ends_with("api.yaml"));
    assert!(catalog.get("mobile").is_none());
}

#[test]
fn execution_order_prefers_declaration_order() {
    let definition = PipelineDefinition::new(
        "fan",
        vec![
            stage("checkout", &[]),
            stage("lint", &["checkout"]),
            stage("unit", &["checkout"]),
            stage("docs", &[]),
            stage("package", &["unit", "lint"]),
        ],
    );
    let order = execution_order(&definition).unwrap();
    assert_eq!(order, vec!["checkout", "lint", "unit", "docs", "package"]);
}

#[test]
fn cycle_names_every_stage_on_it() {
    let definition = PipelineDefinition::new(
        "loop",
        vec![
            stage("a", &["c"]),
            stage("b", &["a"]),
            stage("c", &["b"]),
            stage("d", &[]),
        ],
    );
    let err = execution_order(&definition).unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("cycle involving: a, b, c"));

    let report = validate_definition(&definition, &StageRegistry::with_defaults());
    assert!(report.errors.iter().any(|e| e.contains("cycle")));
}

#[test]
fn unknown_upstream_is_reported_once() {
    let definition = PipelineDefinition::new("dangling", vec![stage("test", &["build"])]);
    let report = validate_definition(&definition, &StageRegistry::with_defaults());
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("unknown stage 'build'"));
}

#[test]
fn ancestors_are_transitive() {
    let definition = PipelineDefinition::new(
        "chain",
        vec![
            stage("a", &[]),
            stage("b", &["a"]),
            stage("c", &["b"]),
            stage("side", &[]),
        ],
    );
    let mut found: Vec<_> = ancestors(&definition, "c").into_iter().collect();
    found.sort();
    assert_eq!(found, vec!["a", "b"]);
    assert!(ancestors(&definition, "side").is_empty());
}

#[test]
fn validation_flags_bad_stage_setup() {
    let mut definition = PipelineDefinition::new(
        "sloppy",
        vec![
            StageTemplate::new("build", StageKind::Build),
            StageTemplate::new("gate", StageKind::QualityGate)
                .needs(&["build"])
                .param("gate", "nightly"),
            StageTemplate::new("ship", StageKind::Deploy)
                .param("environment", "staging")
                .param("colour", "blue"),
        ],
    );
    definition.max_parallelism = 0;

    let report = validate_definition(&definition, &StageRegistry::with_defaults());
    assert!(report.errors.iter().any(|e| e.contains("max_parallelism")));
    assert!(report.errors.iter().any(|e| e.contains("unknown gate 'nightly'")));
    assert!(report.warnings.iter().any(|w| w.contains("no upstream build stage")));
    assert!(report.warnings.iter().any(|w| w.contains("'colour'")));

    let err = report.into_result("sloppy").unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("pipeline 'sloppy' is invalid"));
}

#[test]
fn triggers_match_kind_and_branch() {
    let mut definition = PipelineDefinition::new("web", vec![stage("test", &[])]);
    assert!(definition.accepts(&TriggerContext::manual()));

    definition.triggers = vec![TriggerRule {
        kind: TriggerKind::Push,
        branches: vec!["release/*".to_string()],
    }];
    let push = TriggerContext::new(TriggerKind::Push);
    assert!(definition.accepts(&push.clone().with_branch("release/2.1")));
    assert!(!definition.accepts(&push.clone().with_branch("feature/x")));
    assert!(!definition.accepts(&push));
    assert!(!definition.accepts(&TriggerContext::manual().with_branch("release/2.1")));
}

#[test]
fn backoff_grows_and_caps() {
    let policy = RetryPolicy {
        max_retries: 5,
        initial_backoff_ms: 100,
        multiplier: 3.0,
        max_backoff_ms: 500,
    };
    assert_eq!(policy.backoff(1).as_millis(), 100);
    assert_eq!(policy.backoff(2).as_millis(), 300);
    assert_eq!(policy.backoff(3).as_millis(), 500);
    assert!(RetryPolicy::immediate(3).backoff(2).is_zero());
}
