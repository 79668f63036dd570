use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::builder::PossibleValuesParser;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::Shell;
use serde_json::to_writer_pretty;
use shipyard::artifact::FsArtifactStore;
use shipyard::config::Settings;
use shipyard::definition::{DefinitionCatalog, PipelineDefinition};
use shipyard::cancel::CancellationToken;
use shipyard::deploy::{DeploymentStatus, HealthCheckSpec, StrategyKind};
use shipyard::error::PipelineError;
use shipyard::gate::{GateDefinition, MetricSet, evaluate};
use shipyard::observability::{MetricsCollector, log_snapshot};
#[cfg(feature = "metrics-server")]
use shipyard::observability::server::MetricsServer;
use shipyard::orchestrator::Orchestrator;
use shipyard::presets::{generate_template, template_names};
use shipyard::report::PipelineReport;
use shipyard::run::RunOptions;
use shipyard::stages::StageRegistry;
use shipyard::store::{FsRunStore, RunStore};
use shipyard::trigger::{TriggerContext, TriggerKind};
use shipyard::validation::validate_definition;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
#[cfg(feature = "metrics-server")]
use std::net::SocketAddr;

/// Any stage failure or cancellation.
const EXIT_FAILED: u8 = 1;
/// Bad definitions, gates, config or arguments.
const EXIT_CONFIGURATION: u8 = 2;

fn main() -> ExitCode {
    let Cli { config, command } = Cli::parse();

    let otlp_endpoint_for_tracing = match &command {
        Commands::Run(args) => args.otlp_endpoint.clone(),
        _ => None,
    };

    if let Err(err) = configure_tracing(otlp_endpoint_for_tracing.as_deref()) {
        eprintln!("Error: {err:#}");
        return ExitCode::from(EXIT_CONFIGURATION);
    }

    let command_result = match command {
        Commands::Run(args) => run_pipeline(config.as_deref(), args),
        Commands::Validate { files } => validate_files(&files).map(|_| ExitCode::SUCCESS),
        Commands::List { definitions } => {
            list_definitions(config.as_deref(), definitions).map(|_| ExitCode::SUCCESS)
        }
        Commands::Stages => {
            list_stages();
            Ok(ExitCode::SUCCESS)
        }
        Commands::New { template, output } => new_pipeline(&template, output),
        Commands::Status { run_id, json } => show_status(config.as_deref(), &run_id, json),
        Commands::Runs => list_runs(config.as_deref()).map(|_| ExitCode::SUCCESS),
        Commands::Prune { retention_days } => {
            prune_runs(config.as_deref(), retention_days).map(|_| ExitCode::SUCCESS)
        }
        Commands::Rollback {
            environment,
            version,
            json,
        } => rollback_environment(config.as_deref(), &environment, version.as_deref(), json),
        Commands::Gate {
            metrics,
            gate,
            preset,
            json,
        } => check_gate(&metrics, gate.as_deref(), preset.as_deref(), json),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "pipeline", &mut io::stdout());
            Ok(ExitCode::SUCCESS)
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    match command_result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

/// Pipeline-level faults (unknown run, persistence) exit 1; everything that
/// stops a command before any run starts is a configuration problem.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<PipelineError>() {
        Some(pipeline_err) if !pipeline_err.is_configuration() => EXIT_FAILED,
        _ => EXIT_CONFIGURATION,
    }
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "shipyard")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        }
    }

    #[cfg(not(feature = "otel"))]
    {
        if let Some(endpoint) = otlp_endpoint {
            eprintln!(
                "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
                endpoint
            );
        }

        tracing_subscriber::registry()
            .with(filter.clone())
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

fn build_orchestrator(settings: &Settings, metrics: MetricsCollector) -> Result<Orchestrator> {
    let store = FsRunStore::open(&settings.state_dir)?;
    let artifacts = FsArtifactStore::open(settings.state_dir.join("artifacts"))?;
    let deployer = settings.deployment_engine(metrics.clone())?;
    Ok(Orchestrator::new(settings.workdir.clone())
        .with_store(Arc::new(store))
        .with_artifacts(Arc::new(artifacts))
        .with_deployer(deployer)
        .with_metrics(metrics))
}

fn load_catalog(settings: &Settings, definitions: Option<String>) -> Result<DefinitionCatalog> {
    let pattern = definitions.unwrap_or_else(|| settings.definitions.clone());
    DefinitionCatalog::load_glob(&pattern)
}

fn run_pipeline(config: Option<&Path>, args: RunArgs) -> Result<ExitCode> {
    let settings = Settings::discover(config)?;
    let catalog = load_catalog(&settings, args.definitions)?;
    let Some(definition) = catalog.get(&args.definition_id) else {
        return Err(PipelineError::configuration(format!(
            "unknown pipeline '{}'. Available pipelines: {}",
            args.definition_id,
            if catalog.is_empty() {
                "none".to_string()
            } else {
                catalog.ids().join(", ")
            }
        ))
        .into());
    };

    let metrics = MetricsCollector::new();

    #[cfg(feature = "metrics-server")]
    let metrics_server = if let Some(addr_str) = &args.metrics_listen {
        let addr: SocketAddr = addr_str
            .parse()
            .with_context(|| format!("Invalid metrics listen address: {addr_str}"))?;
        Some(MetricsServer::start(addr, metrics.clone())?)
    } else {
        None
    };

    #[cfg(not(feature = "metrics-server"))]
    if let Some(addr_str) = &args.metrics_listen {
        warn!(
            "Metrics server feature not enabled; ignoring --metrics-listen={}.",
            addr_str
        );
    }

    let orchestrator = build_orchestrator(&settings, metrics.clone())?;
    orchestrator.define_pipeline(PipelineDefinition::clone(&definition))?;

    let mut trigger = TriggerContext::new(args.event).approved(args.approve);
    trigger.branch = args.branch;
    trigger.commit = args.commit;
    trigger.actor = args.actor;
    let options = RunOptions {
        environment: args.env,
        strategy: args.strategy,
    };

    let run = orchestrator.run(&args.definition_id, trigger, options)?;
    let report = PipelineReport::from_run(&run);
    print!("{}", report.render_text());
    if let Some(path) = &args.report {
        report.write_json(path)?;
        info!(report = %path.display(), "Run report written");
    }

    write_metrics(
        &metrics,
        args.print_metrics,
        args.metrics_json.as_deref(),
        args.metrics_prometheus.as_deref(),
    )?;

    #[cfg(feature = "metrics-server")]
    if let Some(mut server) = metrics_server {
        server.stop();
    }

    Ok(if report.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_FAILED)
    })
}

fn write_metrics(
    metrics: &MetricsCollector,
    print_metrics: bool,
    metrics_json: Option<&Path>,
    metrics_prometheus: Option<&Path>,
) -> Result<()> {
    if !print_metrics && metrics_json.is_none() && metrics_prometheus.is_none() {
        return Ok(());
    }
    let snapshot = metrics.snapshot();
    if print_metrics {
        log_snapshot(&snapshot);
    }
    if let Some(path) = metrics_json {
        ensure_parent(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, &snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = metrics_prometheus {
        ensure_parent(path)?;
        std::fs::write(path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn validate_files(files: &[PathBuf]) -> Result<()> {
    let registry = StageRegistry::with_defaults();
    let mut failures = 0usize;

    for path in files {
        match PipelineDefinition::load(path) {
            Ok(definition) => {
                let report = validate_definition(&definition, &registry);
                for warning in &report.warnings {
                    warn!(file = %path.display(), "{warning}");
                }
                if report.is_ok() {
                    info!(file = %path.display(), pipeline = %definition.id, "Validation passed");
                } else {
                    failures += 1;
                    for error_msg in &report.errors {
                        error!(file = %path.display(), "{error_msg}");
                    }
                }
            }
            Err(err) => {
                failures += 1;
                error!(file = %path.display(), "Failed to load pipeline: {err:#}");
            }
        }
    }

    if failures > 0 {
        bail!("Validation failed for {failures} pipeline file(s)");
    }
    println!("{} pipeline file(s) valid", files.len());
    Ok(())
}

fn list_definitions(config: Option<&Path>, definitions: Option<String>) -> Result<()> {
    let settings = Settings::discover(config)?;
    let catalog = load_catalog(&settings, definitions)?;
    if catalog.is_empty() {
        println!("No pipelines found");
        return Ok(());
    }
    for id in catalog.ids() {
        let Some(definition) = catalog.get(&id) else {
            continue;
        };
        println!(
            "{id}\t{} stage(s)\t{}",
            definition.stages.len(),
            definition.description.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn list_stages() {
    let registry = StageRegistry::with_defaults();
    println!("Available stages:");
    for kind in registry.known_kinds() {
        println!("- {kind}");
    }
}

fn new_pipeline(template: &str, output: Option<PathBuf>) -> Result<ExitCode> {
    let destination = output.unwrap_or_else(|| PathBuf::from(format!("pipelines/{template}.yaml")));
    let generated = generate_template(template, &destination)?;
    info!(
        template = %template,
        path = %generated.display(),
        "Pipeline template generated"
    );
    println!("{}", generated.display());
    Ok(ExitCode::SUCCESS)
}

fn open_store(config: Option<&Path>) -> Result<(Settings, FsRunStore)> {
    let settings = Settings::discover(config)?;
    let store = FsRunStore::open(&settings.state_dir)?;
    Ok((settings, store))
}

fn show_status(config: Option<&Path>, run_id: &str, json: bool) -> Result<ExitCode> {
    let (_, store) = open_store(config)?;
    let run = store
        .load(run_id)?
        .ok_or_else(|| PipelineError::UnknownRun(run_id.to_string()))?;
    if json {
        to_writer_pretty(io::stdout(), &run)?;
        println!();
    } else {
        print!("{}", PipelineReport::from_run(&run).render_text());
    }
    Ok(ExitCode::SUCCESS)
}

fn list_runs(config: Option<&Path>) -> Result<()> {
    let (_, store) = open_store(config)?;
    let runs = store.list()?;
    if runs.is_empty() {
        println!("No runs recorded");
    }
    for summary in runs {
        println!(
            "{}\t{}\t{}\t{} stage(s)\t{}",
            summary.id,
            summary.definition_id,
            summary.status,
            summary.stages_completed,
            summary.created_at.to_rfc3339()
        );
    }
    Ok(())
}

fn prune_runs(config: Option<&Path>, retention_days: Option<u32>) -> Result<()> {
    let settings = Settings::discover(config)?;
    let days = retention_days.unwrap_or(settings.retention_days);
    let store = FsRunStore::open(&settings.state_dir)?;
    let orchestrator = Orchestrator::new(settings.workdir.clone()).with_store(Arc::new(store));
    let removed = orchestrator.prune(chrono::Duration::days(i64::from(days)))?;
    println!("Pruned {} run(s) older than {days} day(s)", removed.len());
    Ok(())
}

fn rollback_environment(
    config: Option<&Path>,
    environment: &str,
    version: Option<&str>,
    json: bool,
) -> Result<ExitCode> {
    let settings = Settings::discover(config)?;
    let engine = settings.deployment_engine(MetricsCollector::new())?;
    let result = engine.rollback(
        environment,
        version,
        HealthCheckSpec::default(),
        &CancellationToken::new(),
    )?;
    if json {
        to_writer_pretty(io::stdout(), &result)?;
        println!();
    } else {
        println!(
            "Rollback of '{}' to {} {} in {}ms",
            result.environment, result.artifact, result.status, result.elapsed_ms
        );
        if let Some(detail) = &result.detail {
            println!("- {detail}");
        }
    }
    Ok(if result.status == DeploymentStatus::Succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_FAILED)
    })
}

fn check_gate(
    metrics_path: &Path,
    gate_path: Option<&Path>,
    preset: Option<&str>,
    json: bool,
) -> Result<ExitCode> {
    let content = std::fs::read_to_string(metrics_path)
        .with_context(|| format!("Failed to read metrics file: {}", metrics_path.display()))?;
    let metrics: MetricSet = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse metrics JSON: {}", metrics_path.display()))?;

    let gate = match (gate_path, preset) {
        (Some(path), _) => GateDefinition::load(path)?,
        (None, Some(name)) => GateDefinition::preset(name).ok_or_else(|| {
            anyhow!("Unknown gate preset '{name}'. Available presets: strict, standard, relaxed")
        })?,
        (None, None) => bail!("Either --gate or --preset is required"),
    };

    let verdict = evaluate(&metrics, &gate);
    if json {
        to_writer_pretty(io::stdout(), &verdict)?;
        println!();
    } else {
        println!(
            "Gate '{}' {} (score {:.1})",
            verdict.gate,
            if verdict.passed { "passed" } else { "failed" },
            verdict.score
        );
        for failure in verdict.failures() {
            println!("- {failure}");
        }
    }
    Ok(if verdict.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_FAILED)
    })
}

#[derive(Parser)]
#[command(
    name = "pipeline",
    version,
    about = "CI/CD pipeline orchestrator and deployment engine"
)]
struct Cli {
    /// Settings file (defaults to ./shipyard.yaml when present).
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RunArgs {
    definition_id: String,
    #[arg(long)]
    env: Option<String>,
    #[arg(long, value_enum)]
    strategy: Option<StrategyKind>,
    /// Glob of pipeline definition files.
    #[arg(long)]
    definitions: Option<String>,
    #[arg(long, value_enum, default_value_t = TriggerKind::Manual)]
    event: TriggerKind,
    #[arg(long)]
    branch: Option<String>,
    #[arg(long)]
    commit: Option<String>,
    #[arg(long)]
    actor: Option<String>,
    /// Approve promotion into environments that require it.
    #[arg(long)]
    approve: bool,
    #[arg(long, value_hint = ValueHint::FilePath)]
    report: Option<PathBuf>,
    #[arg(long)]
    print_metrics: bool,
    #[arg(long = "metrics-json")]
    metrics_json: Option<PathBuf>,
    #[arg(long = "metrics-prometheus")]
    metrics_prometheus: Option<PathBuf>,
    #[arg(long = "metrics-listen")]
    metrics_listen: Option<String>,
    #[arg(long = "otlp-endpoint")]
    otlp_endpoint: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline to completion.
    Run(RunArgs),
    /// Validate pipeline definition files.
    Validate {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// List pipeline definitions.
    List {
        #[arg(long)]
        definitions: Option<String>,
    },
    /// List the stage kinds this build can execute.
    Stages,
    /// Write a pipeline from a template.
    New {
        #[arg(long, value_parser = PossibleValuesParser::new(template_names()))]
        template: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Show a recorded run.
    Status {
        run_id: String,
        #[arg(long)]
        json: bool,
    },
    /// List recorded runs, oldest first.
    Runs,
    /// Delete finished runs past the retention window.
    Prune {
        #[arg(long)]
        retention_days: Option<u32>,
    },
    /// Redeploy an earlier release of an environment.
    Rollback {
        environment: String,
        /// Release digest or prefix; defaults to the release before the
        /// current one.
        #[arg(long)]
        version: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Evaluate a metrics file against a quality gate.
    Gate {
        #[arg(long)]
        metrics: PathBuf,
        #[arg(long, conflicts_with = "preset", required_unless_present = "preset")]
        gate: Option<PathBuf>,
        #[arg(long)]
        preset: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}
