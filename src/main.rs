use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use ps_ingestion::config::IngestionConfig;
use ps_ingestion::format::Format;
use ps_ingestion::observability::{MetricsSnapshot, log_snapshot};
#[cfg(feature = "metrics-server")]
use ps_ingestion::observability::server::MetricsServer;
use ps_ingestion::pipeline::{StageRegistry, build_orchestrator};
use ps_ingestion::presets::generate_preset;
use ps_ingestion::run::RunStatus;
use ps_ingestion::scheduler::Scheduler;
use ps_ingestion::stages;
use ps_ingestion::store::{FileRunStore, RunStore};
use ps_ingestion::validation::validate_config;
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};
use uuid::Uuid;

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
#[cfg(feature = "metrics-server")]
use std::net::SocketAddr;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let otlp_endpoint_for_tracing = match &cli.command {
        Commands::Run { otlp_endpoint, .. } | Commands::Schedule { otlp_endpoint, .. } => {
            otlp_endpoint.clone()
        }
        _ => None,
    };

    configure_tracing(otlp_endpoint_for_tracing.as_deref())?;

    let command_result: Result<()> = match cli.command {
        Commands::Run {
            config,
            format,
            trigger,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            otlp_endpoint: _,
        } => {
            run_once(
                config,
                format,
                trigger,
                MetricsOutputs {
                    print: print_metrics,
                    json: metrics_json,
                    prometheus: metrics_prometheus,
                },
            )
            .await
        }
        Commands::Schedule {
            config,
            metrics_listen,
            otlp_endpoint: _,
        } => schedule(config, metrics_listen).await,
        Commands::Validate { config } => validate_config_cmd(config),
        Commands::Triggers { config } => list_triggers(config),
        Commands::Status { config, run_id } => show_status(config, run_id),
        Commands::Runs { config, prune } => list_runs(config, prune),
        Commands::ListInvokers => {
            list_invokers();
            Ok(())
        }
        Commands::Config { action } => config_command(action),
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
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
                        vec![KeyValue::new("service.name", "ps-ingestion")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
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
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

struct MetricsOutputs {
    print: bool,
    json: Option<PathBuf>,
    prometheus: Option<PathBuf>,
}

async fn run_once(
    config_path: PathBuf,
    format: Format,
    trigger: String,
    outputs: MetricsOutputs,
) -> Result<()> {
    let config = load_validated(&config_path)?;
    let registry = build_registry();
    let store = FileRunStore::open(&config.runs.directory)?;
    let orchestrator = build_orchestrator(&config, &registry, Arc::new(store))?;

    let run = orchestrator.execute(format, &trigger).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&run).context("Failed to render run record")?
    );

    write_metrics(&orchestrator.metrics().snapshot(), &outputs)?;

    match run.status() {
        RunStatus::Succeeded => Ok(()),
        RunStatus::Failed => {
            let reason = run
                .failure()
                .map(|failure| format!("{} ({})", failure.error.message, failure.stage))
                .unwrap_or_else(|| "unknown failure".to_string());
            bail!("Run {} failed: {}", run.run_id(), reason)
        }
        other => bail!("Run {} ended {}", run.run_id(), other.as_str()),
    }
}

fn write_metrics(snapshot: &MetricsSnapshot, outputs: &MetricsOutputs) -> Result<()> {
    if outputs.print {
        log_snapshot(snapshot);
    }
    if let Some(path) = &outputs.json {
        ensure_parent(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = &outputs.prometheus {
        ensure_parent(path)?;
        std::fs::write(path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

async fn schedule(config_path: PathBuf, metrics_listen: Option<String>) -> Result<()> {
    let config = load_validated(&config_path)?;
    let registry = build_registry();
    let store = FileRunStore::open(&config.runs.directory)?;
    let pruned = store.prune(config.runs.retention(), Utc::now())?;
    if pruned > 0 {
        info!(pruned, "Expired run records removed");
    }
    let store: Arc<dyn RunStore> = Arc::new(store);
    let orchestrator = Arc::new(build_orchestrator(&config, &registry, store.clone())?);

    #[cfg(feature = "metrics-server")]
    let metrics_server = if let Some(addr_str) = metrics_listen {
        let addr: SocketAddr = addr_str
            .parse()
            .with_context(|| format!("Invalid metrics listen address: {addr_str}"))?;
        let server = MetricsServer::start(addr, orchestrator.metrics(), store.clone())?;
        info!(address = %server.address(), "Metrics server listening");
        Some(server)
    } else {
        None
    };

    #[cfg(not(feature = "metrics-server"))]
    if let Some(addr_str) = metrics_listen {
        warn!(
            "Metrics server feature not enabled; ignoring --metrics-listen={}.",
            addr_str
        );
    }

    let scheduler = Scheduler::new(config.triggers.clone());
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl-C; stop the process to exit");
            std::future::pending::<()>().await;
        }
    };
    let fired = scheduler.run(orchestrator.clone(), shutdown).await?;
    info!(fired, "Scheduler exited");
    log_snapshot(&orchestrator.metrics().snapshot());

    #[cfg(feature = "metrics-server")]
    if let Some(mut server) = metrics_server {
        server.stop();
    }

    Ok(())
}

fn load_validated(config_path: &Path) -> Result<IngestionConfig> {
    let config = IngestionConfig::load(config_path)?;
    let registry = build_registry();
    let report = validate_config(&config, &registry);

    for warning in &report.warnings {
        warn!(file = %config_path.display(), "{warning}");
    }
    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %config_path.display(), "{error_msg}");
        }
        bail!(
            "Config validation failed with {} error(s)",
            report.errors.len()
        );
    }
    Ok(config)
}

fn validate_config_cmd(config_path: PathBuf) -> Result<()> {
    load_validated(&config_path)?;
    info!(file = %config_path.display(), "Config validation passed");
    Ok(())
}

fn list_triggers(config_path: PathBuf) -> Result<()> {
    let config = IngestionConfig::load(&config_path)?;
    let scheduler = Scheduler::new(config.triggers.clone());
    let now = Utc::now();
    if scheduler.triggers().is_empty() {
        println!("No enabled triggers.");
        return Ok(());
    }
    println!("Triggers (UTC):");
    for trigger in scheduler.triggers() {
        let next = trigger.next_fire_after(now)?;
        println!(
            "- {:<12} {:<4} {:02}:{:02}  {}  next {}",
            trigger.name,
            trigger.format,
            trigger.hour,
            trigger.minute,
            trigger.cron_expression(),
            next.to_rfc3339()
        );
    }
    Ok(())
}

fn show_status(config_path: PathBuf, run_id: Uuid) -> Result<()> {
    let config = IngestionConfig::load(&config_path)?;
    let store = FileRunStore::open(&config.runs.directory)?;
    let run = store
        .load(run_id)?
        .ok_or_else(|| anyhow!("No record for run {run_id} in {}", store.directory().display()))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&run).context("Failed to render run record")?
    );
    Ok(())
}

fn list_runs(config_path: PathBuf, prune: bool) -> Result<()> {
    let config = IngestionConfig::load(&config_path)?;
    let store = FileRunStore::open(&config.runs.directory)?;
    if prune {
        let removed = store.prune(config.runs.retention(), Utc::now())?;
        info!(removed, "Run records pruned");
    }
    let runs = store.list()?;
    if runs.is_empty() {
        println!("No run records in {}", store.directory().display());
        return Ok(());
    }
    for run in runs {
        let reason = run
            .failure()
            .map(|failure| failure.error.message.as_str())
            .unwrap_or("");
        println!(
            "{}  {:<4} {:<10} {:<10} {}  {}",
            run.run_id(),
            run.format(),
            run.status().as_str(),
            run.current_stage(),
            run.started_at().to_rfc3339(),
            reason
        );
    }
    Ok(())
}

fn config_command(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::New { preset, output } => {
            let destination =
                output.unwrap_or_else(|| PathBuf::from(format!("config/{preset}.yaml")));
            let generated = generate_preset(&preset, &destination)?;
            info!(
                preset = %preset,
                path = %generated.display(),
                "Preset config generated"
            );
            Ok(())
        }
    }
}

fn list_invokers() {
    let registry = build_registry();
    println!("Available invokers:");
    for name in registry.known_invokers() {
        println!("- {name}");
    }
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

fn build_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

#[derive(Parser)]
#[command(
    name = "ps-ingestion",
    version,
    about = "Scheduled replay ingestion pipeline: extract, transform, load"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start one run immediately and wait for it to finish.
    Run {
        config: PathBuf,
        #[arg(long, value_enum, ignore_case = true)]
        format: Format,
        #[arg(long, default_value = "manual")]
        trigger: String,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
    },
    /// Fire runs on the configured daily triggers until interrupted.
    Schedule {
        config: PathBuf,
        #[arg(long = "metrics-listen")]
        metrics_listen: Option<String>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
    },
    Validate {
        config: PathBuf,
    },
    Triggers {
        config: PathBuf,
    },
    /// Print the persisted record of a run.
    Status {
        config: PathBuf,
        run_id: Uuid,
    },
    Runs {
        config: PathBuf,
        /// Delete records older than the configured retention first.
        #[arg(long)]
        prune: bool,
    },
    ListInvokers,
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    New {
        #[arg(long, default_value = "local")]
        preset: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}
