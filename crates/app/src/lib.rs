use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use tagsight_core::compile::compile;
use tagsight_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use tagsight_core::graph::PipelineGraph;
use tagsight_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use tagsight_core::registry::{ExecutionKind, StageRegistry};

#[derive(Parser)]
#[command(name = "tagsight", about = "AprilTag vision pipeline tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pipeline graph file and report every problem found
    Validate {
        #[arg(help = "Path to pipeline graph JSON file")]
        graph: PathBuf,
    },
    /// Compile a pipeline graph and print the execution plan
    Compile {
        #[arg(help = "Path to pipeline graph JSON file")]
        graph: PathBuf,
    },
    /// List the registered stages, sources, and sinks
    Stages,
    /// Create the data directory and a default config.toml
    Init,
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );

    match cli.command {
        Commands::Validate { graph } => cmd_validate(&graph),
        Commands::Compile { graph } => cmd_compile(&graph),
        Commands::Stages => cmd_stages(&resolved_data_dir),
        Commands::Init => cmd_init(&resolved_data_dir),
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn load_graph(path: &Path) -> Result<PipelineGraph> {
    if !path.exists() {
        bail!("graph file does not exist: {}", path.display());
    }
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read graph file: {}", path.display()))?;
    serde_json::from_str(&json)
        .with_context(|| format!("failed to parse graph JSON: {}", path.display()))
}

fn cmd_validate(graph_path: &Path) -> Result<()> {
    let graph = load_graph(graph_path)?;
    match graph.validate() {
        Ok(()) => {
            println!(
                "{}: valid ({} nodes)",
                graph_path.display(),
                graph.node_count()
            );
            Ok(())
        }
        Err(error) => {
            eprintln!("{}: invalid", graph_path.display());
            for reason in &error.errors {
                eprintln!("  - {reason}");
            }
            bail!("graph validation failed with {} error(s)", error.errors.len());
        }
    }
}

fn cmd_compile(graph_path: &Path) -> Result<()> {
    let graph = load_graph(graph_path)?;
    let plan = compile(&graph).context("compilation failed")?;
    let json = serde_json::to_string_pretty(&plan)?;
    println!("{json}");
    Ok(())
}

fn cmd_stages(data_dir: &Path) -> Result<()> {
    let config = load_config(data_dir);
    let overlay = config.stage_defs_path(data_dir);
    let mut registry = StageRegistry::load(overlay.exists().then_some(overlay.as_path()))?;

    let custom_path = config.custom_stages_path(data_dir);
    let custom_count = registry.load_custom(&custom_path)?;
    if custom_count > 0 {
        info!(count = custom_count, "loaded custom stage definitions");
    }

    println!("Stages:");
    for stage in registry.stages() {
        let execution = match stage.execution {
            ExecutionKind::Cpu => "cpu",
            ExecutionKind::Gpu => "gpu",
        };
        let marker = if stage.custom { " (custom)" } else { "" };
        println!("  {:<24} {:<4} {}{}", stage.id, execution, stage.label, marker);
    }

    println!("Sources:");
    for source in registry.sources() {
        println!("  {:<24} {}", source.id, source.label);
    }

    println!("Sinks:");
    for sink in registry.sinks() {
        println!("  {:<24} {}", sink.id, sink.label);
    }

    Ok(())
}

fn cmd_init(data_dir: &Path) -> Result<()> {
    initialize_data_dir(data_dir)
        .with_context(|| format!("failed to initialize {}", data_dir.display()))?;
    println!("initialized data directory: {}", data_dir.display());
    println!("config: {}", config_path(data_dir).display());
    Ok(())
}

fn load_config(data_dir: &Path) -> AppConfig {
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}
