//! CLI command definitions for sciforge.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::cache::CacheStats;
use crate::config::EngineConfig;
use crate::data::Dataset;
use crate::engine::Engine;
use crate::llm::{LiteLlmClient, LlmProvider};
use crate::metrics::{export_metrics, init_metrics};
use crate::monitor::{
    EventKind, FanoutSink, MetricsSink, RecordingSink, SharedSink, TracingSink,
};
use crate::supervisor::{AgentHealth, PipelinePlan, PlanReport};

/// Hybrid agent execution engine for staged data-science pipelines.
#[derive(Parser)]
#[command(name = "sciforge")]
#[command(about = "Run staged data pipelines with cached, validated, fallback-capable agents")]
#[command(version)]
#[command(
    long_about = "sciforge runs a pipeline plan over a tabular dataset. Each stage reuses a cached artifact when it can, otherwise asks the library backend (and, with --llm, a generative backend) for one, validates it and executes it under resource limits.\n\nExample usage:\n  sciforge plan-template > plan.yaml\n  sciforge run --input data.json --plan plan.yaml --json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a pipeline plan over a JSON dataset.
    Run(RunArgs),

    /// Print a starter plan as YAML.
    #[command(name = "plan-template")]
    PlanTemplate(PlanTemplateArgs),

    /// Print the Prometheus metric families the engine exports.
    Metrics,
}

/// Arguments for `sciforge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Input dataset: a JSON array of records or {"columns": [...], "rows": [...]}.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Pipeline plan (YAML). Uses the built-in template when omitted.
    #[arg(short, long)]
    pub plan: Option<PathBuf>,

    /// Engine configuration (YAML). SCIFORGE_* variables override it.
    #[arg(short, long, env = "SCIFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Register the generative backend (needs SCIFORGE_LLM_API_BASE).
    #[arg(long)]
    pub llm: bool,

    /// Model for the generative backend.
    #[arg(short, long, env = "SCIFORGE_LLM_MODEL")]
    pub model: Option<String>,

    /// Print the run summary as JSON.
    #[arg(long)]
    pub json: bool,

    /// Write the final transformed dataset to this file.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Print Prometheus metrics after the run.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for `sciforge plan-template`.
#[derive(Parser, Debug)]
pub struct PlanTemplateArgs {
    /// Write the template here instead of stdout.
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_pipeline_command(args).await?,
        Commands::PlanTemplate(args) => run_plan_template_command(args)?,
        Commands::Metrics => run_metrics_command()?,
    }
    Ok(())
}

// ============================================================================
// Run Command Implementation
// ============================================================================

/// JSON summary printed by `sciforge run --json`.
#[derive(Debug, Serialize)]
struct RunSummary {
    status: String,
    plan: PlanReport,
    rows: usize,
    columns: Vec<String>,
    cache: CacheStats,
    stages: Vec<AgentHealth>,
    fallbacks: usize,
    cache_hits: usize,
}

async fn run_pipeline_command(args: RunArgs) -> anyhow::Result<()> {
    init_metrics().map_err(|e| anyhow::anyhow!("Failed to initialize metrics: {}", e))?;

    let config = load_engine_config(args.config.as_deref())?;
    let plan = match &args.plan {
        Some(path) => PipelinePlan::from_yaml_file(path)
            .with_context(|| format!("Failed to load plan {}", path.display()))?,
        None => {
            info!("No plan given; using the built-in template");
            PipelinePlan::template()
        }
    };
    let data = load_dataset_file(&args.input)?;
    info!(
        plan = %plan.name,
        rows = data.row_count(),
        columns = data.column_count(),
        "Starting run"
    );

    let provider = if args.llm {
        Some(build_llm_client(args.model.clone())?)
    } else {
        None
    };

    let recording = Arc::new(RecordingSink::new());
    let sink: SharedSink = Arc::new(FanoutSink::new(vec![
        Arc::new(TracingSink) as SharedSink,
        Arc::new(MetricsSink::new()) as SharedSink,
        recording.clone() as SharedSink,
    ]));

    let store = Engine::open_store(&config).await?;
    let engine = Engine::new(config, store, sink, provider);
    let report = engine.run_plan(&plan, &data).await?;
    let output = engine.load(&report.data_output).await?;

    if let Some(path) = &args.output {
        let records = serde_json::to_string_pretty(&output.to_records())?;
        fs::write(path, records)
            .with_context(|| format!("Failed to write output file {}", path.display()))?;
        info!(path = %path.display(), rows = output.row_count(), "Output written");
    }

    let stages = engine.supervisor().status().await?;
    let summary = RunSummary {
        status: if report.success { "success" } else { "failed" }.to_string(),
        rows: output.row_count(),
        columns: output.columns.clone(),
        cache: engine.cache().stats(),
        stages,
        fallbacks: recording.count(EventKind::Fallback),
        cache_hits: recording.count(EventKind::CacheHit),
        plan: report,
    };
    engine.shutdown().await;

    if args.json {
        let json_output = serde_json::to_string_pretty(&summary)
            .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
        println!("{}", json_output);
    } else {
        print_summary(&summary);
    }

    if args.metrics {
        println!("{}", export_metrics());
    }

    if summary.status != "success" {
        anyhow::bail!("Plan '{}' failed", summary.plan.plan);
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("Plan: {} ({})", summary.plan.plan, summary.status);
    println!("{}", "-".repeat(72));
    for step in &summary.plan.steps {
        let round = if step.round > 0 {
            format!(" [feedback {}]", step.round)
        } else {
            String::new()
        };
        println!(
            "  {:<20} {:<20} {:<10} retries={}{}",
            step.stage.as_str(),
            step.operation,
            step.status.to_string(),
            step.retry_count,
            round
        );
        for reason in &step.reasons {
            println!("      - {}", reason);
        }
    }
    println!("{}", "-".repeat(72));
    println!(
        "Output: {} rows x {} columns",
        summary.rows,
        summary.columns.len()
    );
    println!(
        "Cache: {} hits, {} misses, {} inserts",
        summary.cache.hits, summary.cache.misses, summary.cache.inserts
    );
    for (stage, data_ref) in summary.plan.reports() {
        println!("Report ({}): {}", stage, data_ref);
    }
    println!("Duration: {} ms", summary.plan.duration_ms);
}

fn load_engine_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let base = match path {
        Some(path) => EngineConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    base.with_overrides(|key| std::env::var(key).ok())
        .context("Invalid SCIFORGE_* environment configuration")
}

fn load_dataset_file(path: &Path) -> anyhow::Result<Dataset> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read input {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Input {} is not valid JSON", path.display()))?;
    Dataset::from_json_value(value)
        .with_context(|| format!("Input {} is not a tabular dataset", path.display()))
}

fn build_llm_client(model: Option<String>) -> anyhow::Result<Arc<dyn LlmProvider>> {
    let client = LiteLlmClient::from_env().map_err(|e| {
        anyhow::anyhow!(
            "Failed to initialize LLM client: {}. Set SCIFORGE_LLM_API_BASE (and SCIFORGE_LLM_API_KEY if needed).",
            e
        )
    })?;
    let client = match model {
        Some(model) => LiteLlmClient::new(
            client.api_base().to_string(),
            std::env::var("SCIFORGE_LLM_API_KEY").ok().filter(|k| !k.is_empty()),
            model,
        )?,
        None => client,
    };
    info!(model = %client.default_model(), api_base = %client.api_base(), "Generative backend enabled");
    Ok(Arc::new(client))
}

// ============================================================================
// Other Commands
// ============================================================================

fn run_plan_template_command(args: PlanTemplateArgs) -> anyhow::Result<()> {
    let yaml = PipelinePlan::template().to_yaml()?;
    match &args.output {
        Some(path) => {
            fs::write(path, &yaml)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), "Plan template written");
        }
        None => print!("{}", yaml),
    }
    Ok(())
}

fn run_metrics_command() -> anyhow::Result<()> {
    init_metrics().map_err(|e| anyhow::anyhow!("Failed to initialize metrics: {}", e))?;
    let exported = export_metrics();
    if exported.trim().is_empty() {
        warn!("No metrics recorded yet; families appear once observed");
    }
    println!("{}", exported);
    Ok(())
}
