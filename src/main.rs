//! # Deep Research
//!
//! Iterative research from the command line: generate queries, search the
//! web, analyze and validate what was found, repeat until the findings are
//! good enough, then write a report.
//!
//! ## Quick Start
//! ```bash
//! cargo run -- "grid-scale energy storage" -c "region=EU" --max-iterations 3
//! ```

// =============================================================================
// MODULE DECLARATIONS
// =============================================================================

/// Configuration management
mod config;

/// Model-backed research stages
mod llm;

/// Web search provider
mod tools;

// =============================================================================
// IMPORTS
// =============================================================================
use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use research_flow::{
    CachedExecution, CachedQueryGenerator, ConcurrentSearch, FileStore, KeyValueCache, MemoryCache,
    ProgressEvent, ResearchOrchestrator, ResearchRequest, ResearchStatus, StageAdapters, StagePayload,
};

use crate::config::Config;
use crate::llm::{ModelStages, OllamaModel};
use crate::tools::DuckDuckGoProvider;

// =============================================================================
// CLI ARGUMENTS
// =============================================================================
/// # Rust Concept: Derive Macros with Clap
///
/// Each field is an argument; `env = ...` lets the environment supply a
/// default that the flag overrides.
#[derive(Parser, Debug)]
#[command(
    name = "deep-research",
    version,
    about = "Iterative AI research: query, search, analyze, validate, report",
    long_about = r#"
Deep Research runs an iterative research loop against a local LLM (via Ollama)
and DuckDuckGo web search. Each iteration generates search queries, collects
new sources, analyzes coverage and validates the findings. The loop stops when
the findings are sufficient and valid, or the iteration budget is spent, and
then a markdown report is written.

PREREQUISITES:
  1. Install Ollama: https://ollama.ai
  2. Pull a model: ollama pull llama3.2
  3. Start Ollama: ollama serve

EXAMPLES:
  deep-research "solid-state batteries"
  deep-research "heat pumps in cold climates" -c "country=Norway" -c "focus=retrofits"
  deep-research --json --max-iterations 2 "ocean acidification" > events.jsonl
"#
)]
struct Args {
    /// The topic to research
    #[arg(value_name = "TOPIC")]
    topic: String,

    /// Clarification as key=value (repeatable)
    #[arg(short = 'c', long = "clarify", value_name = "KEY=VALUE", value_parser = parse_clarification)]
    clarifications: Vec<(String, String)>,

    /// Iteration budget (overrides MAX_ITERATIONS)
    #[arg(long = "max-iterations", value_name = "N")]
    max_iterations: Option<u32>,

    /// The Ollama model to use (overrides OLLAMA_MODEL env var)
    #[arg(short = 'm', long = "model", env = "OLLAMA_MODEL")]
    model: Option<String>,

    /// Print progress as JSON lines instead of text
    #[arg(long = "json", default_value = "false")]
    json: bool,

    /// Directory for research records (overrides RESEARCH_DATA_DIR)
    #[arg(long = "data-dir", value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Redis URL for the cache (overrides REDIS_URL)
    #[arg(long = "redis-url", value_name = "URL")]
    redis_url: Option<String>,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long = "verbose", default_value = "false")]
    verbose: bool,
}

fn parse_clarification(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

// =============================================================================
// MAIN FUNCTION
// =============================================================================
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::from_env()?;
    apply_overrides(&mut config, &args);

    init_logging(args.verbose, &config.log_level)?;
    config.validate()?;

    info!(
        model = %config.model,
        host = %config.ollama_host,
        data_dir = %config.data_dir.display(),
        "Configuration loaded"
    );

    let cache = CachedExecution::new(build_cache(&config).await?);
    let orchestrator = build_orchestrator(&config, cache)?;

    let mut request = ResearchRequest::new(args.topic.as_str()).with_max_iterations(config.max_iterations);
    for (key, value) in &args.clarifications {
        request = request.with_clarification(key.as_str(), value.as_str());
    }

    let record = orchestrator
        .initialize_research(request)
        .await
        .context("Could not start research")?;
    let mut run = orchestrator.execute_research(&record.id).await?;

    // Ctrl-C stops the run at the next stage boundary
    let cancel = run.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current stage");
            cancel.cancel();
        }
    });

    if !args.json {
        println!(
            "{} {} ({})",
            "Researching".bold(),
            record.topic.cyan(),
            record.id.dimmed()
        );
    }

    while let Some(event) = run.next().await {
        if args.json {
            println!("{}", event.to_json()?);
        } else {
            print_progress(&event);
        }
    }

    let result = orchestrator.get_research_result(&record.id).await?;
    let stats = orchestrator.analytics();
    info!(
        hits = stats.hits,
        misses = stats.misses,
        hit_rate = stats.hit_rate,
        "Cache statistics"
    );

    match (result.status, result.report) {
        (ResearchStatus::Completed, Some(report)) => {
            if !args.json {
                println!("\n{}", "=".repeat(60));
                println!("{}", "RESEARCH REPORT".bold());
                println!("{}\n", "=".repeat(60));
                println!("{}", report);
                println!("\n{}", "=".repeat(60));
            }
            info!(research_id = %record.id, "Research completed successfully");
            Ok(())
        }
        (status, _) => {
            let message = result.error.unwrap_or_else(|| format!("research ended as {}", status));
            error!(research_id = %record.id, error = %message, "Research failed");
            eprintln!("\n{} {}", "Research failed:".red().bold(), message);
            print_hint(&message);
            anyhow::bail!(message)
        }
    }
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(model) = &args.model {
        config.model = model.clone();
    }
    if let Some(max) = args.max_iterations {
        config.max_iterations = max;
    }
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(url) = &args.redis_url {
        config.redis_url = Some(url.clone());
    }
}

// =============================================================================
// WIRING
// =============================================================================
#[cfg(feature = "cache-redis")]
async fn build_cache(config: &Config) -> Result<Arc<dyn KeyValueCache>> {
    match &config.redis_url {
        Some(url) => {
            let cache = research_flow::RedisCache::new(url)
                .await
                .context("Could not connect to Redis")?
                .with_compression(true);
            info!(url = %url, "Using Redis cache");
            Ok(Arc::new(cache))
        }
        None => Ok(Arc::new(MemoryCache::new())),
    }
}

#[cfg(not(feature = "cache-redis"))]
async fn build_cache(config: &Config) -> Result<Arc<dyn KeyValueCache>> {
    if config.redis_url.is_some() {
        warn!("Built without the cache-redis feature, using the in-memory cache");
    }
    Ok(Arc::new(MemoryCache::new()))
}

fn build_orchestrator(config: &Config, cache: CachedExecution) -> Result<ResearchOrchestrator> {
    let research = config.research_config();

    let stages = ModelStages::new(Arc::new(OllamaModel::from_config(config)));
    let queries = CachedQueryGenerator::new(stages.clone(), cache.clone(), research.cache_ttl.queries);

    let provider = DuckDuckGoProvider::new(config.search_timeout).context("Could not build HTTP client")?;
    let search = ConcurrentSearch::new(provider, &research).with_cache(cache.clone(), research.cache_ttl.search);

    let adapters = StageAdapters::with_fallbacks(queries, search, stages.clone(), stages.clone(), stages);
    let store = Arc::new(FileStore::new(&config.data_dir));

    Ok(ResearchOrchestrator::new(adapters, store, cache, research)?)
}

// =============================================================================
// OUTPUT
// =============================================================================
fn print_progress(event: &ProgressEvent) {
    match event {
        ProgressEvent::Status { iteration, data, .. } => {
            let prefix = format!("[{}]", iteration).dimmed();
            match data {
                StagePayload::QueryGeneration { queries, .. } => {
                    println!("{} {} {} queries", prefix, "Generated".green(), queries.len());
                    for query in queries {
                        println!("    {}", query.dimmed());
                    }
                }
                StagePayload::Search {
                    results_count,
                    findings_count,
                } => println!(
                    "{} {} {} new sources ({} findings total)",
                    prefix,
                    "Found".green(),
                    results_count,
                    findings_count
                ),
                StagePayload::Analysis {
                    coverage_score,
                    gaps,
                    ..
                } => println!(
                    "{} {} coverage {:.0}%, {} gaps",
                    prefix,
                    "Analyzed".green(),
                    coverage_score * 100.0,
                    gaps.len()
                ),
                StagePayload::Validation { is_valid, confidence } => println!(
                    "{} {} {} ({:.0}% confidence)",
                    prefix,
                    "Validated".green(),
                    if *is_valid { "valid".normal() } else { "not valid".yellow() },
                    confidence * 100.0
                ),
                StagePayload::Report { .. } => println!("{} {}", prefix, "Report written".green().bold()),
            }
        }
        ProgressEvent::Error { message, .. } => {
            eprintln!("{} {}", "Error:".red().bold(), message);
        }
    }
}

fn print_hint(message: &str) {
    if message.contains("connection refused") || message.contains("error sending request") {
        eprintln!("\nTip: Make sure Ollama is running:");
        eprintln!("   ollama serve");
    } else if message.contains("model") {
        eprintln!("\nTip: Make sure the model is installed:");
        eprintln!("   ollama pull llama3.2");
    }
}

// =============================================================================
// LOGGING INITIALIZATION
// =============================================================================
/// Logs go to stderr so `--json` output on stdout stays machine-readable.
fn init_logging(verbose: bool, log_level: &str) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))?;

    Ok(())
}

// =============================================================================
// UNIT TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parsing() {
        let args = Args::parse_from(["test", "solid-state batteries"]);
        assert_eq!(args.topic, "solid-state batteries");
        assert!(args.clarifications.is_empty());
        assert!(!args.json);
        assert!(!args.verbose);
    }

    #[test]
    fn test_args_with_flags() {
        let args = Args::parse_from([
            "test",
            "--json",
            "--verbose",
            "--max-iterations",
            "2",
            "-c",
            "region=EU",
            "--clarify",
            "focus = cost",
            "--model",
            "llama3.2",
            "Heat pumps",
        ]);

        assert_eq!(args.topic, "Heat pumps");
        assert!(args.json);
        assert_eq!(args.max_iterations, Some(2));
        assert_eq!(
            args.clarifications,
            vec![
                ("region".to_string(), "EU".to_string()),
                ("focus".to_string(), "cost".to_string())
            ]
        );
        assert_eq!(args.model, Some("llama3.2".to_string()));
    }

    #[test]
    fn test_bad_clarification_rejected() {
        assert!(parse_clarification("no-equals").is_err());
        assert!(parse_clarification("=value").is_err());
        assert_eq!(
            parse_clarification("a=b=c").unwrap(),
            ("a".to_string(), "b=c".to_string())
        );
    }

    #[test]
    fn test_overrides_beat_environment() {
        let args = Args::parse_from(["test", "--max-iterations", "7", "--data-dir", "/tmp/r", "topic"]);
        let mut config = Config::default();
        apply_overrides(&mut config, &args);

        assert_eq!(config.max_iterations, 7);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/r"));
    }
}
