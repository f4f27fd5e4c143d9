//! Search relevance CLI
//!
//! Runs relevance fixtures against the configured engines, issues single
//! queries, and prints the effective configuration.

#![forbid(unsafe_code)]

use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use search_relevance_core::{
    Dispatcher, EngineRegistry, EntityKind, JsonlEngine, Query, SearchConfig,
};
use search_relevance_eval::{Grader, GraderConfig, RelevanceRunner, RunnerConfig};
use serde_json::json;
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn Error>>;

#[derive(Parser, Debug)]
#[command(name = "search-relevance")]
#[command(version, about = "Grade search engines against curated relevance fixtures")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run fixtures and report pass/fail per query (exit 1 if any fail)
    Run {
        /// Fixture files (.json or .jsonl) or directories containing them
        #[arg(long = "fixtures", required = true, num_args = 1..)]
        fixtures: Vec<PathBuf>,

        /// Directory holding documents.jsonl, passages.jsonl, labels.jsonl
        #[arg(long)]
        data_dir: PathBuf,

        /// Write the full report as JSON
        #[arg(long)]
        report_json: Option<PathBuf>,

        /// Write per-query outcomes as JSON Lines
        #[arg(long)]
        report_jsonl: Option<PathBuf>,

        /// Queries in flight (overrides RELEVANCE_CONCURRENCY)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Page size for fixtures without a depth (overrides RELEVANCE_DEPTH)
        #[arg(long)]
        depth: Option<usize>,
    },

    /// Issue one query and print the page as JSON
    Search {
        /// document, passage, or label (plural accepted)
        entity: EntityKind,

        /// Search term
        term: String,

        /// Directory holding the entity's .jsonl data
        #[arg(long)]
        data_dir: PathBuf,

        /// Zero-based page index
        #[arg(long, default_value_t = 0)]
        page: usize,

        /// Results per page
        #[arg(long, default_value_t = search_relevance_core::DEFAULT_PAGE_SIZE)]
        page_size: usize,

        /// Engine name override
        #[arg(long)]
        engine: Option<String>,
    },

    /// Show effective configuration
    Config,
}

/// Register a [`JsonlEngine`] for every entity kind with a data file.
fn build_registry(data_dir: &Path) -> CliResult<EngineRegistry> {
    let mut registry = EngineRegistry::new();
    for kind in EntityKind::ALL {
        let path = data_dir.join(format!("{}.jsonl", kind.plural()));
        if !path.is_file() {
            tracing::debug!(entity = %kind, path = %path.display(), "no data file, skipping");
            continue;
        }
        let engine = JsonlEngine::from_path(kind, &path)?;
        registry.register(kind, Arc::new(engine));
    }
    if registry.is_empty() {
        return Err(format!(
            "no documents.jsonl, passages.jsonl, or labels.jsonl under {}",
            data_dir.display()
        )
        .into());
    }
    Ok(registry)
}

fn run_fixtures(
    fixtures: &[PathBuf],
    data_dir: &Path,
    report_json: Option<&Path>,
    report_jsonl: Option<&Path>,
    runner_config: RunnerConfig,
) -> CliResult<ExitCode> {
    let dispatcher = Dispatcher::new(build_registry(data_dir)?, SearchConfig::from_env());
    let runner = RelevanceRunner::new(
        dispatcher,
        Grader::new(GraderConfig::from_env()),
        runner_config,
    );
    let report = runner.run_paths(fixtures)?;

    if let Some(path) = report_json {
        report.write_json(path)?;
    }
    if let Some(path) = report_jsonl {
        report.write_jsonl(path)?;
    }
    print!("{report}");

    Ok(if report.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn search_once(data_dir: &Path, query: Query) -> CliResult<serde_json::Value> {
    let dispatcher = Dispatcher::new(build_registry(data_dir)?, SearchConfig::from_env());
    let engine = dispatcher.engine_name_for(&query);
    let results = dispatcher.search(query)?;
    Ok(json!({
        "engine": engine,
        "query": results.query(),
        "items": results.items(),
        "pagination": results.pagination(),
    }))
}

fn effective_config(runner_config: &RunnerConfig) -> CliResult<String> {
    let value = json!({
        "search": SearchConfig::from_env(),
        "grader": GraderConfig::from_env(),
        "runner": runner_config,
    });
    Ok(serde_json::to_string_pretty(&value)?)
}

fn execute(cli: Cli) -> CliResult<ExitCode> {
    match cli.command {
        Commands::Run {
            fixtures,
            data_dir,
            report_json,
            report_jsonl,
            concurrency,
            depth,
        } => {
            let mut runner_config = RunnerConfig::from_env();
            if let Some(n) = concurrency.filter(|n| *n > 0) {
                runner_config.concurrency = n;
            }
            if let Some(d) = depth.filter(|d| *d > 0) {
                runner_config.default_depth = d;
            }
            run_fixtures(
                &fixtures,
                &data_dir,
                report_json.as_deref(),
                report_jsonl.as_deref(),
                runner_config,
            )
        }
        Commands::Search {
            entity,
            term,
            data_dir,
            page,
            page_size,
            engine,
        } => {
            let mut query = Query::new(entity, term)
                .with_page(page)
                .with_page_size(page_size);
            if let Some(engine) = engine {
                query = query.with_engine(engine);
            }
            let output = search_once(&data_dir, query)?;
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config => {
            println!("{}", effective_config(&RunnerConfig::from_env())?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match execute(cli) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err}");
            eprintln!("Error: {err}");
            ExitCode::from(2)
        }
    }
}
