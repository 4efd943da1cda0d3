use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use evalrunner::adapters::AdapterRegistry;
use evalrunner::config::{AppConfig, LoggingConfig};
use evalrunner::model::{TestResult, TestRun, TestStatus};
use evalrunner::report::{self, ExportFormat};
use evalrunner::runner::{progress, ProgressEvent, RunOptions};
use evalrunner::storage::{ResultStore, SqliteStore};

#[derive(Parser)]
#[command(
    name = "evalrunner",
    about = "Run LLM evaluation suites and keep their results",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file (default: $EVALRUNNER_CONFIG, then ./evalrunner.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Bind address (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run a suite file and print its results
    Run {
        /// Suite file (.toml, .json or .yaml)
        suite: PathBuf,

        /// Only run these test case ids (comma separated or repeated)
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,

        /// Maximum concurrent tests (overrides runner.max_concurrency)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Substitution variable, KEY=VALUE (VALUE may be JSON)
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, Value)>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Inspect stored runs
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },

    /// Recent results of one test case across runs
    History {
        test_case_id: String,

        #[arg(long, default_value = "10")]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Export a stored run
    Export {
        run_id: String,

        #[arg(long, value_enum, default_value = "json")]
        format: ExportFormat,

        /// Write to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// List registered adapter types
    Adapters,

    /// List metrics offered by the evaluation service
    Metrics,
}

#[derive(Subcommand)]
enum RunsAction {
    /// List recent runs
    List {
        #[arg(long)]
        suite: Option<String>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show one run with its results
    Show {
        run_id: String,

        #[arg(long)]
        json: bool,
    },
}

fn parse_var(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.is_empty() {
        return Err("variable name must not be empty".to_string());
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = AppConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            let mut config = config;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting evalrunner server");
            evalrunner::serve(config).await?;
        }
        Commands::Run {
            suite,
            only,
            concurrency,
            vars,
            json,
        } => return run_suite(&config, suite, only, concurrency, vars, json).await,
        Commands::Runs { action } => {
            let store = open_store(&config)?;
            match action {
                RunsAction::List { suite, limit } => {
                    let runs = store.list_runs(suite.as_deref(), limit)?;
                    println!(
                        "{:<36} | {:<20} | {:<9} | {:>5} | {:>5} | {:>5} | {:>5} | Started",
                        "Run", "Suite", "Status", "Pass", "Fail", "Err", "Skip"
                    );
                    println!("{:-<36}-|-{:-<20}-|-{:-<9}-|-{:-<5}-|-{:-<5}-|-{:-<5}-|-{:-<5}-|-{:-<20}", "", "", "", "", "", "", "", "");
                    for run in &runs {
                        println!(
                            "{:<36} | {:<20} | {:<9} | {:>5} | {:>5} | {:>5} | {:>5} | {}",
                            run.id,
                            run.suite_name,
                            run.status,
                            run.passed,
                            run.failed,
                            run.errored,
                            run.skipped,
                            run.started_at.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }
                RunsAction::Show { run_id, json } => {
                    let run = store
                        .get_run(&run_id)?
                        .with_context(|| format!("run '{run_id}' not found"))?;
                    let results = store.get_results(&run_id)?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&report::export_json(&run, &results))?);
                    } else {
                        print_results(&run, &results);
                    }
                }
            }
        }
        Commands::History {
            test_case_id,
            limit,
            json,
        } => {
            let store = open_store(&config)?;
            let entries = store.get_history(&test_case_id, limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                println!("\nHistory for {test_case_id} ({} results)", entries.len());
                println!("{:<25} | {:<36} | {:<8} | Metrics", "Timestamp", "Run", "Status");
                println!("{:-<25}-|-{:-<36}-|-{:-<8}-|-{:-<30}", "", "", "", "");
                for entry in &entries {
                    println!(
                        "{:<25} | {:<36} | {:<8} | {}",
                        entry.result.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        entry.run_id,
                        entry.result.status,
                        metric_summary(&entry.result)
                    );
                }
            }
        }
        Commands::Export {
            run_id,
            format,
            output,
        } => {
            let store = open_store(&config)?;
            let run = store
                .get_run(&run_id)?
                .with_context(|| format!("run '{run_id}' not found"))?;
            let results = store.get_results(&run_id)?;
            let rendered = report::export(&run, &results, format)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Exported run {run_id} to {}", path.display());
                }
                None => println!("{rendered}"),
            }
        }
        Commands::Adapters => {
            for kind in AdapterRegistry::with_builtins().kinds() {
                println!("{kind}");
            }
        }
        Commands::Metrics => {
            let client = evalrunner::evaluation::HttpEvaluator::from_config(&config.evaluation)?;
            let metrics = client
                .list_metrics()
                .await
                .with_context(|| format!("querying {}", client.base_url()))?;
            println!("{:<30} | Description", "Metric");
            println!("{:-<30}-|-{:-<50}", "", "");
            for m in &metrics {
                println!("{:<30} | {}", m.name, m.description);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn open_store(config: &AppConfig) -> Result<SqliteStore> {
    SqliteStore::open(&config.storage.db_path)
        .with_context(|| format!("opening result store at {}", config.storage.db_path.display()))
}

async fn run_suite(
    config: &AppConfig,
    path: PathBuf,
    only: Vec<String>,
    concurrency: Option<usize>,
    vars: Vec<(String, Value)>,
    json: bool,
) -> Result<ExitCode> {
    let suite = evalrunner::suite::load_suite(&path)?;
    let (runner, _evaluator) = evalrunner::build_runner(config, AdapterRegistry::with_builtins())?;

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling run: no new tests will start");
            on_ctrl_c.cancel();
        }
    });

    let (sink, mut rx) = progress::channel(config.runner.progress_buffer);
    let options = RunOptions {
        only: (!only.is_empty()).then(|| only.into_iter().collect::<BTreeSet<_>>()),
        variables: vars.into_iter().collect::<Map<String, Value>>(),
        max_concurrency: concurrency,
        progress: Some(sink),
        cancel,
        ..Default::default()
    };
    let handle = runner.spawn(Arc::new(suite), options)?;
    if !json {
        println!("Run {} started", handle.run_id());
    }

    while let Some(event) = rx.recv().await {
        if let (false, ProgressEvent::TestCompleted { result, .. }) = (json, &event) {
            println!(
                "  {:<8} {:<30} {:>8.0} ms  {}",
                result.status.as_str().to_uppercase(),
                result.test_case_id,
                result.duration.as_secs_f64() * 1000.0,
                result.error.as_deref().unwrap_or("")
            );
        }
    }

    let outcome = handle.wait().await?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report::export_json(&outcome.run, &outcome.results))?
        );
    } else {
        println!();
        print!("{}", report::format_summary(&outcome.run));
    }

    let run = &outcome.run;
    Ok(if run.failed + run.errored > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn metric_summary(result: &TestResult) -> String {
    result
        .metrics
        .iter()
        .map(|(name, m)| format!("{}{}={:.2}", if m.passed { "" } else { "!" }, name, m.score))
        .collect::<Vec<_>>()
        .join(" ")
}

fn print_results(run: &TestRun, results: &[TestResult]) {
    print!("{}", report::format_summary(run));
    println!();
    println!("{:<30} | {:<8} | {:>9} | Metrics / error", "Test case", "Status", "ms");
    println!("{:-<30}-|-{:-<8}-|-{:-<9}-|-{:-<40}", "", "", "", "");
    for result in results {
        let detail = match result.status {
            TestStatus::Errored | TestStatus::Skipped => result.error.clone().unwrap_or_default(),
            _ => metric_summary(result),
        };
        println!(
            "{:<30} | {:<8} | {:>9.0} | {}",
            result.test_case_id,
            result.status,
            result.duration.as_secs_f64() * 1000.0,
            detail
        );
    }
}
