//! clauseret: batch retrieval of ranked documents for many query clauses.
//!
//! The engine fans `clauses x methods` out over pluggable retrieval
//! backends, memoizes results on disk, bounds every backend call with a
//! deadline, and folds whatever comes back into one report. The CLI defined
//! here is a thin adapter over [`orchestrator::BatchOrchestrator`].

pub mod cache;
pub mod config;
pub mod corpus;
pub mod dispatch;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod report;
pub mod search;
pub mod timeout;

use std::fmt;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde_json::json;
use tracing::{info, warn};

use crate::config::{ConfigError, RetrievalConfig};
use crate::corpus::{Corpus, CorpusError, is_upstream_skip_message, load_clauses};
use crate::dispatch::Method;
use crate::logging::LogOptions;
use crate::model::types::{Clause, TaskOutcome};
use crate::orchestrator::{BatchOrchestrator, OrchestratorError};

/// Default method for `batch` when none is given.
pub const DEFAULT_BATCH_METHOD: &str = "bm25";

#[derive(Parser, Debug, Clone)]
#[command(
    name = "clauseret",
    version,
    about = "Retrieve ranked documents for contract clauses across lexical and learned methods"
)]
pub struct Cli {
    /// Configuration file (TOML). Defaults to $XDG_CONFIG_HOME/clauseret/config.toml.
    #[arg(long, global = true, env = "CLAUSERET_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory for cached retrieval results.
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Per-task deadline in seconds.
    #[arg(long, global = true, value_name = "SECS")]
    pub timeout: Option<f64>,

    /// Worker threads for batch runs.
    #[arg(long, global = true, value_name = "N")]
    pub workers: Option<usize>,

    /// Document fields to search (repeatable or comma-separated).
    #[arg(
        long = "on",
        global = true,
        value_name = "FIELD",
        value_delimiter = ',',
        action = ArgAction::Append
    )]
    pub on: Vec<String>,

    /// Neither read nor write the result cache.
    #[arg(long, global = true)]
    pub no_cache: bool,

    /// Also write logs to this file.
    #[arg(long, global = true, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// More log output (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Machine-readable output and JSON error payloads.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Rank corpus documents for one query and print them as JSON.
    Retrieve {
        /// Query text.
        query: String,
        /// Retrieval method (see `clauseret methods`).
        method: String,
        /// Number of documents to return.
        k: usize,
        /// Corpus JSON file.
        corpus: String,
    },

    /// Run every clause against every method and print the report.
    #[command(group(
        clap::ArgGroup::new("input")
            .required(true)
            .args(["clauses", "query"])
    ))]
    Batch {
        /// Corpus JSON file.
        #[arg(long, value_name = "FILE")]
        corpus: String,

        /// Clauses JSON file (array of {id, Clause} or object keyed by id).
        #[arg(long, value_name = "FILE")]
        clauses: Option<PathBuf>,

        /// Inline query text (repeatable); ids are assigned by position.
        #[arg(long = "query", value_name = "TEXT")]
        query: Vec<String>,

        /// Retrieval methods (repeatable or comma-separated). Defaults to bm25.
        #[arg(short, long = "method", value_name = "METHOD", value_delimiter = ',')]
        method: Vec<String>,

        /// Documents per (clause, method). Defaults to the configured default_k.
        #[arg(short)]
        k: Option<usize>,

        /// Write the report here instead of stdout.
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Show a progress bar on stderr.
        #[arg(long)]
        progress: bool,
    },

    /// List recognized retrieval methods.
    Methods,

    /// Inspect or empty the result cache.
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheCommand {
    /// Entry count and size on disk.
    Stats,
    /// Delete every cached entry.
    Clear,
}

/// Error surfaced to the process edge: message, exit code, and robot-mode metadata.
#[derive(Debug, Clone)]
pub struct CliError {
    pub code: i32,
    pub kind: &'static str,
    pub message: String,
    pub hint: Option<String>,
    pub retryable: bool,
}

pub type CliResult<T = ()> = Result<T, CliError>;

impl CliError {
    pub const EXIT_OTHER: i32 = 1;
    pub const EXIT_USAGE: i32 = 2;
    pub const EXIT_CORPUS: i32 = 3;
    pub const EXIT_TASK: i32 = 4;

    fn new(code: i32, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            kind,
            message: message.into(),
            hint: None,
            retryable: false,
        }
    }

    fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::new(Self::EXIT_USAGE, "usage", message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(Self::EXIT_OTHER, "internal", message)
    }

    /// Robot-mode payload.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "error": {
                "code": self.code,
                "kind": self.kind,
                "message": self.message,
                "hint": self.hint,
                "retryable": self.retryable,
            }
        })
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, "\nhint: {hint}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CliError {}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        CliError::new(CliError::EXIT_USAGE, "config", format!("configuration error: {err}"))
    }
}

impl From<CorpusError> for CliError {
    fn from(err: CorpusError) -> Self {
        let hint = match &err {
            CorpusError::NotFound(_) => {
                Some("check the path; relative paths resolve from the working directory")
            }
            CorpusError::Structure(_) => {
                Some("expected a JSON array of objects, each with a unique `id`")
            }
            _ => None,
        };
        let error = CliError::new(CliError::EXIT_CORPUS, "input", err.to_string());
        match hint {
            Some(hint) => error.with_hint(hint),
            None => error,
        }
    }
}

impl From<OrchestratorError> for CliError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::InvalidK(_) | OrchestratorError::NoMethods => {
                CliError::usage(err.to_string())
            }
            OrchestratorError::Pool(_) => CliError::other(err.to_string()),
        }
    }
}

/// Parsed command line, ready to run.
#[derive(Debug, Clone)]
pub struct ParsedCli {
    pub cli: Cli,
}

impl ParsedCli {
    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            verbosity: self.cli.verbose,
            quiet: self.cli.quiet,
            log_file: self.cli.log_file.clone(),
            ansi: std::io::stderr().is_terminal(),
        }
    }
}

/// Parse raw process arguments. `--help` and `--version` print and exit here.
pub fn parse_cli(raw_args: Vec<String>) -> CliResult<ParsedCli> {
    match Cli::try_parse_from(raw_args) {
        Ok(cli) => Ok(ParsedCli { cli }),
        Err(err) => match err.kind() {
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                err.exit()
            }
            _ => Err(
                CliError::usage(err.render().to_string().trim_end().to_string())
                    .with_hint("run `clauseret --help` for usage"),
            ),
        },
    }
}

/// Layered configuration: file, then environment, then command-line flags.
pub fn resolve_config(cli: &Cli) -> CliResult<RetrievalConfig> {
    let mut config = RetrievalConfig::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.cache_dir {
        config.cache.dir = Some(dir.clone());
    }
    if let Some(timeout) = cli.timeout {
        config.timeout_secs = timeout;
    }
    if let Some(workers) = cli.workers {
        config.workers = Some(workers);
    }
    if !cli.on.is_empty() {
        config.fields = cli.on.clone();
    }
    if cli.no_cache {
        config.cache.enabled = false;
    }
    config.validate()?;
    Ok(config)
}

pub fn run_with_parsed(parsed: ParsedCli) -> CliResult {
    let cli = parsed.cli;
    let Some(command) = cli.command.clone() else {
        Cli::command()
            .print_help()
            .map_err(|e| CliError::other(e.to_string()))?;
        println!();
        return Ok(());
    };

    match command {
        Commands::Retrieve {
            query,
            method,
            k,
            corpus,
        } => run_retrieve(&cli, &query, &method, k, &corpus),
        Commands::Batch {
            corpus,
            clauses,
            query,
            method,
            k,
            output,
            progress,
        } => run_batch(
            &cli,
            BatchArgs {
                corpus: &corpus,
                clauses: clauses.as_deref(),
                queries: &query,
                methods: method,
                k,
                output: output.as_deref(),
                progress,
            },
        ),
        Commands::Methods => run_methods(&cli),
        Commands::Cache { action } => run_cache(&cli, action),
    }
}

fn print_json(value: &impl serde::Serialize) -> CliResult {
    let text = serde_json::to_string_pretty(value).map_err(|e| CliError::other(e.to_string()))?;
    println!("{text}");
    Ok(())
}

fn run_retrieve(cli: &Cli, query: &str, method: &str, k: usize, corpus_arg: &str) -> CliResult {
    if is_upstream_skip_message(corpus_arg) {
        warn!(message = corpus_arg, "upstream skipped this input; returning no results");
        println!("[]");
        return Ok(());
    }
    if k == 0 {
        return Err(CliError::usage("k must be at least 1"));
    }
    let config = resolve_config(cli)?;
    let corpus = Arc::new(Corpus::load(Path::new(corpus_arg), &config.fields)?);
    let orchestrator = BatchOrchestrator::from_config(&config);
    let completion = orchestrator.run_single(query, method, k, &corpus)?;
    info!(
        method,
        outcome = completion.outcome.kind(),
        cached = completion.cached,
        elapsed_ms = completion.elapsed.as_millis() as u64,
        "retrieve finished"
    );

    match completion.outcome {
        TaskOutcome::Success(docs) => print_json(&docs),
        TaskOutcome::UnsupportedMethod => Err(CliError::new(
            CliError::EXIT_USAGE,
            "unsupported-method",
            format!("unsupported method: {method}"),
        )
        .with_hint("run `clauseret methods` to list recognized methods")),
        TaskOutcome::Timeout(budget) => {
            let mut err = CliError::new(
                CliError::EXIT_TASK,
                "timeout",
                format!("{method} timed out after {:.3}s", budget.as_secs_f64()),
            )
            .with_hint("raise --timeout or pick a lexical method");
            err.retryable = true;
            Err(err)
        }
        TaskOutcome::BackendFailure(reason) => Err(CliError::new(
            CliError::EXIT_TASK,
            "backend",
            format!("{method} failed: {reason}"),
        )),
    }
}

struct BatchArgs<'a> {
    corpus: &'a str,
    clauses: Option<&'a Path>,
    queries: &'a [String],
    methods: Vec<String>,
    k: Option<usize>,
    output: Option<&'a Path>,
    progress: bool,
}

fn run_batch(cli: &Cli, args: BatchArgs<'_>) -> CliResult {
    if is_upstream_skip_message(args.corpus) {
        warn!(message = args.corpus, "upstream skipped this input; returning an empty report");
        return emit_report(&report::ResultAggregator::new().finalize(), args.output);
    }
    let config = resolve_config(cli)?;
    let k = args.k.unwrap_or(config.default_k);
    let methods = if args.methods.is_empty() {
        vec![DEFAULT_BATCH_METHOD.to_string()]
    } else {
        args.methods
    };

    let corpus = Arc::new(Corpus::load(Path::new(args.corpus), &config.fields)?);
    let clauses = match args.clauses {
        Some(path) => load_clauses(path, &config.clause_field)?,
        None => args
            .queries
            .iter()
            .enumerate()
            .map(|(idx, text)| Clause::new(idx as i64, text.as_str()))
            .collect(),
    };

    let orchestrator = BatchOrchestrator::from_config(&config);
    let bar = ProgressBar::new(0);
    if args.progress && !cli.quiet && std::io::stderr().is_terminal() {
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} tasks")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
    } else {
        bar.set_draw_target(ProgressDrawTarget::hidden());
    }

    let batch = orchestrator.run_with_progress(&clauses, &methods, k, corpus, |done, total| {
        bar.set_length(total as u64);
        bar.set_position(done as u64);
    })?;
    bar.finish_and_clear();

    emit_report(&batch.report, args.output)
}

fn emit_report(report: &report::AggregatedReport, output: Option<&Path>) -> CliResult {
    match output {
        Some(path) => {
            report
                .write_json(path)
                .map_err(|e| CliError::other(e.to_string()))?;
            info!(path = %path.display(), "wrote report");
            Ok(())
        }
        None => {
            let text = report
                .to_json_pretty()
                .map_err(|e| CliError::other(e.to_string()))?;
            println!("{text}");
            Ok(())
        }
    }
}

fn run_methods(cli: &Cli) -> CliResult {
    if cli.json {
        let listing: Vec<serde_json::Value> = Method::ALL
            .into_iter()
            .map(|m| {
                json!({
                    "id": m.id(),
                    "family": m.family().to_string(),
                    "aliases": m.aliases(),
                    "description": m.description(),
                })
            })
            .collect();
        return print_json(&listing);
    }
    for method in Method::ALL {
        let aliases = if method.aliases().is_empty() {
            String::new()
        } else {
            format!(" (aliases: {})", method.aliases().join(", "))
        };
        println!(
            "{:<14} {:<8} {}{}",
            method.id(),
            method.family(),
            method.description(),
            aliases
        );
    }
    Ok(())
}

fn run_cache(cli: &Cli, action: CacheCommand) -> CliResult {
    let config = resolve_config(cli)?;
    let root = config.cache_dir();
    match action {
        CacheCommand::Stats => {
            let stats = cache::dir_stats(&root).map_err(|e| CliError::other(e.to_string()))?;
            if cli.json {
                return print_json(&stats);
            }
            println!(
                "{}: {} entries in {} namespaces, {} bytes",
                stats.dir.display(),
                stats.entries,
                stats.namespaces,
                stats.bytes
            );
            Ok(())
        }
        CacheCommand::Clear => {
            let removed = cache::clear_dir(&root).map_err(|e| CliError::other(e.to_string()))?;
            if cli.json {
                return print_json(&json!({ "dir": root, "removed": removed }));
            }
            println!("removed {removed} entries from {}", root.display());
            Ok(())
        }
    }
}
