//! Command surface for driving ranker rebuilds against a `SQLite` database.
//!
//! Hosts embed it through [`run_cli`] for a parsed CLI, or [`run_command`]
//! against an already opened [`SqliteRankerStore`]. Every command prints one
//! JSON document on stdout; failures are rendered by [`error_envelope`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bench_ranker_core::{
    drain_dirty, format_rfc3339, run_publish_chunk, run_rebuild_chunk, Cursor, Deadline,
    MeasurementGroupInput, ParamSignature, PrettyVersionHierarchy, RankerError, RankerKey,
    RankerVersion, RebuildLease, RebuildLimits, RebuildProgress, SweepMode, TestCatalog,
};
use bench_ranker_store_sqlite::SqliteRankerStore;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ranker")]
#[command(about = "Benchmark ranker rebuild CLI")]
pub struct Cli {
    #[arg(long, default_value = "./bench_ranker.sqlite3")]
    db: PathBuf,

    /// JSON test catalog; defaults to the built-in reflow suite.
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// JSON rebuild limits; omitted fields use defaults.
    #[arg(long)]
    limits: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Rebuild {
        #[command(subcommand)]
        command: RebuildCommand,
    },
    Publish {
        #[command(subcommand)]
        command: PublishCommand,
    },
    Results {
        #[command(subcommand)]
        command: ResultsCommand,
    },
    Live {
        #[command(subcommand)]
        command: LiveCommand,
    },
    Ranker {
        #[command(subcommand)]
        command: RankerCommand,
    },
    Status,
}

#[derive(Debug, Subcommand)]
pub enum RebuildCommand {
    /// Runs a single rebuild chunk and prints the progress to resume from.
    Chunk(RebuildArgs),
    /// Runs chunks until every category is rebuilt.
    Run(RebuildArgs),
}

#[derive(Debug, Args)]
pub struct RebuildArgs {
    #[arg(long, default_value_t = 0)]
    category_index: usize,
    #[arg(long, default_value = "")]
    bookmark: String,
    #[arg(long, default_value_t = 0)]
    total_results: u64,
    #[arg(long)]
    fetch_limit: Option<usize>,
    #[arg(long)]
    ranker_limit: Option<usize>,
    #[arg(long)]
    deadline_ms: Option<u64>,
}

#[derive(Debug, Subcommand)]
pub enum PublishCommand {
    Chunk(PublishChunkArgs),
    Run(PublishRunArgs),
}

#[derive(Debug, Args)]
pub struct PublishChunkArgs {
    #[arg(long, default_value_t = 0)]
    total: u64,
    #[arg(long)]
    fetch_limit: Option<usize>,
    #[arg(long)]
    deadline_ms: Option<u64>,
    /// Drop next rankers instead of promoting them.
    #[arg(long)]
    discard: bool,
}

#[derive(Debug, Args)]
pub struct PublishRunArgs {
    #[arg(long)]
    fetch_limit: Option<usize>,
    #[arg(long)]
    discard: bool,
}

#[derive(Debug, Subcommand)]
pub enum ResultsCommand {
    Add(ResultsAddArgs),
}

#[derive(Debug, Args)]
pub struct ResultsAddArgs {
    #[arg(long)]
    category: String,
    #[arg(long)]
    browser: String,
    /// Scores as `test1=time1,test2=time2`.
    #[arg(long)]
    results: String,
    #[arg(long = "param")]
    params: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum LiveCommand {
    Drain(LiveDrainArgs),
}

#[derive(Debug, Args)]
pub struct LiveDrainArgs {
    #[arg(long, default_value_t = 100)]
    limit: usize,
}

#[derive(Debug, Subcommand)]
pub enum RankerCommand {
    Show(RankerShowArgs),
}

#[derive(Debug, Args)]
pub struct RankerShowArgs {
    #[arg(long)]
    category: String,
    #[arg(long)]
    test: String,
    #[arg(long)]
    browser: String,
    #[arg(long = "param")]
    params: Vec<String>,
    #[arg(long, value_enum, default_value_t = RankerVersionArg::Current)]
    ranker_version: RankerVersionArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RankerVersionArg {
    Current,
    Next,
}

/// Catalog and limits shared by every command.
#[derive(Debug, Clone)]
pub struct Settings {
    pub catalog: TestCatalog,
    pub limits: RebuildLimits,
}

impl Settings {
    /// Loads the catalog and limits files, falling back to built-in defaults.
    ///
    /// # Errors
    /// Returns an error when a file cannot be read or fails validation.
    pub fn load(catalog: Option<&Path>, limits: Option<&Path>) -> Result<Self> {
        let catalog = match catalog {
            Some(path) => TestCatalog::from_json(&read_json(path)?)?,
            None => TestCatalog::builtin(),
        };
        let limits = match limits {
            Some(path) => RebuildLimits::from_json(&read_json(path)?)?,
            None => RebuildLimits::default(),
        };
        Ok(Self { catalog, limits })
    }
}

/// A chunked run that stopped early; `progress` is the last point that
/// completed and is safe to resume from.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct IncompleteRun {
    pub progress: Value,
    pub source: RankerError,
}

impl IncompleteRun {
    fn new(progress: Value, source: RankerError) -> Self {
        if source.is_retryable() {
            warn!(%progress, error = %source, "chunk stopped early, retry from progress");
        }
        Self { progress, source }
    }
}

#[derive(Debug, Serialize)]
struct RebuildOutput {
    is_done: bool,
    bookmark: String,
    category_index: usize,
    fetch_limit: usize,
    rankers_updated: usize,
    total_results: u64,
}

impl RebuildOutput {
    fn new(progress: &RebuildProgress, fetch_limit: usize, rankers_updated: usize) -> Self {
        Self {
            is_done: progress.is_done,
            bookmark: progress
                .cursor
                .as_ref()
                .map(Cursor::encode)
                .unwrap_or_default(),
            category_index: progress.category_index,
            fetch_limit,
            rankers_updated,
            total_results: progress.total_results_processed,
        }
    }
}

#[derive(Debug, Serialize)]
struct PublishOutput {
    fetch_limit: usize,
    is_done: bool,
    total: u64,
}

/// Installs the stderr log subscriber; `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when settings cannot be loaded, the store cannot be opened
/// or migrated, or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let settings = Settings::load(cli.catalog.as_deref(), cli.limits.as_deref())?;
    let mut store = SqliteRankerStore::open(&cli.db)?;
    store.migrate()?;
    run_command(cli.command, &settings, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when the command fails. Interrupted chunked runs surface
/// as [`IncompleteRun`].
pub fn run_command(
    command: Command,
    settings: &Settings,
    store: &mut SqliteRankerStore,
) -> Result<()> {
    match command {
        Command::Rebuild { command } => run_rebuild(command, settings, store),
        Command::Publish { command } => run_publish(command, settings, store),
        Command::Results { command } => run_results(command, settings, store),
        Command::Live { command } => match command {
            LiveCommand::Drain(args) => {
                let report = drain_dirty(
                    store,
                    &settings.catalog,
                    &PrettyVersionHierarchy,
                    args.limit,
                )?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                Ok(())
            }
        },
        Command::Ranker { command } => match command {
            RankerCommand::Show(args) => {
                let key = RankerKey::new(
                    args.category,
                    args.test,
                    args.browser,
                    ParamSignature::from_params(&args.params),
                );
                let summary = match args.ranker_version {
                    RankerVersionArg::Current => store.ranker_summary(&key)?,
                    RankerVersionArg::Next => store.summary_for(&key, RankerVersion::Next)?,
                };
                println!("{}", serde_json::to_string_pretty(&summary)?);
                Ok(())
            }
        },
        Command::Status => {
            let status = store.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}

fn run_rebuild(
    command: RebuildCommand,
    settings: &Settings,
    store: &mut SqliteRankerStore,
) -> Result<()> {
    let (args, run_to_end) = match command {
        RebuildCommand::Chunk(args) => (args, false),
        RebuildCommand::Run(args) => (args, true),
    };

    let mut limits = settings.limits;
    if let Some(fetch_limit) = args.fetch_limit {
        limits.fetch_limit = fetch_limit;
    }
    if let Some(ranker_limit) = args.ranker_limit {
        limits.ranker_limit = ranker_limit;
    }
    if args.deadline_ms.is_some() {
        limits.chunk_deadline_ms = args.deadline_ms;
    }
    limits.validate()?;

    let cursor = if args.bookmark.is_empty() {
        None
    } else {
        Some(Cursor::decode(&args.bookmark)?)
    };
    let mut progress = RebuildProgress {
        category_index: args.category_index,
        cursor,
        total_results_processed: args.total_results,
        is_done: false,
    };

    let lease = RebuildLease::acquire(store)?;
    let mut rankers_updated = 0_usize;
    loop {
        let report = run_rebuild_chunk(
            store,
            &lease,
            &settings.catalog,
            &PrettyVersionHierarchy,
            &progress,
            &limits,
            &limits.deadline(),
        )
        .map_err(|source| {
            IncompleteRun::new(
                json!(RebuildOutput::new(&progress, limits.fetch_limit, rankers_updated)),
                source,
            )
        })?;
        rankers_updated += report.rankers_updated;
        progress = report.progress;
        if !run_to_end || progress.is_done {
            break;
        }
    }

    let output = RebuildOutput::new(&progress, limits.fetch_limit, rankers_updated);
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn run_publish(
    command: PublishCommand,
    settings: &Settings,
    store: &mut SqliteRankerStore,
) -> Result<()> {
    match command {
        PublishCommand::Chunk(args) => {
            let fetch_limit = args.fetch_limit.unwrap_or(settings.limits.publish_fetch_limit);
            let deadline = args
                .deadline_ms
                .map_or_else(Deadline::none, |ms| Deadline::after(Duration::from_millis(ms)));
            let report = run_publish_chunk(
                store,
                sweep_mode(args.discard),
                fetch_limit,
                args.total,
                &deadline,
            )
            .map_err(|source| {
                IncompleteRun::new(
                    json!(PublishOutput {
                        fetch_limit,
                        is_done: false,
                        total: args.total,
                    }),
                    source,
                )
            })?;
            let output = PublishOutput {
                fetch_limit,
                is_done: report.is_done,
                total: report.total,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        PublishCommand::Run(args) => {
            let fetch_limit = args.fetch_limit.unwrap_or(settings.limits.publish_fetch_limit);
            let mut total = 0;
            loop {
                let report = run_publish_chunk(
                    store,
                    sweep_mode(args.discard),
                    fetch_limit,
                    total,
                    &settings.limits.deadline(),
                )
                .map_err(|source| {
                    IncompleteRun::new(
                        json!(PublishOutput {
                            fetch_limit,
                            is_done: false,
                            total,
                        }),
                        source,
                    )
                })?;
                total = report.total;
                if report.is_done {
                    break;
                }
            }
            let output = PublishOutput {
                fetch_limit,
                is_done: true,
                total,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
    }
}

fn run_results(
    command: ResultsCommand,
    settings: &Settings,
    store: &mut SqliteRankerStore,
) -> Result<()> {
    match command {
        ResultsCommand::Add(args) => {
            let test_set = settings.catalog.test_set(&args.category).ok_or_else(|| {
                RankerError::Validation(format!("unknown category {}", args.category))
            })?;
            let parsed = test_set.parse_results(&args.results)?;
            for score in &parsed {
                let test = test_set.get_test(&score.key)?;
                if !test.contains(score.score) {
                    return Err(RankerError::Validation(format!(
                        "score {} for {} outside [{}, {}]",
                        score.score, score.key, test.min_value, test.max_value
                    ))
                    .into());
                }
            }

            let group = store.insert_group(&MeasurementGroupInput {
                group_id: None,
                category: args.category,
                user_agent_pretty: args.browser,
                params: ParamSignature::from_params(&args.params),
                scores: parsed
                    .into_iter()
                    .map(|score| (score.key, score.score))
                    .collect(),
            })?;

            let payload = json!({
                "group_id": group.group_id.to_string(),
                "category": group.category,
                "user_agent_pretty": group.user_agent_pretty,
                "params": group.params.as_str(),
                "created_at": format_rfc3339(group.created_at)?,
                "scores": group.scores,
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
    }
}

fn sweep_mode(discard: bool) -> SweepMode {
    if discard {
        SweepMode::Discard
    } else {
        SweepMode::Publish
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&body).with_context(|| format!("failed to parse {}", path.display()))
}

/// Renders a failure as `{"code", "message", "retry", "progress"}`.
#[must_use]
pub fn error_envelope(err: &anyhow::Error) -> Value {
    if let Some(incomplete) = err.downcast_ref::<IncompleteRun>() {
        return json!({
            "code": incomplete.source.code(),
            "message": incomplete.source.to_string(),
            "retry": incomplete.source.is_retryable(),
            "progress": incomplete.progress,
        });
    }
    match err.downcast_ref::<RankerError>() {
        Some(source) => json!({
            "code": source.code(),
            "message": source.to_string(),
            "retry": source.is_retryable(),
            "progress": Value::Null,
        }),
        None => json!({
            "code": "ranker.internal",
            "message": format!("{err:#}"),
            "retry": false,
            "progress": Value::Null,
        }),
    }
}

/// Parses args for embedding hosts that build argv themselves.
///
/// # Errors
/// Returns an error when clap rejects the arguments.
pub fn parse_cli<I, T>(args: I) -> Result<Cli>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(args).map_err(|err| anyhow!(err.to_string()))
}
