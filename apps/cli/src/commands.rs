//! CLI command definitions, routing, and tracing setup.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Report, Result, WrapErr, eyre};
use studydeck_core::{BridgeService, Estimator, Orchestrator, TaskRegistry};
use studydeck_extract::{PageSnapshot, SourceMode};
use studydeck_shared::{
    AppConfig, ContentFingerprint, FlashcardSet, OperationType, ReportResult, ReportSource,
    StudyDeckError, SummaryFormat, SummaryLength, SummaryOptions, SummaryResult, SummaryType,
    TaskResult, init_config, load_config, resolve_db_path,
};
use studydeck_storage::Storage;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::progress::CliProgress;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// StudyDeck: turn web pages into summaries, flashcards, and reports.
#[derive(Parser)]
#[command(
    name = "studydeck",
    version,
    about = "Turn saved web pages into summaries, flashcards, and cited reports using an on-device model.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Where the content comes from.
#[derive(clap::Args)]
pub(crate) struct InputArgs {
    /// Saved HTML page to read.
    page: PathBuf,

    /// File holding the user's text selection; preferred over the page when long enough.
    #[arg(long)]
    selection: Option<PathBuf>,

    /// Ignore any selection and extract from the whole page.
    #[arg(long)]
    whole_page: bool,

    /// Skip the result cache.
    #[arg(long)]
    no_cache: bool,

    /// Print the result as JSON.
    #[arg(long)]
    json: bool,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Summarize a page or selection.
    Summarize {
        #[command(flatten)]
        input: InputArgs,

        /// Summary style: key-points, tldr, teaser, or headline.
        #[arg(long = "type", default_value = "key-points")]
        kind: SummaryType,

        /// Summary length: short, medium, or long.
        #[arg(long, default_value = "medium")]
        length: SummaryLength,

        /// Output format: markdown or plain-text.
        #[arg(long, default_value = "markdown")]
        format: SummaryFormat,

        /// Output language tag (e.g. en, es).
        #[arg(long)]
        language: Option<String>,
    },

    /// Generate multiple-choice flashcards.
    Flashcards {
        #[command(flatten)]
        input: InputArgs,

        /// Number of flashcards (defaults to pipeline.default_flashcard_count).
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Synthesize a cited report from several sources.
    Report {
        /// JSON file holding an array of {title, url, text} sources.
        sources: PathBuf,

        /// Skip the result cache.
        #[arg(long)]
        no_cache: bool,

        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Predict how long an operation will take.
    Estimate {
        /// Operation: summarize, flashcards, or report.
        operation: OperationType,

        /// Chunks (or report sources) to process.
        #[arg(short, long, default_value = "1")]
        units: u32,
    },

    /// Timing history management.
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },

    /// Result cache management.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum HistoryAction {
    /// Drop timing records past the configured age and per-operation cap.
    Prune,
}

#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// Remove every cached result.
    Clear,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "studydeck=info",
        1 => "studydeck=debug",
        _ => "studydeck=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    // Logs go to stderr so results on stdout stay pipeable.
    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Summarize {
            input,
            kind,
            length,
            format,
            language,
        } => {
            let options = SummaryOptions {
                kind,
                length,
                format,
                language,
            };
            cmd_summarize(&input, &options).await
        }
        Command::Flashcards { input, count } => cmd_flashcards(&input, count).await,
        Command::Report {
            sources,
            no_cache,
            json,
        } => cmd_report(&sources, no_cache, json).await,
        Command::Estimate { operation, units } => cmd_estimate(operation, units).await,
        Command::History { action } => match action {
            HistoryAction::Prune => cmd_history_prune().await,
        },
        Command::Cache { action } => match action {
            CacheAction::Clear => cmd_cache_clear().await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Session: storage, service, registry, orchestrator
// ---------------------------------------------------------------------------

struct Session {
    storage: Arc<Storage>,
    service: Arc<BridgeService>,
    orchestrator: Orchestrator,
    sweeper: JoinHandle<()>,
}

impl Session {
    async fn open() -> Result<Self> {
        let config = load_config()?;
        let storage = Arc::new(open_storage(&config).await?);

        let registry = Arc::new(TaskRegistry::from_config(&config));
        let history = storage.load_timings().await?;
        debug!(records = history.len(), "loaded timing history");
        registry.load_history(history);
        registry.prune_history(Utc::now());
        let sweeper = registry.spawn_sweeper(Duration::from_secs(
            config.registry.sweep_interval_secs.max(1),
        ));

        let service = Arc::new(
            BridgeService::spawn(&config.service)
                .await
                .map_err(user_report)?,
        );
        let orchestrator = Orchestrator::new(service.clone(), registry, &config)
            .with_storage(storage.clone());

        Ok(Self {
            storage,
            service,
            orchestrator,
            sweeper,
        })
    }

    async fn close(self) {
        self.sweeper.abort();
        if let Err(e) = self.service.shutdown().await {
            warn!(error = %e, "generation service did not shut down cleanly");
        }
    }

    /// Run `op`, cancelling every active task on Ctrl-C.
    async fn interruptible<T>(
        &self,
        op: impl Future<Output = studydeck_shared::Result<T>>,
    ) -> studydeck_shared::Result<T> {
        tokio::pin!(op);
        tokio::select! {
            outcome = &mut op => outcome,
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted; cancelling active tasks");
                let registry = self.orchestrator.registry();
                for task in registry.active_tasks() {
                    registry.cancel(&task.id);
                }
                op.await
            }
        }
    }

    async fn cached(&self, key: &str, fingerprint: &ContentFingerprint) -> Option<TaskResult> {
        match self.storage.get_cached_result(key, fingerprint.as_str()).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(error = %e, key, "result cache lookup failed");
                None
            }
        }
    }

    async fn store(&self, key: &str, fingerprint: &ContentFingerprint, result: TaskResult) {
        if let Err(e) = self
            .storage
            .put_cached_result(key, fingerprint.as_str(), &result)
            .await
        {
            warn!(error = %e, key, "failed to cache result");
        }
    }
}

async fn open_storage(config: &AppConfig) -> Result<Storage> {
    let path = resolve_db_path(config)?;
    Storage::open(&path)
        .await
        .wrap_err_with(|| format!("failed to open database at {}", path.display()))
}

/// Attach the end-user explanation to a library error.
fn user_report(e: StudyDeckError) -> Report {
    let message = e.user_message();
    Report::new(e).wrap_err(message)
}

/// Finish a pipeline run: a cancellation is reported, not raised.
fn settle<T>(outcome: studydeck_shared::Result<T>) -> Result<Option<T>> {
    match outcome {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_cancelled() => {
            eprintln!("{}", e.user_message());
            Ok(None)
        }
        Err(e) => Err(user_report(e)),
    }
}

fn read_snapshot(input: &InputArgs) -> Result<(PageSnapshot, SourceMode)> {
    let html = read_file(&input.page)?;
    let mut snapshot = PageSnapshot::from_html(html);
    if let Some(path) = &input.selection {
        snapshot = snapshot.with_selection(read_file(path)?);
    }
    let mode = if input.whole_page || snapshot.selection.is_none() {
        SourceMode::Page
    } else {
        SourceMode::Selection
    };
    Ok((snapshot, mode))
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).wrap_err_with(|| format!("cannot read {}", path.display()))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Study operations
// ---------------------------------------------------------------------------

async fn cmd_summarize(input: &InputArgs, options: &SummaryOptions) -> Result<()> {
    let (snapshot, mode) = read_snapshot(input)?;
    let session = Session::open().await?;
    let outcome = summarize(&session, &snapshot, mode, input, options).await;
    session.close().await;
    outcome
}

async fn summarize(
    session: &Session,
    snapshot: &PageSnapshot,
    mode: SourceMode,
    input: &InputArgs,
    options: &SummaryOptions,
) -> Result<()> {
    let progress = CliProgress::new();
    let prepared = session
        .orchestrator
        .prepare(snapshot, mode, &progress)
        .map_err(user_report)?;
    let key = format!("{}:{}", OperationType::Summarize, options.cache_key());

    if !input.no_cache {
        if let Some(TaskResult::Summary(hit)) = session.cached(&key, &prepared.fingerprint).await {
            progress.finish();
            info!(key, "using cached summary");
            return show_summary(&hit, input.json);
        }
    }

    info!(
        chars = prepared.extraction.char_count,
        chunks = prepared.chunks.len(),
        kind = %options.kind,
        "summarizing"
    );
    let outcome = session
        .interruptible(
            session
                .orchestrator
                .summarize_prepared(&prepared, options, &progress),
        )
        .await;
    progress.finish();

    let Some(result) = settle(outcome)? else {
        return Ok(());
    };
    session
        .store(&key, &prepared.fingerprint, result.clone().into())
        .await;
    show_summary(&result, input.json)
}

fn show_summary(result: &SummaryResult, json: bool) -> Result<()> {
    if json {
        return print_json(result);
    }
    println!("{}", result.text);
    Ok(())
}

async fn cmd_flashcards(input: &InputArgs, count: Option<usize>) -> Result<()> {
    let (snapshot, mode) = read_snapshot(input)?;
    let session = Session::open().await?;
    let outcome = flashcards(&session, &snapshot, mode, input, count).await;
    session.close().await;
    outcome
}

async fn flashcards(
    session: &Session,
    snapshot: &PageSnapshot,
    mode: SourceMode,
    input: &InputArgs,
    count: Option<usize>,
) -> Result<()> {
    let count = match count {
        Some(n) => n,
        None => load_config()?.pipeline.default_flashcard_count,
    };
    if count == 0 {
        return Err(eyre!("flashcard count must be at least 1"));
    }

    let progress = CliProgress::new();
    let prepared = session
        .orchestrator
        .prepare(snapshot, mode, &progress)
        .map_err(user_report)?;
    let key = format!("{}:{count}", OperationType::Flashcards);

    if !input.no_cache {
        if let Some(TaskResult::Flashcards(hit)) =
            session.cached(&key, &prepared.fingerprint).await
        {
            progress.finish();
            info!(key, "using cached flashcards");
            return show_flashcards(&hit, input.json);
        }
    }

    info!(count, chunks = prepared.chunks.len(), "generating flashcards");
    let outcome = session
        .interruptible(
            session
                .orchestrator
                .generate_flashcards_prepared(&prepared, count, &progress),
        )
        .await;
    progress.finish();

    let Some(set) = settle(outcome)? else {
        return Ok(());
    };
    session
        .store(&key, &prepared.fingerprint, set.clone().into())
        .await;
    show_flashcards(&set, input.json)
}

fn show_flashcards(set: &FlashcardSet, json: bool) -> Result<()> {
    if json {
        return print_json(set);
    }
    for (i, card) in set.cards.iter().enumerate() {
        println!("{}. {}", i + 1, card.question);
        for (letter, option) in ('A'..='D').zip(&card.options) {
            println!("   {letter}) {option}");
        }
        if let Some(letter) = ('A'..='D').nth(card.correct_index) {
            println!("   Answer: {letter}");
        }
        if !card.explanation.is_empty() {
            println!("   {}", card.explanation);
        }
        println!();
    }
    Ok(())
}

async fn cmd_report(sources_path: &Path, no_cache: bool, json: bool) -> Result<()> {
    let raw = read_file(sources_path)?;
    let sources: Vec<ReportSource> = serde_json::from_str(&raw)
        .wrap_err_with(|| format!("{} is not a JSON array of sources", sources_path.display()))?;

    let session = Session::open().await?;
    let outcome = report(&session, &sources, no_cache, json).await;
    session.close().await;
    outcome
}

async fn report(
    session: &Session,
    sources: &[ReportSource],
    no_cache: bool,
    json: bool,
) -> Result<()> {
    let fingerprint = studydeck_core::report_fingerprint(sources);
    let key = OperationType::Report.to_string();

    if !no_cache {
        if let Some(TaskResult::Report(hit)) = session.cached(&key, &fingerprint).await {
            info!("using cached report");
            return show_report(&hit, json);
        }
    }

    info!(sources = sources.len(), "synthesizing report");
    let progress = CliProgress::new();
    let outcome = session
        .interruptible(session.orchestrator.synthesize_report(sources, &progress))
        .await;
    progress.finish();

    let Some(result) = settle(outcome)? else {
        return Ok(());
    };
    session.store(&key, &fingerprint, result.clone().into()).await;
    show_report(&result, json)
}

fn show_report(result: &ReportResult, json: bool) -> Result<()> {
    if json {
        return print_json(result);
    }
    println!("{}", result.text);
    Ok(())
}

// ---------------------------------------------------------------------------
// History, cache, estimate
// ---------------------------------------------------------------------------

async fn cmd_estimate(operation: OperationType, units: u32) -> Result<()> {
    let config = load_config()?;
    let mut estimator = Estimator::new(config.estimator.clone());

    let path = resolve_db_path(&config)?;
    if path.exists() {
        let storage = Storage::open_readonly(&path).await?;
        estimator.load(storage.load_timings().await?);
        estimator.prune(Utc::now());
    } else {
        debug!(?path, "no database yet; using baselines");
    }

    let secs = estimator.estimate(operation, units);
    println!(
        "{operation} of {units} unit(s): about {secs:.1}s ({} recorded run(s))",
        estimator.history_len(operation)
    );
    Ok(())
}

async fn cmd_history_prune() -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let removed = storage
        .prune_timings(config.estimator.max_age_days, config.estimator.history_cap)
        .await?;
    info!(removed, "timing history pruned");
    println!("Removed {removed} timing record(s).");
    Ok(())
}

async fn cmd_cache_clear() -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let removed = storage.clear_result_cache().await?;
    println!("Removed {removed} cached result(s).");
    Ok(())
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
