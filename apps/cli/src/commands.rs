//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use tracing::info;

use rowforge_core::{
    DedupeStore, FsArtifactWriter, ModelFactory, OpenRouterClient, Pipeline, PluginRegistry,
    ProgressReporter, RunReport, StepServices,
};
use rowforge_crawler::PageFetcher;
use rowforge_shared::{
    AppConfig, OutputMode, Row, RowForgeError, RowId, StepConfig, cache_db_path, init_config,
    load_config, load_pipeline, resolve_pipeline,
};
use rowforge_storage::{FETCH_NAMESPACE, KeyValueCache, MODEL_NAMESPACE, Storage};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// rowforge: per-row LLM pipelines.
#[derive(Parser)]
#[command(
    name = "rowforge",
    version,
    about = "Run declarative multi-step LLM pipelines over rows of data.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
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

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run a pipeline over a file of rows.
    Run {
        /// Pipeline definition (TOML or JSON).
        pipeline: PathBuf,

        /// Input rows: a JSON array or JSON lines (.jsonl).
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory (defaults to `defaults.output_dir`).
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Rows in flight at once.
        #[arg(long)]
        tasks: Option<usize>,

        /// Model calls in flight at once.
        #[arg(long)]
        requests: Option<usize>,

        /// Bypass the response and fetch cache.
        #[arg(long)]
        no_cache: bool,
    },

    /// Resolve a pipeline and print its steps without running it.
    Check {
        /// Pipeline definition (TOML or JSON).
        pipeline: PathBuf,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Response and fetch cache management.
    Cache {
        /// Cache subcommand.
        #[command(subcommand)]
        action: CacheAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

/// Cache subcommands.
#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// Show how many entries each namespace holds.
    Stats,
    /// Delete cached entries.
    Clear {
        /// Only clear this namespace (`model` or `fetch`).
        #[arg(long, value_parser = [MODEL_NAMESPACE, FETCH_NAMESPACE])]
        namespace: Option<String>,
    },
}

const CACHE_NAMESPACES: [&str; 2] = [MODEL_NAMESPACE, FETCH_NAMESPACE];

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "rowforge=info",
        1 => "rowforge=debug",
        _ => "rowforge=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

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
        Command::Run {
            pipeline,
            input,
            out,
            tasks,
            requests,
            no_cache,
        } => {
            let options = RunOptions {
                out,
                tasks,
                requests,
                no_cache,
            };
            cmd_run(&pipeline, &input, options).await
        }
        Command::Check { pipeline } => cmd_check(&pipeline).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
        Command::Cache { action } => match action {
            CacheAction::Stats => cmd_cache_stats().await,
            CacheAction::Clear { namespace } => cmd_cache_clear(namespace.as_deref()).await,
        },
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

struct RunOptions {
    out: Option<PathBuf>,
    tasks: Option<usize>,
    requests: Option<usize>,
    no_cache: bool,
}

async fn cmd_run(pipeline_path: &Path, input: &Path, options: RunOptions) -> Result<()> {
    let config = load_config()?;
    let definition = load_pipeline(pipeline_path)?;
    let steps = resolve_pipeline(&definition, &config.defaults)?;
    let rows = load_rows(input)?;

    let out_dir = options
        .out
        .unwrap_or_else(|| PathBuf::from(&config.defaults.output_dir));
    let tasks = options.tasks.unwrap_or(config.concurrency.tasks);
    let requests = options.requests.unwrap_or(config.concurrency.requests);

    let services = build_services(&config, &out_dir, requests, options.no_cache).await?;
    let pipeline = Pipeline::new(steps, Arc::new(services), tasks);

    info!(
        pipeline = %pipeline_path.display(),
        rows = rows.len(),
        steps = pipeline.steps().len(),
        tasks,
        requests,
        "running pipeline"
    );

    let reporter = CliProgress::new();
    let report = pipeline.run(rows, &reporter).await?;

    let rows_path = out_dir.join("rows.json");
    write_rows(&rows_path, &report)?;

    println!();
    println!("  Pipeline finished");
    println!("  Completed: {}", report.completed.len());
    println!("  Dropped:   {}", report.dropped);
    println!("  Failed:    {}", report.failures.len());
    println!("  Rows:      {}", rows_path.display());
    println!("  Time:      {:.1}s", report.elapsed.as_secs_f64());
    for failure in &report.failures {
        println!("    row {} at {}: {}", failure.id, failure.step, failure.error);
    }
    println!();

    if !report.succeeded() {
        return Err(eyre!("{} row(s) failed", report.failures.len()));
    }
    Ok(())
}

async fn build_services(
    config: &AppConfig,
    out_dir: &Path,
    requests: usize,
    no_cache: bool,
) -> Result<StepServices> {
    let provider = Arc::new(OpenRouterClient::from_config(config)?);
    let mut models = ModelFactory::new(provider, requests);
    let mut pages = PageFetcher::new(config.concurrency.pages)?;

    if config.cache.enabled && !no_cache {
        let path = cache_db_path(config)?;
        let storage: Arc<dyn KeyValueCache> = Arc::new(Storage::open(&path).await?);
        info!(path = %path.display(), "response cache enabled");
        models = models.with_cache(storage.clone());
        pages = pages.with_cache(storage);
    }

    Ok(StepServices {
        models,
        pages,
        dedupe: DedupeStore::new(),
        sink: Arc::new(FsArtifactWriter::new(out_dir)),
        registry: PluginRegistry::with_builtins(),
    })
}

async fn cmd_check(pipeline_path: &Path) -> Result<()> {
    let config = load_config()?;
    let definition = load_pipeline(pipeline_path)?;
    let steps = resolve_pipeline(&definition, &config.defaults)?;

    println!();
    println!("  {} step(s) in {}", steps.len(), pipeline_path.display());
    for step in &steps {
        println!("{}", describe_step(step));
    }
    println!();
    Ok(())
}

fn describe_step(step: &StepConfig) -> String {
    let mode = match step.output.mode {
        OutputMode::Merge => "merge".to_string(),
        OutputMode::Column => format!(
            "column:{}",
            step.output.column_name.as_deref().unwrap_or("?")
        ),
        OutputMode::Ignore => "ignore".to_string(),
    };
    let explode = if step.output.explode { " explode" } else { "" };
    let kind = if step.has_prompt() { "generate" } else { "pass-through" };
    let plugins = step
        .plugins
        .iter()
        .map(|p| format!("{}({})", p.id, p.spec.kind()))
        .collect::<Vec<_>>()
        .join(", ");

    let mut line = format!(
        "  [{}] {:<16} {kind:<12} model={} output={mode}{explode} retries={} timeout={}s",
        step.index,
        step.name,
        step.model.model,
        step.max_retries,
        step.timeout.as_secs()
    );
    if step.candidates > 1 {
        line.push_str(&format!(" candidates={}", step.candidates));
    }
    if step.judge.is_some() {
        line.push_str(" judge");
    }
    if let Some(feedback) = &step.feedback {
        line.push_str(&format!(" feedback={}", feedback.loops));
    }
    if step.schema.is_some() {
        line.push_str(" schema");
    }
    if step.verify.is_some() {
        line.push_str(" verify");
    }
    if !plugins.is_empty() {
        line.push_str(&format!(" plugins=[{plugins}]"));
    }
    line
}

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

async fn open_cache() -> Result<(Storage, PathBuf)> {
    let config = load_config()?;
    let path = cache_db_path(&config)?;
    let storage = Storage::open(&path).await?;
    Ok((storage, path))
}

async fn cmd_cache_stats() -> Result<()> {
    let (storage, path) = open_cache().await?;
    println!();
    println!("  Cache: {}", path.display());
    for (namespace, count) in cache_counts(&storage).await? {
        println!("  {namespace:<8} {count} entr{}", if count == 1 { "y" } else { "ies" });
    }
    println!();
    Ok(())
}

async fn cmd_cache_clear(namespace: Option<&str>) -> Result<()> {
    let (storage, path) = open_cache().await?;
    let removed = clear_cache(&storage, namespace).await?;
    info!(path = %path.display(), removed, "cache cleared");
    println!("Removed {removed} cache entr{}", if removed == 1 { "y" } else { "ies" });
    Ok(())
}

async fn cache_counts(storage: &Storage) -> Result<Vec<(&'static str, u64)>> {
    let mut counts = Vec::with_capacity(CACHE_NAMESPACES.len());
    for namespace in CACHE_NAMESPACES {
        counts.push((namespace, storage.entry_count(namespace).await?));
    }
    Ok(counts)
}

/// Clear one namespace, or all of them when `namespace` is `None`.
async fn clear_cache(storage: &Storage, namespace: Option<&str>) -> Result<u64> {
    let mut removed = 0;
    for ns in CACHE_NAMESPACES {
        if namespace.is_none_or(|wanted| wanted == ns) {
            removed += storage.invalidate(ns).await?;
        }
    }
    Ok(removed)
}

// ---------------------------------------------------------------------------
// Row files
// ---------------------------------------------------------------------------

fn load_rows(path: &Path) -> Result<Vec<Row>> {
    let text = std::fs::read_to_string(path).map_err(|e| RowForgeError::io(path, e))?;
    let lines = path.extension().and_then(|e| e.to_str()) == Some("jsonl");
    Ok(parse_rows(&text, lines)?)
}

/// Parse a JSON array (or single value) or JSON lines into rows.
///
/// Non-object values become `{"value": v}`.
fn parse_rows(text: &str, lines: bool) -> std::result::Result<Vec<Row>, RowForgeError> {
    let values: Vec<Value> = if lines {
        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line)
                    .map_err(|e| RowForgeError::parse(format!("line {}: {e}", n + 1)))
            })
            .collect::<std::result::Result<_, _>>()?
    } else {
        match serde_json::from_str(text)
            .map_err(|e| RowForgeError::parse(format!("invalid rows file: {e}")))?
        {
            Value::Array(items) => items,
            other => vec![other],
        }
    };

    Ok(values
        .into_iter()
        .map(|value| match value {
            Value::Object(map) => map,
            other => {
                let mut row = Row::new();
                row.insert("value".into(), other);
                row
            }
        })
        .collect())
}

fn write_rows(path: &Path, report: &RunReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| RowForgeError::io(parent, e))?;
    }
    let rows: Vec<&Row> = report.completed.iter().map(|c| &c.row).collect();
    let json = serde_json::to_string_pretty(&rows)?;
    std::fs::write(path, json).map_err(|e| RowForgeError::io(path, e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self {
            spinner,
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    fn counts(&self) -> String {
        format!(
            "{} done, {} failed",
            self.completed.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed)
        )
    }
}

impl ProgressReporter for CliProgress {
    fn started(&self, rows: usize, steps: usize) {
        self.spinner
            .set_message(format!("Running {rows} row(s) through {steps} step(s)"));
    }

    fn step_finished(&self, row: &RowId, step: &str) {
        self.spinner
            .set_message(format!("[{}] row {row}: {step} finished", self.counts()));
    }

    fn row_completed(&self, _row: &RowId) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    fn row_dropped(&self, row: &RowId) {
        self.spinner
            .set_message(format!("[{}] row {row} dropped", self.counts()));
    }

    fn row_failed(&self, row: &RowId, error: &RowForgeError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.spinner.println(format!("  row {row} failed: {error}"));
    }

    fn done(&self, _report: &RunReport) {
        self.spinner.finish_and_clear();
    }
}
