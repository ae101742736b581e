//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use contentsift_core::{Orchestrator, ProgressReporter};
use contentsift_dedup::{AiSimilarity, DuplicateDetector, SimilarityService};
use contentsift_llm::{OpenRouterAnalyzer, RetryingAnalyzer, TextAnalyzer};
use contentsift_shared::{
    AppConfig, ContentItem, ProcessingConfig, ProcessingResult, QueryContext, SiftError,
    init_config, load_config, validate_api_key,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// ContentSift: find duplicates in scraped content and enrich what is left.
#[derive(Parser)]
#[command(
    name = "contentsift",
    version,
    about = "Detect duplicate scraped content and enrich it with AI analysis.",
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
    /// Detect duplicates and run every item through the processing stages.
    Process {
        /// JSON file holding an array of scraped items.
        #[arg(short, long)]
        input: PathBuf,

        /// Query the content was scraped for.
        #[arg(short, long, default_value = "")]
        query: String,

        /// Query category.
        #[arg(short, long, default_value = "general")]
        category: String,

        /// Write the result here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Override the configured worker count.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Skip the AI backend; AI stages use placeholders.
        #[arg(long)]
        no_ai: bool,
    },

    /// Only run duplicate detection and print the analyses.
    Dedupe {
        /// JSON file holding an array of scraped items.
        #[arg(short, long)]
        input: PathBuf,

        /// Compare bodies with the AI backend, not just fingerprints.
        #[arg(long)]
        ai: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration and derived limits.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "contentsift=info",
        1 => "contentsift=debug",
        _ => "contentsift=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    // Logs go to stderr so JSON results on stdout stay parseable.
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
        Command::Process {
            input,
            query,
            category,
            output,
            concurrency,
            no_ai,
        } => {
            let query = QueryContext::new(query, category);
            cmd_process(&input, query, output.as_deref(), concurrency, no_ai).await
        }
        Command::Dedupe { input, ai } => cmd_dedupe(&input, ai).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_items(path: &Path) -> Result<Vec<ContentItem>> {
    let raw = std::fs::read_to_string(path).map_err(|e| SiftError::io(path, e))?;
    let items: Vec<ContentItem> = serde_json::from_str(&raw)
        .map_err(|e| SiftError::parse(format!("{}: {e}", path.display())))?;
    info!(path = %path.display(), items = items.len(), "loaded items");
    Ok(items)
}

/// Build the OpenRouter backend, or `None` when AI is off or no key is set.
fn build_analyzer(config: &AppConfig, enabled: bool) -> Result<Option<Arc<dyn TextAnalyzer>>> {
    if !enabled {
        return Ok(None);
    }
    match validate_api_key(config) {
        Ok(key) => {
            let analyzer = OpenRouterAnalyzer::new(&config.openrouter, key)?;
            info!(model = analyzer.model(), "using OpenRouter backend");
            let analyzer: Arc<dyn TextAnalyzer> = Arc::new(analyzer);
            Ok(Some(RetryingAnalyzer::wrap(
                analyzer,
                config.processing.max_retries,
            )))
        }
        Err(e) => {
            warn!(error = %e, "no AI backend; continuing with placeholders");
            Ok(None)
        }
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_process(
    input: &Path,
    query: QueryContext,
    output: Option<&Path>,
    concurrency: Option<usize>,
    no_ai: bool,
) -> Result<()> {
    let mut app_config = load_config()?;
    if let Some(concurrency) = concurrency {
        app_config.processing.concurrency = concurrency;
    }
    let config = ProcessingConfig::try_from(&app_config)?;
    let analyzer = build_analyzer(&app_config, !no_ai)?;
    let items = read_items(input)?;

    let progress = Arc::new(CliProgress::new());
    let orchestrator = Orchestrator::from_analyzer(config, analyzer).with_progress(progress);
    let result = orchestrator.run(items, query).await;

    let json = serde_json::to_string_pretty(&result)?;
    match output {
        Some(path) => {
            std::fs::write(path, json).map_err(|e| SiftError::io(path, e))?;
            print_summary(&result);
            println!("  Output: {}", path.display());
            println!();
        }
        None => println!("{json}"),
    }

    if result.processed_contents.is_empty() {
        return Err(eyre!(
            "no content survived processing: {}",
            result.errors.join("; ")
        ));
    }
    Ok(())
}

fn print_summary(result: &ProcessingResult) {
    let stats = &result.stats;
    println!();
    println!("  Run:        {}", result.run_id);
    println!("  Processed:  {}/{}", stats.successful, stats.total_items);
    println!("  Filtered:   {}", stats.filtered);
    println!("  Duplicates: {}", stats.duplicates_found);
    if let Some(method) = stats.detection_method {
        println!("  Detection:  {method}");
    }
    println!("  Errors:     {}", result.errors.len());
    println!("  Time:       {:.1}s", result.total_processing_time.as_secs_f64());
}

async fn cmd_dedupe(input: &Path, ai: bool) -> Result<()> {
    let app_config = load_config()?;
    let config = ProcessingConfig::try_from(&app_config)?;
    let similarity = build_analyzer(&app_config, ai)?
        .map(|analyzer| Arc::new(AiSimilarity::new(analyzer)) as Arc<dyn SimilarityService>);
    let items: Vec<Arc<ContentItem>> = read_items(input)?.into_iter().map(Arc::new).collect();

    let detector = DuplicateDetector::new(&config, similarity);
    let limit = config.run_timeout();
    let analyses = tokio::time::timeout(limit, detector.detect(&items))
        .await
        .map_err(|_| SiftError::timeout("duplicate detection", limit.as_secs()))?;

    println!("{}", serde_json::to_string_pretty(&analyses)?);
    Ok(())
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

    let processing = ProcessingConfig::try_from(&config)
        .wrap_err("processing settings are invalid")?;
    let limits = processing.limits();
    println!("# derived limits");
    println!("# max_ai_concurrency = {}", limits.max_ai_concurrency);
    println!("# recommended_concurrency = {}", limits.recommended_concurrency);
    println!("# recommended_batch_size = {}", limits.recommended_batch_size);
    println!("# recommended_similarity_pairs = {}", limits.recommended_similarity_pairs);
    for warning in processing.warnings() {
        println!("# warning: {warning}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .expect("valid template")
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn item_finished(&self, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Processing content [{current}/{total}]"));
    }

    fn done(&self, _result: &ProcessingResult) {
        self.spinner.finish_and_clear();
    }
}
