//! Application configuration for ContentSift.
//!
//! User config lives at `~/.contentsift/contentsift.toml`.
//! CLI flags override config file values, which override defaults.
//!
//! [`ProcessingSettings`] is the raw, serde-facing shape of the `[processing]`
//! section. [`ProcessingConfig`] is the validated form every run is bound to;
//! it can only be obtained through [`ProcessingConfig::new`], which fails fast
//! instead of coercing out-of-range values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SiftError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "contentsift.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".contentsift";

// ---------------------------------------------------------------------------
// Config structs (matching contentsift.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Processing pipeline settings.
    #[serde(default)]
    pub processing: ProcessingSettings,

    /// OpenRouter settings.
    #[serde(default)]
    pub openrouter: OpenRouterConfig,
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used for analysis, summarization, extraction and similarity.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Base URL of the chat-completions API.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            default_model: default_model(),
            endpoint: default_endpoint(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "google/gemini-2.0-flash-001".into()
}
fn default_endpoint() -> String {
    "https://openrouter.ai/api/v1".into()
}

/// `[processing]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingSettings {
    /// Budget for a whole run, in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Retry budget for failed operations.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Number of workers draining the per-run queue.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_true")]
    pub enable_content_cleaning: bool,
    #[serde(default = "default_true")]
    pub enable_ai_analysis: bool,
    #[serde(default = "default_true")]
    pub enable_summarization: bool,
    #[serde(default = "default_true")]
    pub enable_structured_extraction: bool,
    #[serde(default = "default_true")]
    pub enable_duplicate_detection: bool,

    /// Minimum AI similarity score for two items to count as near-duplicates.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    /// Results scoring below this are filtered out at finalization.
    #[serde(default = "default_min_quality")]
    pub min_content_quality_score: f64,

    #[serde(default = "default_max_summary_length")]
    pub max_summary_length: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Budget for one item's whole pipeline, in seconds.
    #[serde(default = "default_content_processing_timeout")]
    pub content_processing_timeout: u64,

    /// Budget for a single text-generation call, in seconds.
    #[serde(default = "default_ai_call_timeout")]
    pub ai_call_timeout: u64,

    #[serde(default = "default_max_concurrent_ai_analyses")]
    pub max_concurrent_ai_analyses: usize,

    /// Characters per side sent to the similarity prompt.
    #[serde(default = "default_max_similarity_content_length")]
    pub max_similarity_content_length: usize,

    #[serde(default = "default_max_similarity_content_pairs")]
    pub max_similarity_content_pairs: usize,

    #[serde(default = "default_max_similarity_batch_size")]
    pub max_similarity_batch_size: usize,

    /// Process memory budget; the pressure gate trips at 1.8x this value.
    #[serde(default = "default_memory_threshold_mb")]
    pub memory_threshold_mb: u64,

    #[serde(default = "default_memory_cooldown_seconds")]
    pub memory_cooldown_seconds: u64,

    /// Unprocessed items probed when growing a near-duplicate group.
    #[serde(default = "default_similarity_search_limit")]
    pub similarity_search_limit: usize,

    #[serde(default = "default_fingerprint_chunk_size")]
    pub fingerprint_chunk_size: usize,

    /// Wait before retrying a similarity batch while under memory pressure.
    #[serde(default = "default_memory_backoff_ms")]
    pub memory_backoff_ms: u64,

    #[serde(default = "default_reclaim_every_batches")]
    pub reclaim_every_batches: usize,

    #[serde(default = "default_reclaim_interval_seconds")]
    pub reclaim_interval_seconds: u64,

    /// How long an idle worker waits on an empty queue before exiting.
    #[serde(default = "default_worker_poll_timeout_ms")]
    pub worker_poll_timeout_ms: u64,

    /// Grace period for workers after cancellation, before they are aborted.
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            max_retries: default_max_retries(),
            concurrency: default_concurrency(),
            enable_content_cleaning: true,
            enable_ai_analysis: true,
            enable_summarization: true,
            enable_structured_extraction: true,
            enable_duplicate_detection: true,
            similarity_threshold: default_similarity_threshold(),
            min_content_quality_score: default_min_quality(),
            max_summary_length: default_max_summary_length(),
            batch_size: default_batch_size(),
            content_processing_timeout: default_content_processing_timeout(),
            ai_call_timeout: default_ai_call_timeout(),
            max_concurrent_ai_analyses: default_max_concurrent_ai_analyses(),
            max_similarity_content_length: default_max_similarity_content_length(),
            max_similarity_content_pairs: default_max_similarity_content_pairs(),
            max_similarity_batch_size: default_max_similarity_batch_size(),
            memory_threshold_mb: default_memory_threshold_mb(),
            memory_cooldown_seconds: default_memory_cooldown_seconds(),
            similarity_search_limit: default_similarity_search_limit(),
            fingerprint_chunk_size: default_fingerprint_chunk_size(),
            memory_backoff_ms: default_memory_backoff_ms(),
            reclaim_every_batches: default_reclaim_every_batches(),
            reclaim_interval_seconds: default_reclaim_interval_seconds(),
            worker_poll_timeout_ms: default_worker_poll_timeout_ms(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_timeout_seconds() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    2
}
fn default_concurrency() -> usize {
    3
}
fn default_similarity_threshold() -> f64 {
    0.8
}
fn default_min_quality() -> f64 {
    0.4
}
fn default_max_summary_length() -> usize {
    500
}
fn default_batch_size() -> usize {
    10
}
fn default_content_processing_timeout() -> u64 {
    30
}
fn default_ai_call_timeout() -> u64 {
    15
}
fn default_max_concurrent_ai_analyses() -> usize {
    3
}
fn default_max_similarity_content_length() -> usize {
    1000
}
fn default_max_similarity_content_pairs() -> usize {
    50
}
fn default_max_similarity_batch_size() -> usize {
    10
}
fn default_memory_threshold_mb() -> u64 {
    512
}
fn default_memory_cooldown_seconds() -> u64 {
    30
}
fn default_similarity_search_limit() -> usize {
    20
}
fn default_fingerprint_chunk_size() -> usize {
    50
}
fn default_memory_backoff_ms() -> u64 {
    2000
}
fn default_reclaim_every_batches() -> usize {
    10
}
fn default_reclaim_interval_seconds() -> u64 {
    30
}
fn default_worker_poll_timeout_ms() -> u64 {
    1000
}
fn default_shutdown_grace_seconds() -> u64 {
    5
}

// ---------------------------------------------------------------------------
// Validated processing config
// ---------------------------------------------------------------------------

/// Limits derived from concurrency and the memory budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedLimits {
    /// Hard ceiling for `max_concurrent_ai_analyses`.
    pub max_ai_concurrency: usize,
    /// Soft ceiling for `batch_size`.
    pub recommended_batch_size: usize,
    /// Soft ceiling for `max_similarity_content_pairs`.
    pub recommended_similarity_pairs: usize,
    /// Soft ceiling for `concurrency`.
    pub recommended_concurrency: usize,
}

impl DerivedLimits {
    fn from_settings(s: &ProcessingSettings) -> Self {
        let mem = s.memory_threshold_mb as usize;
        Self {
            // Floor of one so the smallest memory budget still admits a caller.
            max_ai_concurrency: (s.concurrency * 3).min(mem / 150).min(15).max(1),
            recommended_batch_size: (mem / 25).min(s.concurrency * 3).min(30),
            recommended_similarity_pairs: (mem / 8).min(s.batch_size * 2).min(100),
            recommended_concurrency: (s.timeout_seconds as usize / 15).min(mem / 100),
        }
    }
}

/// Validated processing configuration. Immutable once built.
#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    settings: ProcessingSettings,
    limits: DerivedLimits,
    warnings: Vec<String>,
}

impl ProcessingConfig {
    /// Validate `settings` and bind them into a config.
    ///
    /// Field ranges, stage enablement, timeout nesting and the AI concurrency
    /// ceiling are hard errors. Exceeding a recommended bound only records a
    /// warning (also logged).
    pub fn new(settings: ProcessingSettings) -> Result<Self> {
        check_ranges(&settings)?;

        let s = &settings;
        let enabled = [
            s.enable_content_cleaning,
            s.enable_ai_analysis,
            s.enable_summarization,
            s.enable_structured_extraction,
            s.enable_duplicate_detection,
        ];
        if !enabled.iter().any(|on| *on) {
            return Err(SiftError::config(
                "at least one processing stage must be enabled",
            ));
        }

        if s.content_processing_timeout >= s.timeout_seconds {
            return Err(SiftError::config(format!(
                "content_processing_timeout ({}s) must be less than timeout_seconds ({}s)",
                s.content_processing_timeout, s.timeout_seconds
            )));
        }
        if s.ai_call_timeout >= s.content_processing_timeout {
            return Err(SiftError::config(format!(
                "ai_call_timeout ({}s) must be less than content_processing_timeout ({}s)",
                s.ai_call_timeout, s.content_processing_timeout
            )));
        }

        let limits = DerivedLimits::from_settings(s);
        if s.max_concurrent_ai_analyses > limits.max_ai_concurrency {
            return Err(SiftError::config(format!(
                "max_concurrent_ai_analyses ({}) exceeds the allowed limit ({}) for concurrency={} and memory={}MB",
                s.max_concurrent_ai_analyses,
                limits.max_ai_concurrency,
                s.concurrency,
                s.memory_threshold_mb
            )));
        }

        let mut warnings = Vec::new();
        if s.concurrency > limits.recommended_concurrency {
            warnings.push(format!(
                "concurrency ({}) exceeds recommended limit ({}) for timeout={}s and memory={}MB",
                s.concurrency, limits.recommended_concurrency, s.timeout_seconds, s.memory_threshold_mb
            ));
        }
        if s.batch_size > limits.recommended_batch_size {
            warnings.push(format!(
                "batch_size ({}) exceeds recommended limit ({})",
                s.batch_size, limits.recommended_batch_size
            ));
        }
        if s.max_similarity_content_pairs > limits.recommended_similarity_pairs {
            warnings.push(format!(
                "max_similarity_content_pairs ({}) exceeds recommended limit ({})",
                s.max_similarity_content_pairs, limits.recommended_similarity_pairs
            ));
        }
        if s.max_similarity_content_length > 3000 {
            warnings.push(format!(
                "max_similarity_content_length ({}) is high; 2000-3000 characters keeps similarity prompts fast",
                s.max_similarity_content_length
            ));
        }
        for warning in &warnings {
            tracing::warn!(%warning, "processing config");
        }

        Ok(Self {
            settings,
            limits,
            warnings,
        })
    }

    /// Raw validated values.
    pub fn settings(&self) -> &ProcessingSettings {
        &self.settings
    }

    pub fn limits(&self) -> DerivedLimits {
        self.limits
    }

    /// Recommended-bound violations found during validation.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.timeout_seconds)
    }

    /// Budget for duplicate detection: half the run, so workers always get
    /// the rest.
    pub fn detection_timeout(&self) -> Duration {
        self.run_timeout() / 2
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.content_processing_timeout)
    }

    pub fn ai_call_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.ai_call_timeout)
    }

    pub fn memory_cooldown(&self) -> Duration {
        Duration::from_secs(self.settings.memory_cooldown_seconds)
    }

    pub fn memory_backoff(&self) -> Duration {
        Duration::from_millis(self.settings.memory_backoff_ms)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.settings.reclaim_interval_seconds)
    }

    pub fn worker_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.worker_poll_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.settings.shutdown_grace_seconds)
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        let settings = ProcessingSettings::default();
        let limits = DerivedLimits::from_settings(&settings);
        Self {
            settings,
            limits,
            warnings: Vec::new(),
        }
    }
}

impl TryFrom<ProcessingSettings> for ProcessingConfig {
    type Error = SiftError;

    fn try_from(settings: ProcessingSettings) -> Result<Self> {
        Self::new(settings)
    }
}

impl TryFrom<&AppConfig> for ProcessingConfig {
    type Error = SiftError;

    fn try_from(config: &AppConfig) -> Result<Self> {
        Self::new(config.processing.clone())
    }
}

fn check_ranges(s: &ProcessingSettings) -> Result<()> {
    fn in_range<T: PartialOrd + std::fmt::Display>(name: &str, v: T, lo: T, hi: T) -> Result<()> {
        if v < lo || v > hi {
            return Err(SiftError::config(format!(
                "{name} must be between {lo} and {hi}, got {v}"
            )));
        }
        Ok(())
    }

    in_range("timeout_seconds", s.timeout_seconds, 10, 300)?;
    in_range("max_retries", s.max_retries, 0, 5)?;
    in_range("concurrency", s.concurrency, 1, 10)?;
    in_range("similarity_threshold", s.similarity_threshold, 0.5, 0.95)?;
    in_range("min_content_quality_score", s.min_content_quality_score, 0.0, 1.0)?;
    in_range("max_summary_length", s.max_summary_length, 100, 2000)?;
    in_range("batch_size", s.batch_size, 1, 50)?;
    in_range("content_processing_timeout", s.content_processing_timeout, 5, 120)?;
    in_range("ai_call_timeout", s.ai_call_timeout, 1, 60)?;
    in_range("max_concurrent_ai_analyses", s.max_concurrent_ai_analyses, 1, 20)?;
    in_range("max_similarity_content_length", s.max_similarity_content_length, 100, 5000)?;
    in_range("max_similarity_content_pairs", s.max_similarity_content_pairs, 10, 200)?;
    in_range("max_similarity_batch_size", s.max_similarity_batch_size, 2, 50)?;
    in_range("memory_threshold_mb", s.memory_threshold_mb, 128, 2048)?;
    in_range("similarity_search_limit", s.similarity_search_limit, 1, 200)?;
    in_range("fingerprint_chunk_size", s.fingerprint_chunk_size, 1, 1000)?;
    in_range("reclaim_every_batches", s.reclaim_every_batches, 1, 1000)?;
    in_range("worker_poll_timeout_ms", s.worker_poll_timeout_ms, 10, 60_000)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.contentsift/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| SiftError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.contentsift/contentsift.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| SiftError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| SiftError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| SiftError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| SiftError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| SiftError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the OpenRouter API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.openrouter.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(SiftError::config(format!(
            "OpenRouter API key not found. Set the {var_name} environment variable.\n\
             Get a key at https://openrouter.ai/keys"
        ))),
    }
}
