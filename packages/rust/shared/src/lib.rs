//! Shared types, error model, and configuration for ContentSift.
//!
//! This crate is the foundation depended on by all other ContentSift crates.
//! It provides:
//! - [`SiftError`] and [`ProviderError`], the error model
//! - Domain types ([`ContentItem`], [`DuplicateAnalysis`], [`ProcessingResult`], ...)
//! - Configuration ([`AppConfig`], [`ProcessingConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DerivedLimits, OpenRouterConfig, ProcessingConfig, ProcessingSettings, config_dir,
    config_file_path, init_config, load_config, load_config_from, validate_api_key,
};
pub use error::{ProviderError, Result, SiftError, panic_message};
pub use types::{
    AiInsights, CleanedContent, ContentId, ContentItem, ContentStructure, ContentSummary,
    DetectionMethod, DuplicateAnalysis, ProcessedContent, ProcessingResult, ProcessingStats,
    QueryContext, RunId, StructuredData, TextQuality,
};
