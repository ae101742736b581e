//! Per-item processing stages: clean, analyze, summarize, extract.
//!
//! Each stage is a trait so the orchestrator can be driven by test doubles
//! or alternative backends. Stages never return `Err`; they report a
//! [`StageOutcome`] and the caller decides between placeholder and drop.

mod analyzer;
mod cleaner;
mod extractor;
mod prompts;
mod summarizer;

use std::sync::Arc;

use async_trait::async_trait;

use contentsift_llm::TextAnalyzer;
use contentsift_shared::{
    AiInsights, CleanedContent, ContentItem, ContentSummary, QueryContext, StructuredData,
};

pub use analyzer::LlmAnalyzer;
pub use cleaner::{CleanerOptions, TextCleaner};
pub use extractor::LlmExtractor;
pub use summarizer::LlmSummarizer;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of one stage for one item.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome<T> {
    Ok(T),
    /// The stage failed; the pipeline substitutes a placeholder and continues.
    Recoverable(String),
    /// The item cannot be processed any further.
    Fatal(String),
}

impl<T> StageOutcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Self::Ok(v) => Some(v),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StageOutcome<U> {
        match self {
            Self::Ok(v) => StageOutcome::Ok(f(v)),
            Self::Recoverable(reason) => StageOutcome::Recoverable(reason),
            Self::Fatal(reason) => StageOutcome::Fatal(reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Cleaner: Send + Sync {
    async fn clean(&self, item: &ContentItem) -> StageOutcome<CleanedContent>;
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, text: &str, query: &QueryContext) -> StageOutcome<AiInsights>;
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// `max_length` bounds the detailed summary, in characters.
    async fn summarize(
        &self,
        text: &str,
        query: &QueryContext,
        max_length: usize,
    ) -> StageOutcome<ContentSummary>;
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, text: &str, query: &QueryContext) -> StageOutcome<StructuredData>;
}

/// The four stage agents a pipeline runs.
#[derive(Clone)]
pub struct StageAgents {
    pub cleaner: Arc<dyn Cleaner>,
    pub analyzer: Arc<dyn Analyzer>,
    pub summarizer: Arc<dyn Summarizer>,
    pub extractor: Arc<dyn Extractor>,
}

impl StageAgents {
    /// Default agents: rule-based cleaning plus LLM-backed AI stages.
    ///
    /// With no `analyzer`, every AI stage reports a recoverable failure and
    /// the pipeline falls back to placeholders.
    pub fn new(analyzer: Option<Arc<dyn TextAnalyzer>>) -> Self {
        Self {
            cleaner: Arc::new(TextCleaner::default()),
            analyzer: Arc::new(LlmAnalyzer::new(analyzer.clone())),
            summarizer: Arc::new(LlmSummarizer::new(analyzer.clone())),
            extractor: Arc::new(LlmExtractor::new(analyzer)),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

/// Call the analyzer if one is configured, mapping every failure to a reason.
pub(crate) async fn generate(
    analyzer: Option<&Arc<dyn TextAnalyzer>>,
    stage: &str,
    prompt: &str,
    options: &contentsift_llm::GenerateOptions,
) -> Result<String, String> {
    let Some(analyzer) = analyzer else {
        return Err(format!("{stage}: no text analyzer configured"));
    };
    analyzer.generate(prompt, options).await.map_err(|e| {
        tracing::warn!(stage, backend = analyzer.name(), error = %e, "stage call failed");
        format!("{stage}: {e}")
    })
}

/// Char-boundary-safe prefix of at most `max_chars` characters.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use async_trait::async_trait;

    use contentsift_llm::{GenerateOptions, TextAnalyzer};
    use contentsift_shared::ProviderError;

    /// Returns the same response to every prompt.
    pub(crate) struct FixedAnalyzer(Result<String, ProviderError>);

    impl FixedAnalyzer {
        pub(crate) fn ok(text: &str) -> Arc<dyn TextAnalyzer> {
            Arc::new(Self(Ok(text.to_string())))
        }

        pub(crate) fn err(error: ProviderError) -> Arc<dyn TextAnalyzer> {
            Arc::new(Self(Err(error)))
        }
    }

    #[async_trait]
    impl TextAnalyzer for FixedAnalyzer {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn generate(
            &self,
            _prompt: &str,
            _options: &GenerateOptions,
        ) -> Result<String, ProviderError> {
            self.0.clone()
        }
    }
}
