//! Text-generation capability used by the AI stages and similarity scoring.
//!
//! Everything above this crate talks to a [`TextAnalyzer`]; the concrete
//! transport ([`OpenRouterAnalyzer`]) is injected at construction time.

mod json;
mod openrouter;
mod retry;

use async_trait::async_trait;

use contentsift_shared::ProviderError;

pub use json::{extract_json_object, parse_json_object};
pub use openrouter::OpenRouterAnalyzer;
pub use retry::RetryingAnalyzer;

/// Sampling options for one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Optional system message sent before the prompt.
    pub system: Option<String>,
}

impl GenerateOptions {
    /// Low-temperature, short-output settings for scoring prompts.
    pub fn precise() -> Self {
        Self {
            temperature: 0.1,
            max_output_tokens: 500,
            system: None,
        }
    }

    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_output_tokens: 1024,
            system: None,
        }
    }
}

/// A backend that turns a prompt into text.
///
/// Implementations must be cheap to share (`Arc<dyn TextAnalyzer>`) and safe
/// to call concurrently; callers bound concurrency and time themselves.
#[async_trait]
pub trait TextAnalyzer: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String, ProviderError>;
}
