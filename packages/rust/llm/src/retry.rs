//! Retry wrapper for transient backend failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use contentsift_shared::ProviderError;

use crate::{GenerateOptions, TextAnalyzer};

const DEFAULT_BACKOFF: Duration = Duration::from_millis(250);

/// Retries quota and network failures with linear backoff.
///
/// Authentication and unknown failures are returned immediately.
pub struct RetryingAnalyzer {
    inner: Arc<dyn TextAnalyzer>,
    max_retries: u32,
    backoff: Duration,
}

impl RetryingAnalyzer {
    pub fn new(inner: Arc<dyn TextAnalyzer>, max_retries: u32) -> Self {
        Self {
            inner,
            max_retries,
            backoff: DEFAULT_BACKOFF,
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Wrap `inner` unless no retries are configured.
    pub fn wrap(inner: Arc<dyn TextAnalyzer>, max_retries: u32) -> Arc<dyn TextAnalyzer> {
        if max_retries == 0 {
            inner
        } else {
            Arc::new(Self::new(inner, max_retries))
        }
    }
}

#[async_trait]
impl TextAnalyzer for RetryingAnalyzer {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String, ProviderError> {
        let max_attempts = self.max_retries + 1;
        let mut attempt = 1;
        loop {
            match self.inner.generate(prompt, options).await {
                Ok(text) => {
                    if attempt > 1 {
                        debug!(backend = self.inner.name(), attempt, "succeeded after retry");
                    }
                    return Ok(text);
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    warn!(
                        backend = self.inner.name(),
                        attempt,
                        max_attempts,
                        error = %e,
                        "transient backend failure, retrying"
                    );
                    tokio::time::sleep(self.backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
