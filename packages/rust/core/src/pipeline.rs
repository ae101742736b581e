//! Per-item pipeline: clean → analyze → summarize → extract.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, instrument, warn};

use contentsift_shared::{
    AiInsights, ContentItem, ContentSummary, DuplicateAnalysis, ProcessedContent,
    ProcessingConfig, QueryContext, Result, SiftError, StructuredData,
};
use contentsift_stages::{StageAgents, StageOutcome};

/// Runs the enabled stages for one item.
#[derive(Clone)]
pub struct ItemPipeline {
    agents: StageAgents,
    config: Arc<ProcessingConfig>,
}

/// Run one stage under the per-call timeout.
async fn bounded<T>(
    stage: &str,
    limit: Duration,
    call: impl Future<Output = StageOutcome<T>>,
) -> Result<StageOutcome<T>> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| SiftError::timeout(stage, limit.as_secs()))
}

impl ItemPipeline {
    pub fn new(agents: StageAgents, config: Arc<ProcessingConfig>) -> Self {
        Self { agents, config }
    }

    /// Process one item.
    ///
    /// Errors drop the item from the run: a stage timing out, or analysis
    /// reporting [`StageOutcome::Fatal`]. Any other stage failure is replaced
    /// by a placeholder and recorded in [`ProcessedContent::errors`].
    #[instrument(skip_all, fields(url = %item.url))]
    pub async fn process(
        &self,
        item: Arc<ContentItem>,
        query: &QueryContext,
        duplicate_analysis: Option<DuplicateAnalysis>,
    ) -> Result<ProcessedContent> {
        let started = Instant::now();
        let settings = self.config.settings();
        let limit = self.config.ai_call_timeout();
        let content_id = item.id();
        let mut errors = Vec::new();

        let mut cleaned = None;
        let mut cleaned_text = item.body.clone();
        if settings.enable_content_cleaning {
            match bounded("content cleaning", limit, self.agents.cleaner.clean(&item)).await? {
                StageOutcome::Ok(content) => {
                    cleaned_text = content.text.clone();
                    cleaned = Some(content);
                }
                StageOutcome::Recoverable(reason) | StageOutcome::Fatal(reason) => {
                    warn!(%reason, "cleaning failed, using raw body");
                    errors.push(reason);
                }
            }
        }

        let mut insights = None;
        if settings.enable_ai_analysis {
            let call = self.agents.analyzer.analyze(&cleaned_text, query);
            insights = Some(match bounded("content analysis", limit, call).await? {
                StageOutcome::Ok(insights) => insights,
                StageOutcome::Recoverable(reason) => {
                    errors.push(reason);
                    AiInsights::placeholder(query)
                }
                StageOutcome::Fatal(reason) => {
                    return Err(SiftError::ItemFatal {
                        content_id: content_id.to_string(),
                        reason,
                    });
                }
            });
        }

        let mut summary = None;
        if settings.enable_summarization {
            let call = self.agents.summarizer.summarize(
                &cleaned_text,
                query,
                settings.max_summary_length,
            );
            summary = Some(match bounded("summarization", limit, call).await? {
                StageOutcome::Ok(summary) => summary,
                StageOutcome::Recoverable(reason) | StageOutcome::Fatal(reason) => {
                    errors.push(reason);
                    ContentSummary::placeholder(query)
                }
            });
        }

        let mut structured_data = None;
        if settings.enable_structured_extraction {
            let call = self.agents.extractor.extract(&cleaned_text, query);
            structured_data = Some(match bounded("structured extraction", limit, call).await? {
                StageOutcome::Ok(data) => data,
                StageOutcome::Recoverable(reason) | StageOutcome::Fatal(reason) => {
                    errors.push(reason);
                    StructuredData::placeholder(query)
                }
            });
        }

        let enhanced_quality_score = enhanced_quality(
            item.quality_score,
            cleaned.as_ref().map(|c| c.cleaning_quality),
            insights.as_ref(),
            summary.as_ref(),
            structured_data.as_ref(),
        );
        debug!(
            score = enhanced_quality_score,
            recoverable = errors.len(),
            "item processed"
        );

        Ok(ProcessedContent {
            original: item,
            content_id,
            cleaned_text,
            cleaned,
            insights,
            summary,
            structured_data,
            duplicate_analysis,
            enhanced_quality_score,
            processing_duration: started.elapsed(),
            processed_at: Utc::now(),
            errors,
        })
    }
}

/// Declared quality plus weighted stage signals, clamped to `0.0..=1.0`.
pub fn enhanced_quality(
    declared: f64,
    cleaning_quality: Option<f64>,
    insights: Option<&AiInsights>,
    summary: Option<&ContentSummary>,
    structured: Option<&StructuredData>,
) -> f64 {
    let mut score = declared;
    if let Some(cleaning) = cleaning_quality {
        score += cleaning * 0.2;
    }
    if let Some(insights) = insights {
        score += (insights.information_accuracy + insights.source_reliability) * 0.15;
    }
    if let Some(summary) = summary {
        score += summary.confidence * 0.1;
    }
    if let Some(mean) = structured.and_then(StructuredData::mean_confidence) {
        score += mean * 0.1;
    }
    if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) }
}
