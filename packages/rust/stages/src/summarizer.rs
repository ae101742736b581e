//! LLM-backed summarization.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use contentsift_llm::{GenerateOptions, TextAnalyzer, parse_json_object};
use contentsift_shared::{ContentSummary, QueryContext};

use crate::{StageOutcome, Summarizer, clamp_unit, generate, prompts, truncate_chars};

pub struct LlmSummarizer {
    analyzer: Option<Arc<dyn TextAnalyzer>>,
}

impl LlmSummarizer {
    pub fn new(analyzer: Option<Arc<dyn TextAnalyzer>>) -> Self {
        Self { analyzer }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SummaryResponse {
    executive_summary: String,
    key_points: Vec<String>,
    detailed_summary: String,
    main_topics: Vec<String>,
    sentiment: Option<String>,
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(
        &self,
        text: &str,
        query: &QueryContext,
        max_length: usize,
    ) -> StageOutcome<ContentSummary> {
        let prompt = prompts::summary(text, query, max_length);
        let options = GenerateOptions::default().with_system(prompts::SYSTEM);
        let raw = match generate(self.analyzer.as_ref(), "summarization", &prompt, &options).await {
            Ok(raw) => raw,
            Err(reason) => return StageOutcome::Recoverable(reason),
        };

        match parse_json_object::<SummaryResponse>(&raw) {
            Some(response) if !response.executive_summary.trim().is_empty() => {
                StageOutcome::Ok(build_summary(response, max_length))
            }
            _ => StageOutcome::Recoverable("summarization: unparseable response".into()),
        }
    }
}

fn build_summary(response: SummaryResponse, max_length: usize) -> ContentSummary {
    let filled = [
        !response.executive_summary.is_empty(),
        !response.key_points.is_empty(),
        !response.detailed_summary.is_empty(),
        !response.main_topics.is_empty(),
        response.sentiment.is_some(),
    ];
    let completeness = filled.iter().filter(|f| **f).count() as f64 / filled.len() as f64;

    let mut confidence = 0.5 + completeness * 0.2;
    let detail_len = response.detailed_summary.chars().count();
    if detail_len > 50 {
        confidence += 0.1;
    }
    if detail_len > 100 {
        confidence += 0.1;
    }
    confidence += (response.key_points.len() as f64 * 0.05).min(0.2);
    let mut confidence = clamp_unit(confidence);

    let mut detailed_summary = response.detailed_summary;
    let mut truncated = false;
    if detail_len > max_length {
        let keep = max_length.saturating_sub(3);
        detailed_summary = format!("{}...", truncate_chars(&detailed_summary, keep));
        confidence = (confidence * 0.8).max(0.1);
        truncated = true;
    }

    ContentSummary {
        executive_summary: response.executive_summary,
        key_points: response.key_points,
        detailed_summary,
        main_topics: response.main_topics,
        sentiment: response.sentiment.unwrap_or_else(|| "neutral".into()),
        confidence,
        truncated,
    }
}
