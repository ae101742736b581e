//! LLM-backed content analysis: themes, quality, credibility, relevance.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use contentsift_llm::{GenerateOptions, TextAnalyzer, parse_json_object};
use contentsift_shared::{AiInsights, QueryContext, TextQuality};

use crate::{Analyzer, StageOutcome, clamp_unit, generate, prompts};

/// [`Analyzer`] that asks a [`TextAnalyzer`] for a JSON analysis.
pub struct LlmAnalyzer {
    analyzer: Option<Arc<dyn TextAnalyzer>>,
}

impl LlmAnalyzer {
    pub fn new(analyzer: Option<Arc<dyn TextAnalyzer>>) -> Self {
        Self { analyzer }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AnalysisResponse {
    themes: Vec<String>,
    quality_metrics: Option<QualityResponse>,
    recommendations: Vec<String>,
    key_entities: Vec<String>,
    categories: Vec<String>,
    information_accuracy: Option<f64>,
    source_reliability: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct QualityResponse {
    #[serde(default = "half")]
    readability: f64,
    #[serde(default = "half")]
    information_density: f64,
    #[serde(default = "half")]
    coherence: f64,
}

fn half() -> f64 {
    0.5
}

#[async_trait]
impl Analyzer for LlmAnalyzer {
    async fn analyze(&self, text: &str, query: &QueryContext) -> StageOutcome<AiInsights> {
        if text.trim().is_empty() {
            return StageOutcome::Fatal("no content to analyze".into());
        }

        let prompt = prompts::analysis(text, query);
        let options = GenerateOptions::default().with_system(prompts::SYSTEM);
        let raw = match generate(self.analyzer.as_ref(), "analysis", &prompt, &options).await {
            Ok(raw) => raw,
            Err(reason) => return StageOutcome::Recoverable(reason),
        };

        let Some(response) = parse_json_object::<AnalysisResponse>(&raw) else {
            return StageOutcome::Recoverable("analysis: unparseable response".into());
        };

        let insights = build_insights(response, query);
        debug!(
            relevance = insights.relevance_score,
            confidence = insights.confidence,
            "analysis complete"
        );
        StageOutcome::Ok(insights)
    }
}

fn build_insights(response: AnalysisResponse, query: &QueryContext) -> AiInsights {
    let filled = [
        !response.themes.is_empty(),
        response.quality_metrics.is_some(),
        !response.recommendations.is_empty(),
        !response.key_entities.is_empty(),
        !response.categories.is_empty(),
        response.information_accuracy.is_some(),
        response.source_reliability.is_some(),
    ];
    let completeness = filled.iter().filter(|f| **f).count() as f64 / filled.len() as f64;

    let quality = response
        .quality_metrics
        .map(|q| TextQuality {
            readability: clamp_unit(q.readability),
            information_density: clamp_unit(q.information_density),
            coherence: clamp_unit(q.coherence),
        })
        .unwrap_or_default();

    let theme_matches = count_theme_matches(&response.themes, query);

    let mut confidence = 0.5 + completeness * 0.2 + quality.mean() * 0.2;
    if theme_matches > 0 {
        confidence += 0.1;
    }

    AiInsights {
        relevance_score: relevance_score(&response.themes, &quality, query),
        themes: response.themes,
        quality,
        recommendations: response.recommendations,
        key_entities: response.key_entities,
        categories: response.categories,
        information_accuracy: clamp_unit(response.information_accuracy.unwrap_or(0.5)),
        source_reliability: clamp_unit(response.source_reliability.unwrap_or(0.5)),
        confidence: clamp_unit(confidence),
    }
}

fn count_theme_matches(themes: &[String], query: &QueryContext) -> usize {
    let terms = query.terms();
    if terms.is_empty() {
        return 0;
    }
    themes
        .iter()
        .filter(|theme| {
            let theme = theme.to_lowercase();
            terms.iter().any(|term| theme.contains(term.as_str()))
        })
        .count()
}

/// 0.5 base, up to +0.3 for themes naming query terms, +0.1 for a theme
/// naming the category, +0.1 scaled by mean quality.
pub(crate) fn relevance_score(themes: &[String], quality: &TextQuality, query: &QueryContext) -> f64 {
    let mut score = 0.5;

    let matches = count_theme_matches(themes, query);
    if matches > 0 {
        score += (matches as f64 * 0.2).min(0.3);
    }

    let category = query.category.to_lowercase();
    if !category.is_empty() && themes.iter().any(|t| t.to_lowercase().contains(&category)) {
        score += 0.1;
    }

    score += quality.mean() * 0.1;
    clamp_unit(score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixedAnalyzer;
    use contentsift_shared::ProviderError;

    fn query() -> QueryContext {
        QueryContext::new("rust async", "technology")
    }

    #[tokio::test]
    async fn parses_analysis_and_scores_relevance() {
        let raw = r#"Here you go:
{"themes": ["Async Rust", "Technology trends"],
 "quality_metrics": {"readability": 0.8, "information_density": 0.7, "coherence": 0.9},
 "recommendations": ["use tokio"], "key_entities": ["Tokio"], "categories": ["programming"],
 "information_accuracy": 0.9, "source_reliability": 0.8}"#;
        let agent = LlmAnalyzer::new(Some(FixedAnalyzer::ok(raw)));

        let insights = agent.analyze("Tokio is an async runtime.", &query()).await.ok().expect("ok");
        assert_eq!(insights.themes.len(), 2);
        assert!((insights.information_accuracy - 0.9).abs() < 1e-9);
        // one theme matches a query term (+0.2), one names the category (+0.1),
        // mean quality 0.8 (+0.08)
        assert!((insights.relevance_score - 0.88).abs() < 1e-9);
        assert!(insights.confidence > 0.9);
    }

    #[tokio::test]
    async fn missing_fields_use_neutral_defaults() {
        let agent = LlmAnalyzer::new(Some(FixedAnalyzer::ok(r#"{"themes": []}"#)));
        let insights = agent.analyze("text", &query()).await.ok().expect("ok");
        assert!((insights.source_reliability - 0.5).abs() < 1e-9);
        assert_eq!(insights.quality, TextQuality::default());
    }

    #[tokio::test]
    async fn provider_failure_is_recoverable() {
        let agent = LlmAnalyzer::new(Some(FixedAnalyzer::err(ProviderError::Quota("429".into()))));
        let outcome = agent.analyze("text", &query()).await;
        assert!(matches!(outcome, StageOutcome::Recoverable(r) if r.contains("quota")));
    }

    #[tokio::test]
    async fn garbage_response_is_recoverable() {
        let agent = LlmAnalyzer::new(Some(FixedAnalyzer::ok("I cannot help with that")));
        assert!(matches!(
            agent.analyze("text", &query()).await,
            StageOutcome::Recoverable(_)
        ));
    }

    #[tokio::test]
    async fn empty_content_is_fatal() {
        let agent = LlmAnalyzer::new(Some(FixedAnalyzer::ok("{}")));
        assert!(matches!(
            agent.analyze("   ", &query()).await,
            StageOutcome::Fatal(_)
        ));
    }
}
