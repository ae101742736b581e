//! Structured data extraction: LLM output enriched with pattern matches.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use contentsift_llm::{GenerateOptions, TextAnalyzer, parse_json_object};
use contentsift_shared::{QueryContext, StructuredData};

use crate::{Extractor, StageOutcome, clamp_unit, generate, prompts};

pub struct LlmExtractor {
    analyzer: Option<Arc<dyn TextAnalyzer>>,
}

impl LlmExtractor {
    pub fn new(analyzer: Option<Arc<dyn TextAnalyzer>>) -> Self {
        Self { analyzer }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExtractionResponse {
    entities: Vec<Value>,
    key_value_pairs: serde_json::Map<String, Value>,
    categories: Vec<String>,
    confidence_scores: BTreeMap<String, Value>,
}

#[async_trait]
impl Extractor for LlmExtractor {
    async fn extract(&self, text: &str, query: &QueryContext) -> StageOutcome<StructuredData> {
        let prompt = prompts::extraction(text, query);
        let options = GenerateOptions::default().with_system(prompts::SYSTEM);
        let raw = match generate(self.analyzer.as_ref(), "extraction", &prompt, &options).await {
            Ok(raw) => raw,
            Err(reason) => return StageOutcome::Recoverable(reason),
        };

        let Some(response) = parse_json_object::<ExtractionResponse>(&raw) else {
            return StageOutcome::Recoverable("extraction: unparseable response".into());
        };

        let mut data = StructuredData {
            entities: response.entities,
            key_value_pairs: response.key_value_pairs,
            categories: response.categories,
            confidence_scores: response
                .confidence_scores
                .into_iter()
                .map(|(k, v)| (k, clamp_unit(v.as_f64().unwrap_or(0.5))))
                .collect(),
        };
        enrich_with_patterns(&mut data, text);
        StageOutcome::Ok(data)
    }
}

// ---------------------------------------------------------------------------
// Pattern extraction
// ---------------------------------------------------------------------------

struct Pattern {
    key: &'static str,
    confidence: f64,
    re: &'static LazyLock<Regex>,
}

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("valid regex")
});
static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+\d{1,3}[-.\s]?)?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}").expect("valid regex")
});
static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://[-\w.]+(?::\d+)?(?:/[\w/_.-]*(?:\?[\w&=%.-]*)?(?:#[\w.-]*)?)?")
        .expect("valid regex")
});
static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b\d{1,2}[/-]\d{1,2}[/-]\d{2,4}\b|\b\d{4}[/-]\d{1,2}[/-]\d{1,2}\b|\b(?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]* \d{1,2},? \d{4}\b",
    )
    .expect("valid regex")
});
static PRICE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$[\d,]+(?:\.\d{2})?").expect("valid regex"));
static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?%").expect("valid regex"));

static PATTERNS: [Pattern; 6] = [
    Pattern { key: "emails", confidence: 0.99, re: &EMAIL_RE },
    Pattern { key: "phone_numbers", confidence: 0.95, re: &PHONE_RE },
    Pattern { key: "urls", confidence: 0.98, re: &URL_RE },
    Pattern { key: "dates", confidence: 0.9, re: &DATE_RE },
    Pattern { key: "prices", confidence: 0.95, re: &PRICE_RE },
    Pattern { key: "percentages", confidence: 0.95, re: &PERCENT_RE },
];

/// Add deduplicated regex matches under fixed keys with fixed confidences.
fn enrich_with_patterns(data: &mut StructuredData, text: &str) {
    for pattern in &PATTERNS {
        let found: BTreeSet<&str> = pattern.re.find_iter(text).map(|m| m.as_str()).collect();
        if found.is_empty() {
            continue;
        }
        data.key_value_pairs.insert(
            pattern.key.to_string(),
            Value::Array(found.into_iter().map(|s| Value::String(s.into())).collect()),
        );
        data.confidence_scores
            .insert(pattern.key.to_string(), pattern.confidence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixedAnalyzer;

    #[tokio::test]
    async fn merges_model_output_with_patterns() {
        let raw = r#"{"key_value_pairs": {"license": "MIT"},
                      "categories": ["tools"],
                      "confidence_scores": {"license": 1.7}}"#;
        let agent = LlmExtractor::new(Some(FixedAnalyzer::ok(raw)));
        let text = "Contact sales@acme.io. Pro plan costs $20.00, a 15% discount.";

        let data = agent
            .extract(text, &QueryContext::new("pricing", "commerce"))
            .await
            .ok()
            .expect("ok");

        assert_eq!(data.confidence_scores["license"], 1.0);
        assert_eq!(data.key_value_pairs["emails"], serde_json::json!(["sales@acme.io"]));
        assert_eq!(data.key_value_pairs["prices"], serde_json::json!(["$20.00"]));
        assert_eq!(data.key_value_pairs["percentages"], serde_json::json!(["15%"]));
        assert_eq!(data.confidence_scores["emails"], 0.99);
        assert!(!data.key_value_pairs.contains_key("urls"));
    }

    #[test]
    fn pattern_matches_are_deduplicated() {
        let mut data = StructuredData::default();
        enrich_with_patterns(&mut data, "See https://a.dev/x and https://a.dev/x again.");
        assert_eq!(data.key_value_pairs["urls"], serde_json::json!(["https://a.dev/x"]));
    }

    #[test]
    fn finds_written_dates() {
        let mut data = StructuredData::default();
        enrich_with_patterns(&mut data, "Released on March 3, 2024 and 2024-05-01.");
        let dates = data.key_value_pairs["dates"].as_array().expect("array");
        assert_eq!(dates.len(), 2);
    }

    #[tokio::test]
    async fn no_analyzer_is_recoverable() {
        let agent = LlmExtractor::new(None);
        let outcome = agent.extract("text", &QueryContext::new("q", "general")).await;
        assert!(matches!(outcome, StageOutcome::Recoverable(_)));
    }
}
