//! Core domain types for content processing and duplicate detection.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Deterministic content identifier: SHA-256 of `"{url}|{title}"`, with
/// `no-title` standing in for a missing title.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    pub fn from_parts(url: &str, title: Option<&str>) -> Self {
        let title = title.filter(|t| !t.is_empty()).unwrap_or("no-title");
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hasher.update(b"|");
        hasher.update(title.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A UUID v7 wrapper identifying one orchestrator run (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// One scraped page. Read-only input; shared by reference during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Raw body text.
    #[serde(alias = "content")]
    pub body: String,
    /// Scraper-declared quality in `0.0..=1.0`.
    #[serde(default, alias = "content_quality_score")]
    pub quality_score: f64,
}

impl ContentItem {
    pub fn new(url: impl Into<String>, title: Option<&str>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.map(String::from),
            body: body.into(),
            quality_score: 0.0,
        }
    }

    pub fn with_quality(mut self, quality_score: f64) -> Self {
        self.quality_score = quality_score;
        self
    }

    pub fn id(&self) -> ContentId {
        ContentId::from_parts(&self.url, self.title.as_deref())
    }
}

/// The query a batch of content was scraped for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryContext {
    pub text: String,
    #[serde(default = "default_category")]
    pub category: String,
}

fn default_category() -> String {
    "general".into()
}

impl QueryContext {
    pub fn new(text: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            category: category.into(),
        }
    }

    /// Lowercased whitespace-separated query terms.
    pub fn terms(&self) -> Vec<String> {
        self.text
            .split_whitespace()
            .map(str::to_lowercase)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Duplicate analysis
// ---------------------------------------------------------------------------

/// How a [`DuplicateAnalysis`] was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    /// Zero or one item; nothing to compare.
    Trivial,
    /// Memory pressure fallback: raw-body hash grouping only.
    HashOnly,
    /// Fingerprints, URLs and AI similarity.
    Full,
    /// Fingerprints and URLs only; no similarity service available.
    PatternOnly,
    /// Detection failed internally; analyses carry the error.
    Failed,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trivial => "trivial",
            Self::HashOnly => "hash_only",
            Self::Full => "full",
            Self::PatternOnly => "pattern_only",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-item outcome of one duplicate detection run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateAnalysis {
    pub content_id: ContentId,
    pub has_duplicates: bool,
    pub confidence: f64,
    /// Co-members of this item's group, self excluded.
    pub duplicate_group: Vec<ContentId>,
    /// Similarity to directly-linked co-members, self excluded.
    pub similarity_scores: BTreeMap<ContentId, f64>,
    pub best_version_id: Option<ContentId>,
    pub method: DetectionMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DuplicateAnalysis {
    /// An item with no duplicates.
    pub fn unique(content_id: ContentId, method: DetectionMethod, confidence: f64) -> Self {
        Self {
            content_id,
            has_duplicates: false,
            confidence,
            duplicate_group: Vec::new(),
            similarity_scores: BTreeMap::new(),
            best_version_id: None,
            method,
            error: None,
        }
    }

    /// Analysis for a run with nothing to compare against.
    pub fn trivial(content_id: ContentId) -> Self {
        Self::unique(content_id, DetectionMethod::Trivial, 1.0)
    }

    /// Fallback analysis when detection failed.
    pub fn failed(content_id: ContentId, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::unique(content_id, DetectionMethod::Failed, 0.0)
        }
    }
}

// ---------------------------------------------------------------------------
// Stage outputs
// ---------------------------------------------------------------------------

/// Paragraph/sentence/word counts of a cleaned text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentStructure {
    pub paragraphs: usize,
    pub sentences: usize,
    pub words: usize,
    pub avg_sentence_length: f64,
    pub reading_time_minutes: f64,
}

/// Heuristic text quality signals, each in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TextQuality {
    pub readability: f64,
    pub information_density: f64,
    pub coherence: f64,
}

impl TextQuality {
    pub fn mean(&self) -> f64 {
        (self.readability + self.information_density + self.coherence) / 3.0
    }
}

impl Default for TextQuality {
    fn default() -> Self {
        Self {
            readability: 0.5,
            information_density: 0.5,
            coherence: 0.5,
        }
    }
}

/// Output of the cleaning stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedContent {
    pub text: String,
    pub structure: ContentStructure,
    pub quality: TextQuality,
    /// Blend of declared quality and [`TextQuality`].
    pub cleaning_quality: f64,
    pub original_length: usize,
}

/// Output of the analysis stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiInsights {
    pub themes: Vec<String>,
    pub relevance_score: f64,
    pub quality: TextQuality,
    pub recommendations: Vec<String>,
    pub key_entities: Vec<String>,
    pub categories: Vec<String>,
    pub information_accuracy: f64,
    pub source_reliability: f64,
    pub confidence: f64,
}

impl AiInsights {
    /// Placeholder used when analysis failed recoverably.
    pub fn placeholder(query: &QueryContext) -> Self {
        Self {
            themes: vec![format!("Content related to {}", query.text)],
            relevance_score: 0.5,
            quality: TextQuality::default(),
            recommendations: vec!["Content analysis unavailable".into()],
            key_entities: Vec::new(),
            categories: vec![query.category.clone()],
            information_accuracy: 0.5,
            source_reliability: 0.5,
            confidence: 0.1,
        }
    }
}

/// Output of the summarization stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentSummary {
    pub executive_summary: String,
    pub key_points: Vec<String>,
    pub detailed_summary: String,
    pub main_topics: Vec<String>,
    pub sentiment: String,
    pub confidence: f64,
    #[serde(default)]
    pub truncated: bool,
}

impl ContentSummary {
    /// Placeholder used when summarization failed recoverably.
    pub fn placeholder(query: &QueryContext) -> Self {
        Self {
            executive_summary: format!("Content related to {}", query.text),
            key_points: vec![format!("Content covers {} topics", query.text)],
            detailed_summary: format!("This content appears to be related to {}.", query.text),
            main_topics: vec![query.text.clone()],
            sentiment: "neutral".into(),
            confidence: 0.3,
            truncated: false,
        }
    }
}

/// Output of the structured extraction stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredData {
    pub entities: Vec<serde_json::Value>,
    pub key_value_pairs: serde_json::Map<String, serde_json::Value>,
    pub categories: Vec<String>,
    /// Per-field extraction confidence.
    pub confidence_scores: BTreeMap<String, f64>,
}

impl StructuredData {
    /// Placeholder used when extraction failed recoverably.
    pub fn placeholder(query: &QueryContext) -> Self {
        let mut key_value_pairs = serde_json::Map::new();
        key_value_pairs.insert("extraction_failed".into(), serde_json::Value::Bool(true));
        Self {
            entities: Vec::new(),
            key_value_pairs,
            categories: vec![query.category.clone()],
            confidence_scores: BTreeMap::from([("extraction_failed".to_string(), 0.1)]),
        }
    }

    /// Mean of the per-field confidences, `None` when there are none.
    pub fn mean_confidence(&self) -> Option<f64> {
        if self.confidence_scores.is_empty() {
            return None;
        }
        let sum: f64 = self.confidence_scores.values().sum();
        Some(sum / self.confidence_scores.len() as f64)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// One successfully processed item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedContent {
    pub original: Arc<ContentItem>,
    pub content_id: ContentId,
    pub cleaned_text: String,
    pub cleaned: Option<CleanedContent>,
    pub insights: Option<AiInsights>,
    pub summary: Option<ContentSummary>,
    pub structured_data: Option<StructuredData>,
    pub duplicate_analysis: Option<DuplicateAnalysis>,
    pub enhanced_quality_score: f64,
    #[serde(with = "duration_secs")]
    pub processing_duration: Duration,
    pub processed_at: DateTime<Utc>,
    /// Recoverable stage failures, in stage order.
    pub errors: Vec<String>,
}

/// Aggregate counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub total_items: usize,
    pub successful: usize,
    pub failed: usize,
    /// Processed but removed by the quality filter.
    pub filtered: usize,
    /// Items that have at least one duplicate.
    pub duplicates_found: usize,
    #[serde(with = "duration_secs")]
    pub wall_time: Duration,
    pub detection_method: Option<DetectionMethod>,
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub run_id: RunId,
    /// Ranked best-first.
    pub processed_contents: Vec<ProcessedContent>,
    pub stats: ProcessingStats,
    pub errors: Vec<String>,
    #[serde(with = "duration_secs")]
    pub total_processing_time: Duration,
    pub query: QueryContext,
}

impl ProcessingResult {
    /// A result with no content and a single error.
    pub fn empty(run_id: RunId, query: QueryContext, error: impl Into<String>) -> Self {
        Self {
            run_id,
            processed_contents: Vec::new(),
            stats: ProcessingStats::default(),
            errors: vec![error.into()],
            total_processing_time: Duration::ZERO,
            query,
        }
    }
}

/// Serialize `Duration` as fractional seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_id_is_deterministic() {
        let a = ContentId::from_parts("https://example.com/a", Some("Title"));
        let b = ContentId::from_parts("https://example.com/a", Some("Title"));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn content_id_missing_title_uses_placeholder() {
        let none = ContentId::from_parts("https://example.com/a", None);
        let empty = ContentId::from_parts("https://example.com/a", Some(""));
        let explicit = ContentId::from_parts("https://example.com/a", Some("no-title"));
        assert_eq!(none, explicit);
        assert_eq!(empty, explicit);
    }

    #[test]
    fn item_deserializes_with_aliases() {
        let json = r#"{"url": "https://x.dev", "content": "body", "content_quality_score": 0.7}"#;
        let item: ContentItem = serde_json::from_str(json).expect("parse");
        assert_eq!(item.body, "body");
        assert!((item.quality_score - 0.7).abs() < f64::EPSILON);
        assert!(item.title.is_none());
    }

    #[test]
    fn failed_analysis_carries_error() {
        let id = ContentId::from_parts("u", None);
        let analysis = DuplicateAnalysis::failed(id.clone(), "boom");
        assert_eq!(analysis.method, DetectionMethod::Failed);
        assert!(!analysis.has_duplicates);
        assert_eq!(analysis.error.as_deref(), Some("boom"));
        assert_eq!(analysis.content_id, id);
    }

    #[test]
    fn placeholders_reference_query() {
        let query = QueryContext::new("rust async", "technology");
        let summary = ContentSummary::placeholder(&query);
        assert_eq!(summary.executive_summary, "Content related to rust async");
        assert!((summary.confidence - 0.3).abs() < f64::EPSILON);

        let data = StructuredData::placeholder(&query);
        assert_eq!(data.mean_confidence(), Some(0.1));
        assert_eq!(data.categories, vec!["technology".to_string()]);

        let insights = AiInsights::placeholder(&query);
        assert!((insights.information_accuracy - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn result_serializes_durations_as_seconds() {
        let result = ProcessingResult::empty(
            RunId::new(),
            QueryContext::new("q", "general"),
            "No content provided for processing",
        );
        let json = serde_json::to_value(&result).expect("serialize");
        assert_eq!(json["total_processing_time"], serde_json::json!(0.0));
        assert_eq!(json["errors"][0], "No content provided for processing");
    }
}
