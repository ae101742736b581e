//! Prompt builders for the AI stages.

use contentsift_shared::QueryContext;

use crate::truncate_chars;

/// Content sent to a stage prompt is capped at this many characters.
const MAX_PROMPT_CONTENT: usize = 8000;

pub(crate) const SYSTEM: &str =
    "You analyze web content. Respond with a single JSON object and nothing else.";

pub(crate) fn analysis(text: &str, query: &QueryContext) -> String {
    format!(
        r#"Analyze the content below for a user researching "{query}" (category: {category}).

Return JSON with these fields:
- "themes": list of key themes
- "quality_metrics": {{"readability": 0-1, "information_density": 0-1, "coherence": 0-1}}
- "recommendations": list of actionable takeaways
- "key_entities": list of important named entities
- "categories": list of topical tags
- "information_accuracy": 0-1
- "source_reliability": 0-1

CONTENT:
{content}"#,
        query = query.text,
        category = query.category,
        content = truncate_chars(text, MAX_PROMPT_CONTENT),
    )
}

pub(crate) fn summary(text: &str, query: &QueryContext, max_length: usize) -> String {
    format!(
        r#"Summarize the content below for a user researching "{query}".

Return JSON with these fields:
- "executive_summary": one or two sentences
- "key_points": list of short takeaways
- "detailed_summary": a paragraph of at most {max_length} characters
- "main_topics": list of topics
- "sentiment": "positive", "negative" or "neutral"

CONTENT:
{content}"#,
        query = query.text,
        content = truncate_chars(text, MAX_PROMPT_CONTENT),
    )
}

pub(crate) fn extraction(text: &str, query: &QueryContext) -> String {
    format!(
        r#"Extract structured information relevant to "{query}" (category: {category}) from the content below.

Return JSON with these fields:
- "entities": list of {{"type": ..., "name": ..., "properties": {{...}}}}
- "key_value_pairs": object of facts such as prices, dates or versions
- "categories": list of tags
- "confidence_scores": object mapping each key in key_value_pairs to 0-1

CONTENT:
{content}"#,
        query = query.text,
        category = query.category,
        content = truncate_chars(text, MAX_PROMPT_CONTENT),
    )
}
