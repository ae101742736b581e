//! Pulling a JSON object out of free-form model output.

use serde::de::DeserializeOwned;

/// Slice from the first `{` to the last `}` of `text`, if both exist in order.
///
/// Models frequently wrap JSON in prose or code fences; this is the only
/// recovery attempted.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Extract and deserialize the JSON object embedded in `text`.
pub fn parse_json_object<T: DeserializeOwned>(text: &str) -> Option<T> {
    let raw = extract_json_object(text)?;
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(error = %e, "model output held no parseable JSON object");
            None
        }
    }
}
