//! Per-item content fingerprints and URL canonicalization.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use url::Url;

use contentsift_shared::{ContentId, ContentItem};

use crate::memory::MemoryGate;

/// Query parameters that never change the identity of a page.
const TRACKING_PARAMS: &[&str] = &[
    "ref", "source", "fbclid", "gclid", "msclkid", "mc_cid", "mc_eid", "affiliate", "partner",
    "campaign", "tracking", "click", "redirect",
];

/// Hashes and shape of one item, valid for one detection run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentFingerprint {
    pub content_id: ContentId,
    /// Hash of the normalized body.
    pub text_hash: String,
    /// Hash of the normalized title.
    pub title_hash: String,
    /// Hash of the canonical URL.
    pub url_hash: String,
    pub byte_length: usize,
    pub word_count: usize,
    /// Hash of the `p{paragraphs}_s{sentences}_w{words}` signature.
    pub structure_hash: String,
}

impl ContentFingerprint {
    /// Same normalized body and title.
    pub fn is_exact_match(&self, other: &Self) -> bool {
        self.text_hash == other.text_hash && self.title_hash == other.title_hash
    }

    /// Lengths within 20% and word counts within 25%, or identical structure.
    pub fn has_similar_characteristics(&self, other: &Self) -> bool {
        let length_close = within(self.byte_length, other.byte_length, 0.20);
        let words_close = within(self.word_count, other.word_count, 0.25);
        (length_close && words_close) || self.structure_hash == other.structure_hash
    }
}

fn within(a: usize, b: usize, ratio: f64) -> bool {
    let larger = a.max(b) as f64;
    (a.abs_diff(b) as f64) <= larger * ratio
}

pub(crate) fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Lowercase, collapse whitespace, drop punctuation, trim.
pub fn normalize_text(text: &str) -> String {
    static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));
    static PUNCT_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[^\w\s]").expect("valid regex"));

    let lower = text.to_lowercase();
    let collapsed = WS_RE.replace_all(&lower, " ");
    PUNCT_RE.replace_all(&collapsed, "").trim().to_string()
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

/// Scheme-less, lowercase URL without `www.`, tracking parameters, fragment
/// or trailing slash. Two URLs naming the same page map to the same string.
pub fn canonical_url(raw: &str) -> String {
    let raw = raw.trim();
    match Url::parse(raw) {
        Ok(url) if url.has_host() => canonical_from_parsed(&url),
        _ => canonical_fallback(raw),
    }
}

fn canonical_from_parsed(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);

    let mut out = host.to_string();
    if let Some(port) = url.port() {
        out.push_str(&format!(":{port}"));
    }
    out.push_str(url.path().to_lowercase().trim_end_matches('/'));

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.to_lowercase(), v.to_lowercase()))
        .collect();
    if !kept.is_empty() {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(kept)
            .finish();
        out.push('?');
        out.push_str(&query);
    }
    out
}

/// String-level canonicalization for inputs `url` cannot parse.
fn canonical_fallback(raw: &str) -> String {
    static SCHEME_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9+.-]*://").expect("valid regex"));

    let lower = raw.to_lowercase();
    let no_scheme = SCHEME_RE.replace(&lower, "");
    let no_www = no_scheme.strip_prefix("www.").unwrap_or(&no_scheme);
    let no_fragment = no_www.split('#').next().unwrap_or_default();

    let (base, query) = match no_fragment.split_once('?') {
        Some((base, query)) => (base, query),
        None => (no_fragment, ""),
    };
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| !is_tracking_param(pair.split('=').next().unwrap_or_default()))
        .collect();

    let mut out = base.trim_end_matches('/').to_string();
    if !kept.is_empty() {
        out.push('?');
        out.push_str(&kept.join("&"));
    }
    out
}

fn structure_signature(body: &str) -> String {
    let paragraphs = body.split("\n\n").filter(|p| !p.trim().is_empty()).count();
    let sentences = body.split('.').filter(|s| !s.trim().is_empty()).count();
    let words = body.split_whitespace().count();
    format!("p{paragraphs}_s{sentences}_w{words}")
}

// ---------------------------------------------------------------------------
// Fingerprinter
// ---------------------------------------------------------------------------

/// Computes fingerprints in memory-aware chunks.
pub struct Fingerprinter {
    gate: Arc<MemoryGate>,
    chunk_size: usize,
}

impl Fingerprinter {
    pub fn new(gate: Arc<MemoryGate>, chunk_size: usize) -> Self {
        Self {
            gate,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn generate(item: &ContentItem) -> ContentFingerprint {
        ContentFingerprint {
            content_id: item.id(),
            text_hash: sha256_hex(&normalize_text(&item.body)),
            title_hash: sha256_hex(&normalize_text(item.title.as_deref().unwrap_or_default())),
            url_hash: sha256_hex(&canonical_url(&item.url)),
            byte_length: item.body.len(),
            word_count: item.body.split_whitespace().count(),
            structure_hash: sha256_hex(&structure_signature(&item.body)),
        }
    }

    /// Fingerprint `items` chunk by chunk, yielding between chunks.
    ///
    /// If the memory gate opens between chunks, the fingerprints computed so
    /// far are returned and the rest are skipped.
    pub async fn generate_batch(
        &self,
        items: &[Arc<ContentItem>],
    ) -> HashMap<ContentId, ContentFingerprint> {
        let mut fingerprints = HashMap::with_capacity(items.len());

        for (n, chunk) in items.chunks(self.chunk_size).enumerate() {
            if n > 0 && self.gate.check() {
                warn!(
                    done = fingerprints.len(),
                    total = items.len(),
                    "memory pressure, stopping fingerprinting early"
                );
                break;
            }
            for item in chunk {
                let fingerprint = Self::generate(item);
                fingerprints.insert(fingerprint.content_id.clone(), fingerprint);
            }
            tokio::task::yield_now().await;
        }

        debug!(fingerprints = fingerprints.len(), "fingerprinting complete");
        fingerprints
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::memory::testing::FakeMemory;

    #[test]
    fn normalizes_case_space_and_punctuation() {
        assert_eq!(normalize_text("  Hello,\n\tWORLD!  "), "hello world");
    }

    #[test]
    fn canonical_url_strips_noise() {
        assert_eq!(
            canonical_url("https://www.Example.com/Docs/?utm_source=x&id=3&fbclid=abc#intro"),
            "example.com/docs?id=3"
        );
        assert_eq!(
            canonical_url("http://example.com/a/"),
            canonical_url("https://example.com/a")
        );
    }

    #[test]
    fn canonical_url_keeps_ports() {
        assert_eq!(canonical_url("http://localhost:8080/x"), "localhost:8080/x");
    }

    #[test]
    fn canonical_url_falls_back_for_unparseable_input() {
        assert_eq!(
            canonical_url("www.example.com/page/?ref=home&q=1#top"),
            "example.com/page?q=1"
        );
    }

    #[test]
    fn exact_match_ignores_formatting() {
        let a = Fingerprinter::generate(&ContentItem::new("u1", Some("Title"), "Rust is fast."));
        let b = Fingerprinter::generate(&ContentItem::new("u2", Some("title!"), "rust   is FAST"));
        assert!(a.is_exact_match(&b));
        assert_ne!(a.url_hash, b.url_hash);
    }

    #[test]
    fn characteristic_similarity() {
        let a = Fingerprinter::generate(&ContentItem::new("a", None, "one two three four five"));
        let b = Fingerprinter::generate(&ContentItem::new("b", None, "six seven eight nine ten"));
        let c = Fingerprinter::generate(&ContentItem::new(
            "c",
            None,
            "a much longer body.\n\nwith two paragraphs and many more words in it",
        ));
        assert!(a.has_similar_characteristics(&b));
        assert!(!a.has_similar_characteristics(&c));
    }

    #[tokio::test]
    async fn batch_stops_early_under_pressure() {
        let memory = Arc::new(FakeMemory::new(10.0, 4096.0));
        let gate = Arc::new(MemoryGate::new(100, Duration::from_secs(30), memory));
        let items: Vec<Arc<ContentItem>> = (0..5)
            .map(|i| Arc::new(ContentItem::new(format!("https://x.dev/{i}"), None, "body")))
            .collect();

        let fingerprinter = Fingerprinter::new(gate.clone(), 2);
        assert_eq!(fingerprinter.generate_batch(&items).await.len(), 5);

        gate.trip();
        assert_eq!(fingerprinter.generate_batch(&items).await.len(), 2);
    }
}
