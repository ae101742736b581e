//! Rule-based text cleaning and heuristic quality metrics.
//!
//! Each cleaning pass is a function `&str -> String` applied in sequence.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use contentsift_shared::{CleanedContent, ContentItem, ContentStructure, TextQuality};

use crate::{Cleaner, StageOutcome, clamp_unit};

/// Words that end with a period without ending a sentence.
const ABBREVIATIONS: &[&str] = &[
    "dr", "mr", "mrs", "ms", "prof", "sr", "jr", "inc", "ltd", "corp", "co", "usa", "uk", "ca",
    "ny", "la", "sf", "dc", "etc", "vs", "st", "ave", "blvd", "rd", "apt", "ste", "no", "vol",
    "pp", "ed", "rev", "gen", "adm", "capt", "lt", "sgt", "maj", "col", "cmdr", "gov", "sen",
    "rep",
];

/// Toggles for the optional cleaning passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanerOptions {
    pub remove_square_brackets: bool,
    pub remove_curly_brackets: bool,
    pub remove_html_tags: bool,
    pub remove_duplicate_sentences: bool,
}

impl Default for CleanerOptions {
    fn default() -> Self {
        Self {
            remove_square_brackets: true,
            remove_curly_brackets: true,
            remove_html_tags: true,
            remove_duplicate_sentences: true,
        }
    }
}

/// Regex-driven [`Cleaner`].
#[derive(Debug, Clone, Default)]
pub struct TextCleaner {
    options: CleanerOptions,
}

impl TextCleaner {
    pub fn new(options: CleanerOptions) -> Self {
        Self { options }
    }

    /// Run every enabled pass over `raw`.
    pub fn clean_text(&self, raw: &str) -> String {
        if raw.is_empty() {
            return String::new();
        }

        let mut text = normalize_whitespace(raw);
        text = strip_boilerplate(&text);

        if self.options.remove_square_brackets {
            text = strip_pattern(&SQUARE_RE, &text);
        }
        if self.options.remove_curly_brackets {
            text = strip_pattern(&CURLY_RE, &text);
        }
        if self.options.remove_html_tags {
            text = strip_pattern(&TAG_RE, &text);
        }
        text = collapse_spaces(&text);
        if self.options.remove_duplicate_sentences {
            text = dedupe_sentences(&text);
        }

        normalize_quotes(&text).trim().to_string()
    }

    fn build(&self, item: &ContentItem) -> CleanedContent {
        let text = self.clean_text(&item.body);
        let structure = analyze_structure(&text);
        let quality = quality_metrics(&text);
        let weighted =
            quality.readability * 0.3 + quality.information_density * 0.4 + quality.coherence * 0.3;
        let cleaning_quality = round3(clamp_unit(item.quality_score * 0.7 + weighted * 0.3));

        CleanedContent {
            text,
            structure,
            quality,
            cleaning_quality,
            original_length: item.body.chars().count(),
        }
    }
}

#[async_trait]
impl Cleaner for TextCleaner {
    async fn clean(&self, item: &ContentItem) -> StageOutcome<CleanedContent> {
        let cleaned = self.build(item);
        if cleaned.text.is_empty() && !item.body.trim().is_empty() {
            return StageOutcome::Recoverable("cleaning removed all content".into());
        }
        StageOutcome::Ok(cleaned)
    }
}

// ---------------------------------------------------------------------------
// Passes
// ---------------------------------------------------------------------------

static SQUARE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[.*?\]").expect("valid regex"));
static CURLY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{.*?\}").expect("valid regex"));
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<.*?>").expect("valid regex"));

static SPACES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]+").expect("valid regex"));

/// Unix newlines, single spaces, at most one blank line between paragraphs.
fn normalize_whitespace(text: &str) -> String {
    static BLANKS_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n\s*\n\s*\n+").expect("valid regex"));

    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let text = collapse_spaces(&text);
    BLANKS_RE.replace_all(&text, "\n\n").into_owned()
}

fn collapse_spaces(text: &str) -> String {
    SPACES_RE.replace_all(text, " ").into_owned()
}

fn strip_boilerplate(text: &str) -> String {
    static BOILERPLATE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"(?i)cookie policy|privacy policy|terms of service|© \d{4}.*?\.|all rights reserved|powered by.*?\.",
        )
        .expect("valid regex")
    });

    BOILERPLATE_RE.replace_all(text, "").into_owned()
}

fn strip_pattern(re: &Regex, text: &str) -> String {
    re.replace_all(text, "").into_owned()
}

/// Drop repeated sentences document-wide, keeping paragraph breaks.
fn dedupe_sentences(text: &str) -> String {
    let mut seen = HashSet::new();
    let mut paragraphs = Vec::new();

    for paragraph in text.split("\n\n") {
        let kept: Vec<String> = split_sentences(paragraph)
            .into_iter()
            .filter(|s| seen.insert(s.clone()))
            .collect();
        if !kept.is_empty() {
            paragraphs.push(kept.join(" "));
        }
    }

    paragraphs.join("\n\n")
}

/// Split on `.`, `!` or `?` followed by whitespace and an uppercase letter,
/// unless the terminating word is a known abbreviation.
fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < chars.len() {
        let (idx, c) = chars[i];
        if matches!(c, '.' | '!' | '?') {
            let mut j = i + 1;
            while j < chars.len() && chars[j].1.is_whitespace() {
                j += 1;
            }
            let boundary = j > i + 1
                && j < chars.len()
                && chars[j].1.is_uppercase()
                && !(c == '.' && ends_with_abbreviation(&text[start..idx]));
            if boundary {
                push_trimmed(&mut sentences, &text[start..idx + c.len_utf8()]);
                start = chars[j].0;
                i = j;
                continue;
            }
        }
        i += 1;
    }
    push_trimmed(&mut sentences, &text[start..]);

    sentences
}

fn ends_with_abbreviation(prefix: &str) -> bool {
    prefix
        .rsplit(|c: char| !c.is_alphanumeric())
        .next()
        .map(|word| ABBREVIATIONS.contains(&word.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn push_trimmed(out: &mut Vec<String>, sentence: &str) {
    let sentence = sentence.trim();
    if !sentence.is_empty() {
        out.push(sentence.to_string());
    }
}

fn normalize_quotes(text: &str) -> String {
    text.replace(['\u{201c}', '\u{201d}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace('\u{2013}', "-")
        .replace('\u{2014}', "--")
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

fn period_sentences(text: &str) -> Vec<&str> {
    text.split('.').map(str::trim).filter(|s| !s.is_empty()).collect()
}

fn paragraph_count(text: &str) -> usize {
    text.split("\n\n").filter(|p| !p.trim().is_empty()).count()
}

pub(crate) fn analyze_structure(text: &str) -> ContentStructure {
    if text.is_empty() {
        return ContentStructure::default();
    }

    let sentences = period_sentences(text);
    let words = text.split_whitespace().count();
    let avg_sentence_length = if sentences.is_empty() {
        0.0
    } else {
        sentences.iter().map(|s| s.split_whitespace().count()).sum::<usize>() as f64
            / sentences.len() as f64
    };

    ContentStructure {
        paragraphs: paragraph_count(text),
        sentences: sentences.len(),
        words,
        avg_sentence_length,
        reading_time_minutes: (words / 200).max(1) as f64,
    }
}

/// Readability from sentence length, density from vocabulary, coherence from
/// paragraphing.
pub(crate) fn quality_metrics(text: &str) -> TextQuality {
    let zero = TextQuality {
        readability: 0.0,
        information_density: 0.0,
        coherence: 0.0,
    };
    let sentences = period_sentences(text);
    if sentences.is_empty() {
        return zero;
    }

    let avg_sentence_length = sentences
        .iter()
        .map(|s| s.split_whitespace().count())
        .sum::<usize>() as f64
        / sentences.len() as f64;
    let readability = clamp_unit(1.0 - (avg_sentence_length - 10.0) / 30.0);

    let words: Vec<&str> = text.split_whitespace().collect();
    let unique: HashSet<String> = words.iter().map(|w| w.to_lowercase()).collect();
    let information_density = unique.len() as f64 / words.len().max(1) as f64;

    let per_three = (sentences.len() as f64 / 3.0).max(1.0);
    let coherence = (paragraph_count(text) as f64 / per_three).min(1.0);

    TextQuality {
        readability: round3(readability),
        information_density: round3(information_density),
        coherence: round3(coherence),
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cleaner() -> TextCleaner {
        TextCleaner::default()
    }

    #[test]
    fn collapses_whitespace_and_blank_lines() {
        let out = cleaner().clean_text("Hello\t\t world.\r\n\r\n\r\n\r\nNext   para.");
        assert_eq!(out, "Hello world.\n\nNext para.");
    }

    #[test]
    fn strips_boilerplate_case_insensitively() {
        let out = cleaner().clean_text("Read the Cookie Policy now. © 2024 Acme Corp. Real text.");
        assert!(!out.to_lowercase().contains("cookie policy"));
        assert!(!out.contains("2024"));
        assert!(out.contains("Real text."));
    }

    #[test]
    fn removes_markup_artifacts() {
        let out = cleaner().clean_text("Text [1] with {tpl} and <b>tags</b>.");
        assert_eq!(out, "Text with and tags.");
    }

    #[test]
    fn markup_passes_respect_toggles() {
        let keep_tags = TextCleaner::new(CleanerOptions {
            remove_html_tags: false,
            ..Default::default()
        });
        assert!(keep_tags.clean_text("a <b>b</b>").contains("<b>"));
    }

    #[test]
    fn removes_duplicate_sentences_across_paragraphs() {
        let out = cleaner().clean_text("Rust is fast. Rust is safe.\n\nRust is fast. Go is simple.");
        assert_eq!(out, "Rust is fast. Rust is safe.\n\nGo is simple.");
    }

    #[test]
    fn abbreviations_do_not_split_sentences() {
        let sentences = split_sentences("Dr. Smith arrived. He left.");
        assert_eq!(sentences, vec!["Dr. Smith arrived.", "He left."]);
    }

    #[test]
    fn normalizes_typographic_quotes() {
        let out = cleaner().clean_text("\u{201c}Hi\u{201d} \u{2014} it\u{2019}s");
        assert_eq!(out, "\"Hi\" -- it's");
    }

    #[test]
    fn quality_metrics_for_short_text() {
        let q = quality_metrics("One two three. Four five six.");
        assert_eq!(q.readability, 1.0);
        assert_eq!(q.information_density, 1.0);
        assert_eq!(q.coherence, 1.0);
    }

    #[test]
    fn structure_counts() {
        let s = analyze_structure("A b c. D e.\n\nF g h i.");
        assert_eq!(s.paragraphs, 2);
        assert_eq!(s.sentences, 3);
        assert_eq!(s.words, 9);
        assert_eq!(s.reading_time_minutes, 1.0);
    }

    #[tokio::test]
    async fn cleaning_quality_blends_declared_score() {
        let item = ContentItem::new("https://a.dev", Some("t"), "One two three. Four five six.")
            .with_quality(0.5);
        let cleaned = cleaner().clean(&item).await.ok().expect("cleaned");
        // 0.5 * 0.7 + (0.3 + 0.4 + 0.3) * 0.3
        assert!((cleaned.cleaning_quality - 0.65).abs() < 1e-9);
        assert_eq!(cleaned.original_length, 29);
    }

    #[tokio::test]
    async fn fully_stripped_content_is_recoverable() {
        let item = ContentItem::new("https://a.dev", None, "<div></div>");
        let outcome = cleaner().clean(&item).await;
        assert!(matches!(outcome, StageOutcome::Recoverable(_)));
    }
}
