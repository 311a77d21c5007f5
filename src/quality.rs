//! Unicode-aware quality gate, shared verbatim between index-time chunk
//! admission and query-time result filtering.
//!
//! Every length in this module is a Unicode code-point count
//! (`str::chars().count()`), never a UTF-8 byte length.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_segmentation::UnicodeSegmentation;

use crate::config::QualityConfig;

static URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bhttps?://[^\s]+").expect("static URL regex")
});

static SENDER_PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\[[^\]\n]{1,128}\]:\s?").expect("static sender-prefix regex")
});

static BASE64_DATA_URI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"data:[a-zA-Z0-9.+/-]+;base64,[A-Za-z0-9+/=]{32,}")
        .expect("static base64 data-uri regex")
});

static BASE64_RUN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9+/]{500,}={0,2}").expect("static base64 run regex")
});

static ATTACHMENT_ONLY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(\[[^\]]{1,128}\]:\s?)?(sent an? |shared an? )?(attachment|photo|image|video|sticker|gif|voice message|file)s?\.?\s*$")
        .expect("static attachment-only regex")
});

/// Unicode metrics used by both the index-time and query-time rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextMetrics {
    pub char_count: i64,
    pub alnum_count: i64,
    pub unique_word_count: i64,
}

/// Counts code points, alphanumeric code points, and unique lowercased
/// "words" of Unicode-word-character runs (including marks) of length >= 3.
pub fn measure(text: &str) -> TextMetrics {
    let char_count = text.chars().count() as i64;
    let alnum_count = text.chars().filter(|c| c.is_alphanumeric()).count() as i64;

    let mut words: Vec<String> = text
        .unicode_words()
        .filter(|w| w.chars().count() >= 3)
        .map(|w| w.to_lowercase())
        .collect();
    words.sort_unstable();
    words.dedup();

    TextMetrics {
        char_count,
        alnum_count,
        unique_word_count: words.len() as i64,
    }
}

fn contains_url(text: &str) -> bool {
    URL_RE.is_match(text)
}

/// `is_indexable(text) -> bool` per spec §4.1.
pub fn is_indexable(text: &str, cfg: &QualityConfig) -> bool {
    let m = measure(text);

    if cfg.url_special_case.enabled
        && contains_url(text)
        && m.alnum_count >= cfg.url_special_case.min_alnum_chars
    {
        return true;
    }

    m.char_count >= cfg.min_chars
        && m.alnum_count >= cfg.min_alnum_chars
        && m.unique_word_count >= cfg.min_unique_words
}

/// `is_low_quality(text) -> bool` per spec §4.1. Applied to vector hits
/// before fusion and to the final result list overall.
pub fn is_low_quality(text: &str, cfg: &QualityConfig) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return true;
    }

    if trimmed.chars().count() > 3000 {
        return true;
    }

    if cfg.filters.skip_base64_blobs
        && (BASE64_DATA_URI_RE.is_match(trimmed) || BASE64_RUN_RE.is_match(trimmed))
    {
        return true;
    }

    let stripped = SENDER_PREFIX_RE.replace_all(trimmed, "");
    let total_chars = stripped.chars().count().max(1);
    let url_chars: usize = URL_RE
        .find_iter(&stripped)
        .map(|m| m.as_str().chars().count())
        .sum();
    let url_density = url_chars as f64 / total_chars as f64;

    if url_density > cfg.filters.max_url_density {
        return true;
    }

    let without_urls = URL_RE.replace_all(&stripped, "");
    let alnum_after_strip = without_urls.chars().filter(|c| c.is_alphanumeric()).count() as i64;
    if url_chars > 0 && alnum_after_strip < cfg.url_special_case.min_alnum_chars {
        return true;
    }

    if cfg.filters.skip_attachment_only && ATTACHMENT_ONLY_RE.is_match(trimmed) {
        return true;
    }

    let char_count = trimmed.chars().count();
    if char_count > 2000 {
        let whitespace_count = trimmed.chars().filter(|c| c.is_whitespace()).count();
        let ratio = whitespace_count as f64 / char_count as f64;
        if ratio < 0.02 {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QualityConfig;

    fn cfg() -> QualityConfig {
        QualityConfig::default()
    }

    #[test]
    fn short_text_not_indexable() {
        assert!(!is_indexable("too short", &cfg()));
    }

    #[test]
    fn long_varied_text_indexable() {
        let text = "the quick brown fox jumps over the lazy dog near the riverbank while everyone watches quietly and the afternoon light fades across the water slowly turning orange then purple as evening settles over the small town where nobody seems to be in any particular hurry to get anywhere at all tonight".repeat(2);
        assert!(is_indexable(&text, &cfg()));
    }

    #[test]
    fn url_special_case_overrides_thresholds() {
        let mut c = cfg();
        c.url_special_case.enabled = true;
        c.url_special_case.min_alnum_chars = 10;
        let text = "check this out https://example.com/some/long/path/to/a/resource";
        assert!(is_indexable(text, &c));
    }

    #[test]
    fn empty_text_is_low_quality() {
        assert!(is_low_quality("   ", &cfg()));
    }

    #[test]
    fn base64_blob_is_low_quality() {
        let blob = "A".repeat(600);
        assert!(is_low_quality(&blob, &cfg()));
    }

    #[test]
    fn attachment_only_is_low_quality() {
        assert!(is_low_quality("[Alice]: sent an attachment.", &cfg()));
    }

    #[test]
    fn normal_message_is_not_low_quality() {
        assert!(!is_low_quality(
            "[Alice]: did you get a chance to look at the recipe I sent over yesterday?",
            &cfg()
        ));
    }
}
