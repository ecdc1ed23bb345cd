//! Tokenizer shared by the lexical backends and the hashing encoder.
//!
//! Text is NFC-normalized, lowercased, and split on non-alphanumeric
//! characters. Common English and French stop words and single-character
//! tokens are discarded.

use std::collections::HashSet;
use std::sync::LazyLock;

use unicode_normalization::UnicodeNormalization;

static STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is",
        "it", "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there",
        "these", "they", "this", "to", "was", "will", "with",
        // French common stop words
        "le", "la", "les", "un", "une", "des", "du", "de", "et", "en", "au", "aux", "ce", "ces",
        "dans", "par", "pour", "sur", "qui", "que", "est", "sont", "avec",
    ]
    .into_iter()
    .collect()
});

/// Tokenize text into owned lowercase terms, in order of appearance.
pub fn tokenize(text: &str) -> Vec<String> {
    let normalized: String = text.nfc().collect::<String>().to_lowercase();
    normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() > 1 && !STOP_WORDS.contains(token))
        .map(str::to_string)
        .collect()
}

/// Distinct terms of `text`, for set-based scorers.
pub fn distinct_terms(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}
