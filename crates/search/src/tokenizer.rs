//! Text analysis for the full-text index
//!
//! Pipeline: UAX#29 word boundaries → strip possessives → keep alphanumerics
//!           → lowercase → drop tokens shorter than 2 → drop stopwords
//!
//! Queries and documents go through the same pipeline, so a query term
//! matches a document term exactly.

use std::collections::BTreeMap;
use unicode_segmentation::UnicodeSegmentation;

/// English stopwords dropped from documents and queries
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
    "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there", "these",
    "they", "this", "to", "was", "will", "with",
];

#[inline]
fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

#[inline]
fn strip_possessive(word: &str) -> &str {
    word.strip_suffix("'s")
        .or_else(|| word.strip_suffix("\u{2019}s"))
        .unwrap_or(word)
}

/// Split text into index terms
///
/// # Example
///
/// ```
/// use cairn_search::tokenizer::tokenize;
///
/// assert_eq!(tokenize("The Meeting's Agenda"), vec!["meeting", "agenda"]);
/// ```
pub fn tokenize(text: &str) -> Vec<String> {
    text.unicode_words()
        .map(strip_possessive)
        .map(|w| w.chars().filter(|c| c.is_alphanumeric()).collect::<String>())
        .map(|w| w.to_lowercase())
        .filter(|s| s.len() >= 2)
        .filter(|s| !is_stopword(s))
        .collect()
}

/// Terms of `text` with their frequencies, plus the total token count
pub fn term_frequencies(text: &str) -> (BTreeMap<String, u32>, u32) {
    let mut counts = BTreeMap::new();
    let mut len = 0u32;
    for token in tokenize(text) {
        *counts.entry(token).or_insert(0) += 1;
        len += 1;
    }
    (counts, len)
}

/// Tokenize and deduplicate, keeping first-seen order
pub fn tokenize_unique(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tokenize(text)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}
