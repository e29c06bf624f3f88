//! Title matching used by CrossRef candidate selection and content verification.

use std::collections::HashSet;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "in", "of", "to", "is", "was",
    "for", "on", "with", "this", "that", "are", "were", "be", "been",
    "by", "from", "we", "our", "their", "which", "also", "at", "as",
    "its", "into", "via", "vs", "versus",
];

/// Lowercase, replace punctuation with spaces, collapse whitespace.
pub fn normalise_title(text: &str) -> String {
    let mapped: String = text
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Content-bearing tokens of a piece of text.
pub fn tokens(text: &str) -> HashSet<String> {
    normalise_title(text)
        .split(' ')
        .filter(|w| !w.is_empty() && !STOP_WORDS.contains(w))
        .filter(|w| w.len() > 1 || w.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
        .collect()
}

/// Fraction of the expected title's tokens that occur in `text`.
/// An expected title without content tokens scores 0.
pub fn token_overlap(expected_title: &str, text: &str) -> f64 {
    let expected = tokens(expected_title);
    if expected.is_empty() {
        return 0.0;
    }
    let observed = tokens(text);
    let hits = expected.iter().filter(|t| observed.contains(*t)).count();
    hits as f64 / expected.len() as f64
}

/// Similarity of two titles in [0, 1], tolerant of punctuation and case.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let a = normalise_title(a);
    let b = normalise_title(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    strsim::normalized_levenshtein(&a, &b)
}

/// Whether the author's surname appears as a token in `text`.
pub fn mentions_author(author: &str, text: &str) -> bool {
    // "Smith, J." and "J. Smith" both reduce to "smith".
    let surname = match author.split_once(',') {
        Some((last, _)) => normalise_title(last),
        None => normalise_title(author).rsplit(' ').next().unwrap_or_default().to_string(),
    };
    if surname.len() < 2 {
        return false;
    }
    format!(" {} ", normalise_title(text)).contains(&format!(" {surname} "))
}
