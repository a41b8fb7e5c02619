//! Bag-of-words cosine similarity between successive segment texts.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

/// Tokens are runs of two or more word characters.
static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\w\w+\b").expect("token pattern is valid"));

/// Lower-cased term counts.
pub fn term_counts(text: &str) -> HashMap<String, u32> {
    let lowered = text.to_lowercase();
    let mut counts = HashMap::new();
    for token in TOKEN_RE.find_iter(&lowered) {
        *counts.entry(token.as_str().to_string()).or_insert(0) += 1;
    }
    counts
}

/// Cosine similarity of the two texts' term-count vectors, in `[0, 1]`.
///
/// Blank input on either side counts as unchanged (1.0); text with no
/// tokens (e.g. only punctuation or single letters) shares nothing (0.0).
pub fn text_similarity(a: &str, b: &str) -> f64 {
    if a.trim().is_empty() || b.trim().is_empty() {
        return 1.0;
    }

    let left = term_counts(a);
    let right = term_counts(b);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }

    let dot: f64 = left
        .iter()
        .filter_map(|(term, &n)| right.get(term).map(|&m| f64::from(n) * f64::from(m)))
        .sum();
    let norm = |counts: &HashMap<String, u32>| {
        counts
            .values()
            .map(|&n| f64::from(n) * f64::from(n))
            .sum::<f64>()
            .sqrt()
    };

    (dot / (norm(&left) * norm(&right))).clamp(0.0, 1.0)
}
