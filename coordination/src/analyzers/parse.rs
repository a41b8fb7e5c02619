//! Extraction of structured payloads from free-form model output.
//!
//! Models wrap JSON in markdown fences or surround it with prose often enough
//! that every parser goes through [`extract_json`] first.

use serde::de::DeserializeOwned;
use thiserror::Error;

const SNIPPET_LEN: usize = 120;

/// Malformed structured output from the provider.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("Empty response from provider")]
    Empty,

    #[error("Expected {expected} in response, got: {snippet}")]
    Malformed {
        expected: &'static str,
        snippet: String,
    },

    #[error("Invalid JSON ({reason}) in response: {snippet}")]
    Json { reason: String, snippet: String },
}

impl ParseError {
    pub fn malformed(expected: &'static str, raw: &str) -> Self {
        Self::Malformed {
            expected,
            snippet: snippet(raw),
        }
    }
}

fn snippet(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.char_indices().nth(SNIPPET_LEN) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// Remove a surrounding ```json / ``` fence, if any.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let body_start = after.find('\n').unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
    }
    trimmed
}

/// Slice from the first `open` to the last `close` delimiter.
pub fn extract_json(raw: &str, open: char, close: char) -> Option<&str> {
    let stripped = strip_code_fences(raw);
    let start = stripped.find(open)?;
    let end = stripped.rfind(close)?;
    (end > start).then(|| &stripped[start..=end])
}

/// Deserialize the first JSON object found in `raw`.
pub fn parse_json_object<T: DeserializeOwned>(raw: &str) -> Result<T, ParseError> {
    if raw.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    let json = extract_json(raw, '{', '}').ok_or_else(|| ParseError::malformed("a JSON object", raw))?;
    serde_json::from_str(json).map_err(|e| ParseError::Json {
        reason: e.to_string(),
        snippet: snippet(raw),
    })
}

/// Deserialize the first JSON array found in `raw`.
pub fn parse_json_array<T: DeserializeOwned>(raw: &str) -> Result<Vec<T>, ParseError> {
    if raw.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    let json = extract_json(raw, '[', ']').ok_or_else(|| ParseError::malformed("a JSON array", raw))?;
    serde_json::from_str(json).map_err(|e| ParseError::Json {
        reason: e.to_string(),
        snippet: snippet(raw),
    })
}

/// Interpret a single-word yes/no classification.
pub fn parse_yes_no(raw: &str) -> Result<bool, ParseError> {
    let word: String = raw
        .trim()
        .chars()
        .take_while(|c| c.is_alphabetic())
        .collect::<String>()
        .to_lowercase();
    match word.as_str() {
        "yes" | "y" => Ok(true),
        "no" | "n" => Ok(false),
        "" => Err(ParseError::Empty),
        _ => Err(ParseError::malformed("'yes' or 'no'", raw)),
    }
}
