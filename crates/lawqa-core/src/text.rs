//! Text helpers shared by the stores and the query pipeline.

/// Split text into lowercase search tokens.
///
/// Any character that is neither a letter nor a digit separates tokens, so
/// Vietnamese syllables ("tốc", "độ") and numbers ("10", "5") become tokens
/// and "km/h" becomes `["km", "h"]`. This matches the SQLite `unicode61`
/// tokenizer closely enough for both stores to agree on term boundaries.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Collapse runs of whitespace and lowercase, for case-insensitive comparisons.
pub fn normalize_key(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Truncate to at most `max_chars` characters without splitting a char.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
