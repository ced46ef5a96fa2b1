//! Review text preprocessing for embedding generation.
//!
//! Only the model input is shaped here; the index always stores the
//! caller's original text.

/// Maximum embedding input length (characters, not tokens)
const MAX_CONTENT_LENGTH: usize = 512;

/// Ellipsis suffix when content is truncated
const TRUNCATION_SUFFIX: &str = "...";

/// Prepare a review text for the embedding model.
///
/// Trims surrounding whitespace, collapses internal runs of whitespace and
/// truncates to `MAX_CONTENT_LENGTH` characters.
pub fn embedding_input(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_content(&collapsed)
}

/// Truncate content to MAX_CONTENT_LENGTH characters, adding an ellipsis if
/// truncated. Never splits a UTF-8 sequence.
fn truncate_content(content: &str) -> String {
    if content.chars().count() <= MAX_CONTENT_LENGTH {
        return content.to_string();
    }

    let max_chars = MAX_CONTENT_LENGTH - TRUNCATION_SUFFIX.len();
    let truncated: String = content.chars().take(max_chars).collect();

    format!("{}{}", truncated, TRUNCATION_SUFFIX)
}
