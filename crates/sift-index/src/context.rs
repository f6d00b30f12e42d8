//! Embedding input and result previews derived from a chunk.

use sift_store::Chunk;

/// Maximum number of lines in a search hit preview.
const PREVIEW_LINES: usize = 8;
/// Maximum number of characters in a search hit preview.
const PREVIEW_CHARS: usize = 600;

/// Generate text optimized for embedding (not for display).
///
/// Prepends file path, enclosing symbol and language tag to the raw code. Only the vector
/// depends on this text; chunk identity does not.
#[must_use]
pub fn contextualize_for_embedding(chunk: &Chunk) -> String {
    let mut text = String::with_capacity(chunk.text.len() + 128);

    text.push_str("# ");
    text.push_str(&chunk.file_path);
    text.push('\n');

    if let Some(symbol) = &chunk.symbol_name {
        text.push_str("# Symbol: ");
        text.push_str(symbol);
        text.push('\n');
    }

    text.push_str("# Language: ");
    text.push_str(&chunk.language);
    text.push('\n');

    text.push_str(&chunk.text);
    text
}

/// First few lines of a chunk, cut on a char boundary.
#[must_use]
pub fn chunk_preview(chunk: &Chunk) -> String {
    let mut preview = chunk
        .text
        .lines()
        .take(PREVIEW_LINES)
        .collect::<Vec<_>>()
        .join("\n");
    if preview.len() > PREVIEW_CHARS {
        let mut cut = PREVIEW_CHARS;
        while !preview.is_char_boundary(cut) {
            cut -= 1;
        }
        preview.truncate(cut);
    }
    preview
}

/// Truncate text sent to the reranker, keeping a valid UTF-8 prefix.
#[must_use]
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
