//! Token-bounded text chunking
//!
//! Slide text is split into overlapping windows of at most `max_tokens`
//! tokens, where a token is a Unicode word-bound segment that is not pure
//! whitespace. Window ends are pulled back to the strongest nearby break
//! (paragraph, sentence, line) so chunks read naturally.

mod boundaries;

pub use boundaries::*;

use crate::config::ChunkConfig;
use blake3::Hasher;
use unicode_segmentation::UnicodeSegmentation;

/// A text chunk with metadata
#[derive(Debug, Clone)]
pub struct TextChunk {
    /// The actual text content
    pub text: String,

    /// Chunk index (0-based)
    pub index: usize,

    /// Number of tokens in the chunk
    pub token_count: usize,

    /// Blake3 hash of the text
    pub hash: String,
}

impl TextChunk {
    /// Compute the hash for a chunk's text
    pub fn compute_hash(text: &str) -> String {
        let mut hasher = Hasher::new();
        hasher.update(text.as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Byte spans of the tokens in `text`
fn token_spans(text: &str) -> Vec<(usize, usize)> {
    text.split_word_bound_indices()
        .filter(|(_, s)| !s.trim().is_empty())
        .map(|(i, s)| (i, i + s.len()))
        .collect()
}

/// Count tokens the way the chunker does
pub fn count_tokens(text: &str) -> usize {
    token_spans(text).len()
}

/// Split text into token-bounded, overlapping chunks
pub fn chunk_text(text: &str, config: &ChunkConfig) -> Vec<TextChunk> {
    let tokens = token_spans(text);
    if tokens.is_empty() || config.max_tokens == 0 {
        return Vec::new();
    }

    let max = config.max_tokens;
    let overlap = config.overlap_tokens.min(max.saturating_sub(1));
    // Never snap back so far that the next window would not advance
    let min_span = ((max * 3) / 4).max(overlap + 1).min(max);

    let mut chunks = Vec::new();
    let mut start = 0;

    loop {
        let hard_end = (start + max).min(tokens.len());
        let end = if hard_end == tokens.len() {
            hard_end
        } else {
            snap_end(text, &tokens, start + min_span, hard_end)
        };

        let byte_start = tokens[start].0;
        let byte_end = tokens[end - 1].1;
        let chunk = text[byte_start..byte_end].to_string();
        chunks.push(TextChunk {
            hash: TextChunk::compute_hash(&chunk),
            text: chunk,
            index: chunks.len(),
            token_count: end - start,
        });

        if end == tokens.len() {
            break;
        }
        start = end.saturating_sub(overlap).max(start + 1);
    }

    chunks
}

/// Pick the window end in `min_end..=hard_end` with the strongest break.
///
/// Later positions win ties, so plain word breaks keep the full window.
fn snap_end(text: &str, tokens: &[(usize, usize)], min_end: usize, hard_end: usize) -> usize {
    let mut best = hard_end;
    let mut best_priority = BreakPriority::Word;

    for end in (min_end.max(1)..=hard_end).rev() {
        if end >= tokens.len() {
            continue;
        }
        let (prev_start, prev_end) = tokens[end - 1];
        let next_start = tokens[end].0;
        let priority = break_priority(&text[prev_start..prev_end], &text[prev_end..next_start]);
        if priority > best_priority {
            best = end;
            best_priority = priority;
        }
    }

    best
}
