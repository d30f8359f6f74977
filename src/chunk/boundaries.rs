//! Break point detection for chunking

/// Priority levels for break points
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BreakPriority {
    /// Word boundary (lowest)
    Word = 1,
    /// Line break inside a paragraph (bullet lists on slides)
    Line = 2,
    /// Sentence boundary
    Sentence = 3,
    /// Paragraph boundary (highest)
    Paragraph = 4,
}

/// Classify the break between two tokens.
///
/// `prev` is the token before the break and `gap` is the whitespace between
/// it and the next token.
pub fn break_priority(prev: &str, gap: &str) -> BreakPriority {
    let newlines = gap.chars().filter(|c| *c == '\n').count();
    if newlines >= 2 {
        BreakPriority::Paragraph
    } else if is_sentence_end(prev) {
        BreakPriority::Sentence
    } else if newlines == 1 {
        BreakPriority::Line
    } else {
        BreakPriority::Word
    }
}

fn is_sentence_end(token: &str) -> bool {
    matches!(token, "." | "!" | "?" | "。" | "！" | "？")
}
