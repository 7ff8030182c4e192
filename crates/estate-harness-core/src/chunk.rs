//! Sentence-aware text chunker.
//!
//! Splits document text into chunks of roughly `min_tokens..=max_tokens`
//! tokens without ever cutting a sentence in half. Legal clauses rely on
//! this: a retrieved chunk must read as complete sentences.
//!
//! # Algorithm
//!
//! 1. Split text into paragraphs on blank lines.
//! 2. Split each paragraph into sentences on `.`, `!` or `?` followed by
//!    whitespace and an upper-case letter, digit, quote or bracket. Common
//!    abbreviations (`e.g.`, `No.`, `Art.`) and single-letter initials do
//!    not end a sentence.
//! 3. Accumulate sentences while the running total stays within
//!    `max_tokens`. A paragraph boundary flushes the buffer once it holds
//!    at least `min_tokens`.
//! 4. A single sentence longer than `max_tokens` becomes its own chunk.
//!
//! Token counts are estimated at 4 characters per token.
//!
//! ```rust
//! use estate_harness_core::chunk::{chunk_sentences, ChunkBounds};
//!
//! let chunks = chunk_sentences("The buyer pays. The seller signs.", ChunkBounds::default());
//! assert_eq!(chunks, vec!["The buyer pays. The seller signs.".to_string()]);
//! ```

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

const ABBREVIATIONS: &[&str] = &[
    "e.g", "i.e", "etc", "no", "nos", "art", "arts", "sec", "cl", "para", "mr", "mrs", "ms", "dr",
    "st", "vs", "cf", "approx", "inc", "co", "sq", "ft", "pp", "ref",
];

/// Target size window for chunks, in estimated tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkBounds {
    pub min_tokens: usize,
    pub max_tokens: usize,
}

impl Default for ChunkBounds {
    fn default() -> Self {
        Self {
            min_tokens: 200,
            max_tokens: 500,
        }
    }
}

/// Estimated token count of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Split a paragraph into trimmed sentences with internal whitespace collapsed.
pub fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut sentences = Vec::new();
    let mut start = 0usize;

    for (pos, &(byte_idx, c)) in chars.iter().enumerate() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        // Absorb closing quotes/brackets directly after the terminator.
        let mut end = pos + 1;
        while end < chars.len() && matches!(chars[end].1, '"' | '\'' | ')' | ']' | '\u{201d}') {
            end += 1;
        }
        if end < chars.len() && !chars[end].1.is_whitespace() {
            continue;
        }
        let mut next = end;
        while next < chars.len() && chars[next].1.is_whitespace() {
            next += 1;
        }
        if next < chars.len() {
            let n = chars[next].1;
            let opens = n.is_uppercase()
                || n.is_ascii_digit()
                || matches!(n, '"' | '\'' | '(' | '[' | '\u{201c}');
            if !opens {
                continue;
            }
        }
        if c == '.' && is_abbreviation(&text[start..byte_idx]) {
            continue;
        }

        let end_byte = if end < chars.len() {
            chars[end].0
        } else {
            text.len()
        };
        push_sentence(&mut sentences, &text[start..end_byte]);
        start = end_byte;
    }
    push_sentence(&mut sentences, &text[start..]);
    sentences
}

fn push_sentence(out: &mut Vec<String>, raw: &str) {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if !collapsed.is_empty() {
        out.push(collapsed);
    }
}

/// True when the word ending at the terminator is a known abbreviation or an initial.
fn is_abbreviation(before: &str) -> bool {
    let word = before
        .rsplit(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("");
    if word.chars().count() == 1 && word.chars().all(|c| c.is_alphabetic()) {
        return true;
    }
    let lower = word.to_lowercase();
    ABBREVIATIONS.contains(&lower.as_str())
}

/// Group sentences into chunks that respect `bounds`.
///
/// Guarantees every chunk is a whole number of sentences and that chunks
/// appear in document order. Empty input yields no chunks.
pub fn chunk_sentences(text: &str, bounds: ChunkBounds) -> Vec<String> {
    let normalized = text.replace("\r\n", "\n");
    let mut chunks = Vec::new();
    let mut buf = String::new();
    let mut buf_tokens = 0usize;
    let mut paragraph_break = false;

    for para in normalized.split("\n\n") {
        for sentence in split_sentences(para) {
            let tokens = estimate_tokens(&sentence);
            if !buf.is_empty() && buf_tokens + tokens > bounds.max_tokens {
                chunks.push(std::mem::take(&mut buf));
                buf_tokens = 0;
            }
            if !buf.is_empty() {
                buf.push_str(if paragraph_break { "\n\n" } else { " " });
            }
            buf.push_str(&sentence);
            buf_tokens += tokens;
            paragraph_break = false;
        }
        if buf_tokens >= bounds.min_tokens {
            chunks.push(std::mem::take(&mut buf));
            buf_tokens = 0;
        }
        paragraph_break = true;
    }
    if !buf.is_empty() {
        chunks.push(buf);
    }
    chunks
}
