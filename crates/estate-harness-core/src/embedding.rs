//! Vector helpers for the semantic store.
//!
//! Embeddings are optional: chunks written while no embedding provider is
//! configured carry no vector, and retrieval falls back to
//! [`term_overlap`] scoring for them.

use std::collections::HashSet;

/// Encode an embedding as a little-endian `f32` BLOB.
///
/// ```rust
/// use estate_harness_core::embedding::{blob_to_vec, vec_to_blob};
///
/// let v = vec![0.5f32, -1.25];
/// assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "what", "which", "with", "this", "that", "from", "about", "into",
    "show", "tell", "give", "does", "have", "has", "any", "all", "can", "our", "your", "their",
    "there", "please", "how", "who", "when", "where", "why",
];

/// Lower-cased content terms of at least three characters, minus stopwords.
pub fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3)
        .map(|w| w.to_lowercase())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Share of the query's terms that occur in `text`, in `[0, 1]`.
pub fn term_overlap(query: &str, text: &str) -> f64 {
    let q = terms(query);
    if q.is_empty() {
        return 0.0;
    }
    let t = terms(text);
    let hits = q.iter().filter(|term| t.contains(*term)).count();
    hits as f64 / q.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn cosine_bounds() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn overlap_ignores_stopwords_and_case() {
        let score = term_overlap("What is the TERMINATION notice?", "Termination requires notice.");
        assert!((score - 1.0).abs() < 1e-9);
        assert_eq!(term_overlap("the and", "anything"), 0.0);
        assert!(term_overlap("termination payment", "payment schedule") > 0.4);
    }
}
