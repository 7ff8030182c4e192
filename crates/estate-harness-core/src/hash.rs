//! Deterministic content fingerprints.
//!
//! Every dedup decision in the dual-store writer compares one of these
//! SHA-256 hex digests: chunks by normalized text, relational records by a
//! hash over their canonical fields.

use sha2::{Digest, Sha256};

/// SHA-256 of `text` after collapsing runs of whitespace to a single space.
///
/// Re-extracting the same document from a differently wrapped PDF yields
/// the same hash.
pub fn content_hash(text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    sha256_hex(normalized.as_bytes())
}

/// SHA-256 over `parts`, separated by the ASCII unit separator.
pub fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
