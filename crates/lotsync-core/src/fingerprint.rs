//! Content fingerprints over normalized field projections.
//!
//! A fingerprint is a cheap equality proxy: two projections hash equal iff
//! every (key, value) pair is identical. It is a textual content hash, not a
//! security primitive.

use sha2::{Digest, Sha256};

/// Ordered key→value projection of a page's comparable fields.
///
/// Callers are responsible for normalization (trimmed strings, canonical
/// decimal formatting, stable key order); the projection itself does no
/// parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldProjection {
    pairs: Vec<(String, String)>,
}

impl FieldProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: &str, value: impl Into<String>) {
        self.pairs.push((key.to_string(), value.into()));
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Deterministic SHA-256 hex digest over the projection's pairs.
///
/// Keys and values are length-prefixed before hashing so that pair
/// boundaries are unambiguous regardless of their content.
pub fn fingerprint(projection: &FieldProjection) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in projection.pairs() {
        hasher.update((key.len() as u64).to_le_bytes());
        hasher.update(key.as_bytes());
        hasher.update((value.len() as u64).to_le_bytes());
        hasher.update(value.as_bytes());
    }
    hex::encode(hasher.finalize())
}
