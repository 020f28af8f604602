//! Deterministic hashed bag-of-tokens embedder.
//!
//! Splits on non-alphanumeric boundaries, hashes each lowercased token into
//! one of `dim` buckets and L2-normalizes the counts. No model files,
//! identical output across runs and platforms. Texts sharing tokens always
//! land at strictly positive cosine similarity, which is all the index
//! contract requires of the built-in backend.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::{l2_normalize, Embedder};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }
}

impl Embedder for HashingEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; self.dim];
        let mut tokens = 0usize;
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_lowercase();
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let bucket = (hasher.finish() % self.dim as u64) as usize;
            v[bucket] += 1.0;
            tokens += 1;
        }
        if tokens == 0 {
            // Token-free input maps to a fixed unit vector so cosine
            // distance stays defined.
            v[0] = 1.0;
            return Ok(v);
        }
        l2_normalize(&mut v);
        Ok(v)
    }
}

// ── Tests ───────────────────────────────────────────────────
