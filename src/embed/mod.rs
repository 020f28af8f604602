//! Text embedding backends.
//!
//! One trait, several providers. The built-in [`HashingEmbedder`] is
//! deterministic and dependency-free; the optional `fastembed` feature adds
//! an ONNX all-MiniLM-L6-v2 backend. Backends are produced by a fallible
//! [`EmbedderFactory`] so the index can defer the (potentially heavy)
//! construction until first use and degrade gracefully when it fails.

#[cfg(feature = "fastembed")]
pub mod fastembed;
pub mod hashing;

pub use hashing::HashingEmbedder;

use crate::error::Result;

/// A deterministic text-to-vector backend.
pub trait Embedder: Send + Sync {
    /// Output dimension of [`Embedder::embed`].
    fn dim(&self) -> usize;

    /// Embed one text into a fixed-dimension, L2-normalized vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Deferred embedder construction; called at most once per index
/// generation.
pub type EmbedderFactory = Box<dyn Fn() -> Result<Box<dyn Embedder>> + Send + Sync>;

/// Factory for the default backend at the given dimension: MiniLM when the
/// `fastembed` feature is on and the dimension matches, the hashing
/// embedder otherwise.
pub fn default_factory(dim: usize) -> EmbedderFactory {
    #[cfg(feature = "fastembed")]
    if dim == fastembed::FASTEMBED_DIM {
        return Box::new(|| Ok(Box::new(fastembed::FastEmbedder::new()?) as Box<dyn Embedder>));
    }
    Box::new(move || Ok(Box::new(HashingEmbedder::new(dim)) as Box<dyn Embedder>))
}

/// Normalize `v` to unit length in place. A zero vector is left unchanged.
pub(crate) fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

// ── Tests ───────────────────────────────────────────────────
