//! all-MiniLM-L6-v2 backend via `fastembed` (local ONNX inference).
//!
//! Model files are fetched on construction, which can fail offline —
//! callers treat that failure as the trigger for degraded (vector-less)
//! mode rather than an error.

use std::sync::Mutex;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use super::Embedder;
use crate::error::{Error, Result};

/// Output dimension of all-MiniLM-L6-v2.
pub const FASTEMBED_DIM: usize = 384;

pub struct FastEmbedder {
    model: Mutex<TextEmbedding>,
}

impl FastEmbedder {
    pub fn new() -> Result<Self> {
        let options =
            InitOptions::new(EmbeddingModel::AllMiniLML6V2).with_show_download_progress(false);
        let model = TextEmbedding::try_new(options)
            .map_err(|e| Error::VectorUnavailable(e.to_string()))?;
        Ok(Self {
            model: Mutex::new(model),
        })
    }
}

impl Embedder for FastEmbedder {
    fn dim(&self) -> usize {
        FASTEMBED_DIM
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        #[allow(unused_mut)]
        let mut model = self.model.lock().expect("embedder poisoned");
        let mut batch = model
            .embed(vec![text], None)
            .map_err(|e| Error::VectorUnavailable(e.to_string()))?;
        batch
            .pop()
            .ok_or_else(|| Error::VectorUnavailable("backend returned no vector".into()))
    }
}
