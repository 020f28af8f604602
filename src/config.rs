//! Configuration surface for a skill bank instance.
//!
//! Everything except `storage_dir` has a documented default, so the usual
//! entry point is [`SkillbankConfig::new`]. A YAML file with the same keys
//! can be loaded with [`SkillbankConfig::load`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Tunables for storage, the vector index and history reads.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SkillbankConfig {
    /// Root directory for the database, index files and history logs.
    pub storage_dir: PathBuf,
    /// When `true` (default) every store mutation immediately updates the
    /// vector index. Disable for bulk imports and catch up with
    /// `rebuild_index()`.
    #[serde(default = "default_true")]
    pub auto_sync: bool,
    /// Embedding dimension. 384 matches the default MiniLM backend.
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
    /// Maximum live slots in the vector index.
    #[serde(default = "default_max_elements")]
    pub max_elements: usize,
    /// HNSW `ef` parameter during graph construction.
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,
    /// HNSW maximum connections per node.
    #[serde(default = "default_m")]
    pub m: usize,
    /// HNSW `ef` parameter at query time.
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,
    /// How many history records `get_history` returns when no limit is given.
    #[serde(default = "default_history_tail")]
    pub history_tail_default: usize,
}

fn default_true() -> bool {
    true
}
fn default_embedding_dim() -> usize {
    384
}
fn default_max_elements() -> usize {
    10_000
}
fn default_ef_construction() -> usize {
    200
}
fn default_m() -> usize {
    16
}
fn default_ef_search() -> usize {
    50
}
fn default_history_tail() -> usize {
    100
}

impl SkillbankConfig {
    /// Config with all defaults, rooted at `storage_dir`.
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            auto_sync: default_true(),
            embedding_dim: default_embedding_dim(),
            max_elements: default_max_elements(),
            ef_construction: default_ef_construction(),
            m: default_m(),
            ef_search: default_ef_search(),
            history_tail_default: default_history_tail(),
        }
    }

    /// Load a config from a YAML file. Unknown keys are rejected.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: Self = serde_yaml_ng::from_str(&raw)?;
        Ok(cfg)
    }

    pub fn db_path(&self) -> PathBuf {
        self.storage_dir.join("skills.db")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.storage_dir.join("index")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.storage_dir.join("history")
    }
}

// ── Tests ───────────────────────────────────────────────────
