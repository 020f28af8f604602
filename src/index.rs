//! Approximate nearest-neighbor index over skill embeddings.
//!
//! An HNSW graph (cosine distance) keyed by skill name. The durable
//! artifacts are an entry table (`skills.index`, bincode) and a name↔slot
//! mapping (`skills_mapping`, JSON); the graph is reconstructed from the
//! entry table on load, and saves swap files into place with a rename so
//! readers never observe a torn index.
//!
//! The embedder is acquired lazily through a fallible factory. When it
//! cannot be constructed the index degrades: queries return empty results
//! and upserts fail with `VectorUnavailable` (the manager downgrades those
//! to warnings on the auto-sync path). A `rebuild` resets the failure latch
//! so a backend that has come up since gets retried.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use hnsw_rs::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::embed::{Embedder, EmbedderFactory};
use crate::error::{Error, Result};
use crate::skill::SkillType;

const INDEX_FILE: &str = "skills.index";
const MAPPING_FILE: &str = "skills_mapping";

/// HNSW construction and query parameters.
#[derive(Debug, Clone)]
pub struct IndexParams {
    pub dim: usize,
    pub max_elements: usize,
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            dim: 384,
            max_elements: 10_000,
            m: 16,
            ef_construction: 200,
            ef_search: 50,
        }
    }
}

/// One indexed skill. Slot id = position in the entry table.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    name: String,
    skill_type: SkillType,
    embedding: Vec<f32>,
}

/// On-disk shape of `skills_mapping`.
#[derive(Debug, Serialize, Deserialize)]
struct MappingFile {
    dim: usize,
    slots: HashMap<String, usize>,
    dead: Vec<usize>,
}

/// A query hit: skill name plus similarity score in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub name: String,
    pub skill_type: SkillType,
    pub score: f32,
}

enum EmbedderState {
    Untried,
    Ready(Box<dyn Embedder>),
    Failed,
}

struct Inner {
    entries: Vec<Entry>,
    by_name: HashMap<String, usize>,
    dead: BTreeSet<usize>,
    graph: Option<Hnsw<'static, f32, DistCosine>>,
    embedder: EmbedderState,
}

impl Inner {
    fn empty() -> Self {
        Self {
            entries: Vec::new(),
            by_name: HashMap::new(),
            dead: BTreeSet::new(),
            graph: None,
            embedder: EmbedderState::Untried,
        }
    }

    fn live_len(&self) -> usize {
        self.entries.len() - self.dead.len()
    }
}

pub struct VectorIndex {
    dir: PathBuf,
    params: IndexParams,
    factory: EmbedderFactory,
    inner: Mutex<Inner>,
}

impl VectorIndex {
    /// Create an index rooted at `dir`. Touches neither disk nor the
    /// embedder; call [`VectorIndex::load`] to restore persisted state.
    pub fn new(dir: impl Into<PathBuf>, params: IndexParams, factory: EmbedderFactory) -> Self {
        Self {
            dir: dir.into(),
            params,
            factory,
            inner: Mutex::new(Inner::empty()),
        }
    }

    /// Live (non-tombstoned) entry count.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("vector index poisoned").live_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .lock()
            .expect("vector index poisoned")
            .by_name
            .contains_key(name)
    }

    /// Idempotent upsert. Updating an existing name tombstones its old slot
    /// (HNSW graphs do not shrink) and claims a fresh one.
    pub fn add(&self, name: &str, skill_type: SkillType, text: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("vector index poisoned");
        let embedding = self.embed_locked(&mut inner, text)?;

        if let Some(old) = inner.by_name.get(name).copied() {
            inner.dead.insert(old);
        } else if inner.entries.len() >= self.params.max_elements {
            return Err(Error::CapacityExceeded {
                capacity: self.params.max_elements,
            });
        }

        let slot = inner.entries.len();
        inner.entries.push(Entry {
            name: name.to_string(),
            skill_type,
            embedding,
        });
        inner.by_name.insert(name.to_string(), slot);
        if inner.graph.is_none() {
            inner.graph = Some(build_graph(&self.params));
        }
        let entry = &inner.entries[slot];
        inner
            .graph
            .as_ref()
            .expect("graph just built")
            .insert((&entry.embedding, slot));
        debug!(skill = %name, slot, "indexed skill");
        Ok(())
    }

    /// Alias for [`VectorIndex::add`]; upserts are symmetric.
    pub fn update(&self, name: &str, skill_type: SkillType, text: &str) -> Result<()> {
        self.add(name, skill_type, text)
    }

    /// Tombstone a name. Returns whether it was present. Space is
    /// reclaimed by the next [`VectorIndex::rebuild`].
    pub fn remove(&self, name: &str) -> bool {
        let mut inner = self.inner.lock().expect("vector index poisoned");
        match inner.by_name.remove(name) {
            Some(slot) => {
                inner.dead.insert(slot);
                debug!(skill = %name, slot, "tombstoned index entry");
                true
            }
            None => false,
        }
    }

    /// Query the index. At most `k` hits, descending score, optionally
    /// restricted to one tier. Degraded mode and an empty index both yield
    /// an empty result, never an error.
    pub fn query(
        &self,
        text: &str,
        k: usize,
        skill_type_filter: Option<SkillType>,
    ) -> Result<Vec<Hit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut inner = self.inner.lock().expect("vector index poisoned");
        if inner.live_len() == 0 {
            return Ok(Vec::new());
        }
        let query = match self.embed_locked(&mut inner, text) {
            Ok(q) => q,
            Err(Error::VectorUnavailable(reason)) => {
                debug!(%reason, "query in degraded mode returns no hits");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        // Over-fetch so tombstones, stale slots and the tier filter still
        // leave k survivors.
        let fetch = if skill_type_filter.is_some() || !inner.dead.is_empty() {
            k.saturating_mul(4).max(32).min(inner.entries.len())
        } else {
            k.min(inner.entries.len())
        };
        let ef = self.params.ef_search.max(fetch);

        let graph = match inner.graph.as_ref() {
            Some(g) => g,
            None => return Ok(Vec::new()),
        };
        let neighbours = graph.search(&query, fetch, ef);

        let mut hits = Vec::with_capacity(k);
        for n in neighbours {
            let slot = n.d_id;
            if inner.dead.contains(&slot) {
                continue;
            }
            let entry = match inner.entries.get(slot) {
                Some(e) => e,
                None => continue,
            };
            // A name re-added after removal may leave stale live slots
            // behind; only the mapping's current slot counts.
            if inner.by_name.get(&entry.name) != Some(&slot) {
                continue;
            }
            if let Some(filter) = skill_type_filter {
                if entry.skill_type != filter {
                    continue;
                }
            }
            hits.push(Hit {
                name: entry.name.clone(),
                skill_type: entry.skill_type,
                score: (1.0 - n.distance).clamp(0.0, 1.0),
            });
            if hits.len() == k {
                break;
            }
        }
        Ok(hits)
    }

    /// Rebuild from scratch. Retries a previously failed embedder, embeds
    /// every given skill, swaps the state in memory and persists it
    /// atomically. The old state stays intact on any failure.
    pub fn rebuild(&self, skills: &[(String, SkillType, String)]) -> Result<()> {
        let mut inner = self.inner.lock().expect("vector index poisoned");
        if matches!(inner.embedder, EmbedderState::Failed) {
            inner.embedder = EmbedderState::Untried;
        }

        let mut entries = Vec::with_capacity(skills.len());
        let mut by_name = HashMap::with_capacity(skills.len());
        for (name, skill_type, text) in skills {
            let embedding = self.embed_locked(&mut inner, text)?;
            let slot = entries.len();
            entries.push(Entry {
                name: name.clone(),
                skill_type: *skill_type,
                embedding,
            });
            by_name.insert(name.clone(), slot);
        }

        let graph = build_graph(&self.params);
        for (slot, entry) in entries.iter().enumerate() {
            graph.insert((&entry.embedding, slot));
        }

        inner.entries = entries;
        inner.by_name = by_name;
        inner.dead.clear();
        inner.graph = Some(graph);
        self.save_locked(&inner)?;
        info!(entries = inner.entries.len(), "vector index rebuilt");
        Ok(())
    }

    /// Persist the entry table and mapping with a write-then-rename swap.
    pub fn save(&self) -> Result<()> {
        let inner = self.inner.lock().expect("vector index poisoned");
        self.save_locked(&inner)
    }

    /// Restore persisted state. Missing files mean an empty index;
    /// undecodable ones surface as `Corruption`.
    pub fn load(&self) -> Result<()> {
        let index_path = self.dir.join(INDEX_FILE);
        let mapping_path = self.dir.join(MAPPING_FILE);
        if !index_path.exists() && !mapping_path.exists() {
            return Ok(());
        }

        let raw_entries = fs::read(&index_path)?;
        let entries: Vec<Entry> = bincode::deserialize(&raw_entries)
            .map_err(|e| Error::Corruption(format!("{}: {e}", index_path.display())))?;
        let raw_mapping = fs::read_to_string(&mapping_path)?;
        let mapping: MappingFile = serde_json::from_str(&raw_mapping)
            .map_err(|e| Error::Corruption(format!("{}: {e}", mapping_path.display())))?;

        if mapping.dim != self.params.dim {
            return Err(Error::Corruption(format!(
                "index dimension {} does not match configured {}",
                mapping.dim, self.params.dim
            )));
        }
        if mapping.slots.values().any(|s| *s >= entries.len()) {
            return Err(Error::Corruption(
                "mapping references slots beyond the entry table".into(),
            ));
        }

        let dead: BTreeSet<usize> = mapping.dead.into_iter().collect();
        let graph = build_graph(&self.params);
        for (slot, entry) in entries.iter().enumerate() {
            if dead.contains(&slot) || mapping.slots.get(&entry.name) != Some(&slot) {
                continue;
            }
            graph.insert((&entry.embedding, slot));
        }

        let mut inner = self.inner.lock().expect("vector index poisoned");
        inner.entries = entries;
        inner.by_name = mapping.slots;
        inner.dead = dead;
        inner.graph = Some(graph);
        info!(entries = inner.live_len(), "vector index loaded");
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────

    fn embed_locked(&self, inner: &mut Inner, text: &str) -> Result<Vec<f32>> {
        if matches!(inner.embedder, EmbedderState::Untried) {
            inner.embedder = match (self.factory)() {
                Ok(e) if e.dim() == self.params.dim => EmbedderState::Ready(e),
                Ok(e) => {
                    warn!(
                        backend_dim = e.dim(),
                        configured_dim = self.params.dim,
                        "embedder dimension mismatch; running degraded"
                    );
                    EmbedderState::Failed
                }
                Err(e) => {
                    warn!(error = %e, "embedder unavailable; running degraded");
                    EmbedderState::Failed
                }
            };
        }
        match &inner.embedder {
            EmbedderState::Ready(e) => e.embed(text),
            _ => Err(Error::VectorUnavailable(
                "no embedding backend".into(),
            )),
        }
    }

    fn save_locked(&self, inner: &Inner) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let encoded =
            bincode::serialize(&inner.entries).map_err(|e| Error::Serialize(e.to_string()))?;
        write_swap(&self.dir.join(INDEX_FILE), &encoded)?;

        let mapping = MappingFile {
            dim: self.params.dim,
            slots: inner.by_name.clone(),
            dead: inner.dead.iter().copied().collect(),
        };
        write_swap(
            &self.dir.join(MAPPING_FILE),
            serde_json::to_string(&mapping)?.as_bytes(),
        )?;
        debug!(entries = inner.entries.len(), dead = inner.dead.len(), "vector index saved");
        Ok(())
    }
}

fn build_graph(params: &IndexParams) -> Hnsw<'static, f32, DistCosine> {
    let max_layer = 16.min(((params.max_elements as f32).ln().trunc() as usize).max(1));
    Hnsw::new(
        params.m,
        params.max_elements,
        max_layer,
        params.ef_construction,
        DistCosine {},
    )
}

/// Write to a sibling temp file, then rename into place.
fn write_swap(path: &Path, bytes: &[u8]) -> Result<()> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{name}.tmp"));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────
