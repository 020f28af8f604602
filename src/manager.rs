//! Public façade over the repository, the vector index and the composer.
//!
//! One [`SkillManager`] per `storage_dir` per process. Repository errors
//! surface verbatim; vector errors on the auto-sync path are logged at WARN
//! and never fail the store mutation — `rebuild_index()` repairs any
//! divergence afterwards.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::composer::{Composer, CoverageReport, Plan, TieredHits, Validation};
use crate::config::SkillbankConfig;
use crate::embed::{self, EmbedderFactory};
use crate::error::{Error, Result};
use crate::history::HistoryLog;
use crate::index::{IndexParams, VectorIndex};
use crate::repository::Repository;
use crate::skill::{
    ExecutionRecord, NewSkill, Skill, SkillStats, SkillType, SkillVersion, SystemStats,
};

/// A hydrated search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub skill_name: String,
    pub skill_type: SkillType,
    pub score: f32,
    pub description: String,
}

pub struct SkillManager {
    config: SkillbankConfig,
    repo: Repository,
    index: VectorIndex,
    history: HistoryLog,
}

impl SkillManager {
    /// Open a skill bank with the default embedding backend for the
    /// configured dimension.
    pub fn open(config: SkillbankConfig) -> Result<Self> {
        let factory = embed::default_factory(config.embedding_dim);
        Self::open_with_embedder(config, factory)
    }

    /// Open with an explicit embedder factory (tests, custom backends).
    pub fn open_with_embedder(config: SkillbankConfig, factory: EmbedderFactory) -> Result<Self> {
        fs::create_dir_all(&config.storage_dir)?;
        let repo = Repository::open(&config.db_path())?;
        let params = IndexParams {
            dim: config.embedding_dim,
            max_elements: config.max_elements,
            m: config.m,
            ef_construction: config.ef_construction,
            ef_search: config.ef_search,
        };
        let index = VectorIndex::new(config.index_dir(), params, factory);
        match index.load() {
            Ok(()) => {}
            Err(e @ Error::Corruption(_)) => {
                warn!(error = %e, "index unreadable; starting empty (rebuild_index() repairs)");
            }
            Err(e) => return Err(e),
        }
        let history = HistoryLog::new(config.history_dir());
        info!(storage_dir = %config.storage_dir.display(), "skill bank opened");
        Ok(Self {
            config,
            repo,
            index,
            history,
        })
    }

    pub fn config(&self) -> &SkillbankConfig {
        &self.config
    }

    // ── CRUD ────────────────────────────────────────────────

    /// Add a skill; with auto-sync on, also index it before returning.
    pub fn add_skill(&self, skill: NewSkill) -> Result<i64> {
        let name = skill.name.clone();
        let id = self.repo.add_skill(&skill)?;
        if self.config.auto_sync {
            self.sync_one(&name);
        }
        Ok(id)
    }

    /// Bump a skill's content to a new version and re-index it.
    pub fn update_skill(
        &self,
        name: &str,
        new_content: &str,
        change_description: Option<&str>,
    ) -> Result<i64> {
        let version = self.repo.update_skill(name, new_content, change_description)?;
        if self.config.auto_sync {
            self.sync_one(name);
        }
        Ok(version)
    }

    /// Delete a skill everywhere: store (cascading), index, history log.
    /// Returns `false` for absent names.
    pub fn delete_skill(&self, name: &str) -> Result<bool> {
        if !self.repo.delete_skill(name)? {
            return Ok(false);
        }
        if self.index.remove(name) {
            if let Err(e) = self.index.save() {
                warn!(skill = %name, error = %e, "index save after delete failed");
            }
        }
        if let Err(e) = self.history.remove(name) {
            warn!(skill = %name, error = %e, "history log removal failed");
        }
        Ok(true)
    }

    pub fn get_skill(&self, name: &str) -> Result<Skill> {
        self.repo.get_skill(name)
    }

    pub fn list_skills(
        &self,
        skill_type: Option<SkillType>,
        tags: &[String],
    ) -> Result<Vec<Skill>> {
        self.repo.list_skills(skill_type, tags)
    }

    pub fn get_versions(&self, name: &str) -> Result<Vec<SkillVersion>> {
        self.repo.get_versions(name)
    }

    pub fn set_dependencies(&self, name: &str, deps: &[String]) -> Result<()> {
        self.repo.set_dependencies(name, deps)
    }

    pub fn get_dependents(&self, name: &str) -> Result<Vec<String>> {
        self.repo.get_dependents(name)
    }

    // ── Search ──────────────────────────────────────────────

    /// Semantic search over the whole bank. `k = 0` returns nothing
    /// without touching the index; a degraded index yields no hits.
    pub fn search_skills(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let hits = self.index.query(query, k, None)?;
        let mut out = Vec::with_capacity(hits.len());
        for hit in hits {
            match self.repo.get_skill(&hit.name) {
                Ok(s) => out.push(SearchHit {
                    skill_name: s.name,
                    skill_type: s.skill_type,
                    score: hit.score,
                    description: s.description,
                }),
                // The index can briefly run ahead of the store; skip.
                Err(Error::UnknownSkill(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Semantic neighbors of an existing skill (the skill itself excluded).
    pub fn find_similar_skills(&self, name: &str, k: usize) -> Result<Vec<SearchHit>> {
        let skill = self.repo.get_skill(name)?;
        let mut hits = self.search_skills(&skill.embedding_text(), k.saturating_add(1))?;
        hits.retain(|h| h.skill_name != name);
        hits.truncate(k);
        Ok(hits)
    }

    // ── Execution tracking ──────────────────────────────────

    /// Record one execution. Counter and moving-average updates are
    /// transactional and authoritative; the history append is diagnostic
    /// and must not undo them when it fails.
    pub fn record_execution(
        &self,
        name: &str,
        success: bool,
        elapsed_ms: Option<f64>,
        context: Option<serde_json::Value>,
    ) -> Result<()> {
        self.repo.record_execution(name, success, elapsed_ms)?;
        let record = ExecutionRecord {
            timestamp: Utc::now(),
            success,
            execution_time_ms: elapsed_ms,
            context,
        };
        if let Err(e) = self.history.append(name, &record) {
            warn!(skill = %name, error = %e, "history append failed; stats remain authoritative");
        }
        Ok(())
    }

    pub fn get_skill_stats(&self, name: &str) -> Result<SkillStats> {
        self.repo.get_stats(name)
    }

    /// Tail of the per-skill execution log; `limit` defaults to the
    /// configured `history_tail_default`. A missing log reads as empty.
    pub fn get_history(&self, name: &str, limit: Option<usize>) -> Result<Vec<ExecutionRecord>> {
        self.repo.get_skill(name)?;
        self.history
            .tail(name, limit.unwrap_or(self.config.history_tail_default))
    }

    // ── Composition ─────────────────────────────────────────

    pub fn compose_for_task(&self, task: &str, max_skills: usize) -> Result<Plan> {
        self.composer().compose_for_task(task, max_skills)
    }

    pub fn validate_composition(&self, plan: &Plan) -> Validation {
        self.composer().validate_composition(plan)
    }

    pub fn analyze_coverage(&self, task: &str) -> Result<CoverageReport> {
        self.composer().analyze_coverage(task)
    }

    pub fn suggest_compositions(&self, task: &str, n: usize) -> Result<Vec<Plan>> {
        self.composer().suggest_compositions(task, n)
    }

    pub fn hierarchical_search(&self, query: &str, per_level: usize) -> Result<TieredHits> {
        self.composer().hierarchical_search(query, per_level)
    }

    fn composer(&self) -> Composer<'_> {
        Composer::new(&self.repo, &self.index)
    }

    // ── Index maintenance ───────────────────────────────────

    /// Re-embed every skill and swap in a fresh index. The canonical
    /// repair path after bulk imports, capacity overflow or an embedder
    /// outage.
    pub fn rebuild_index(&self) -> Result<usize> {
        let skills = self.repo.list_skills(None, &[])?;
        let entries: Vec<(String, SkillType, String)> = skills
            .iter()
            .map(|s| (s.name.clone(), s.skill_type, s.embedding_text()))
            .collect();
        self.index.rebuild(&entries)?;
        for skill in &skills {
            self.repo.mark_embedded(&skill.name)?;
        }
        info!(count = entries.len(), "index rebuilt from store");
        Ok(entries.len())
    }

    /// Upsert every skill into the existing index without discarding it.
    /// Lighter than a rebuild; does not reclaim tombstoned slots.
    pub fn sync(&self) -> Result<usize> {
        let skills = self.repo.list_skills(None, &[])?;
        for skill in &skills {
            self.index
                .add(&skill.name, skill.skill_type, &skill.embedding_text())?;
            self.repo.mark_embedded(&skill.name)?;
        }
        self.index.save()?;
        info!(count = skills.len(), "index synced from store");
        Ok(skills.len())
    }

    // ── Import / export ─────────────────────────────────────

    /// Write a skill to disk: YAML front matter (`name`, `description`,
    /// `skill_type`, `tags`, plus any keys preserved from import) followed
    /// by the content verbatim.
    pub fn export_skill(&self, name: &str, path: &Path) -> Result<()> {
        let skill = self.repo.get_skill(name)?;

        let mut mapping = serde_yaml_ng::Mapping::new();
        mapping.insert("name".into(), skill.name.clone().into());
        mapping.insert("description".into(), skill.description.clone().into());
        mapping.insert("skill_type".into(), skill.skill_type.as_str().into());
        mapping.insert(
            "tags".into(),
            serde_yaml_ng::Value::Sequence(
                skill.tags.iter().map(|t| t.clone().into()).collect(),
            ),
        );
        if let Some(meta) = self.repo.get_metadata(name)? {
            if let Some(extra) = meta.get("front_matter").and_then(|v| v.as_object()) {
                for (key, value) in extra {
                    let key = serde_yaml_ng::Value::from(key.clone());
                    if !mapping.contains_key(&key) {
                        mapping.insert(key, json_to_yaml(value));
                    }
                }
            }
        }

        let yaml = serde_yaml_ng::to_string(&mapping)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, format!("---\n{yaml}---\n{}", skill.content))?;
        info!(skill = %name, path = %path.display(), "exported skill");
        Ok(())
    }

    /// Import a skill file. Front matter supplies the metadata; without it
    /// the file stem becomes the name and the whole file the content.
    /// Fails with `DuplicateName` when the name is taken either way.
    pub fn import_skill_from_file(&self, path: &Path) -> Result<i64> {
        let (id, name) = self.import_file(path, self.config.auto_sync)?;
        info!(skill = %name, path = %path.display(), "imported skill");
        Ok(id)
    }

    /// Bulk import every `*.md` file in `dir` with auto-sync suspended,
    /// then rebuild the index once. An error on any file stops the import
    /// and surfaces; files already imported stay. Returns imported names.
    pub fn import_skills_from_dir(&self, dir: &Path) -> Result<Vec<String>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|x| x == "md").unwrap_or(false))
            .collect();
        paths.sort();

        let mut names = Vec::with_capacity(paths.len());
        for path in &paths {
            let (_, name) = self.import_file(path, false)?;
            names.push(name);
        }
        if !names.is_empty() {
            self.rebuild_index()?;
        }
        info!(count = names.len(), dir = %dir.display(), "bulk import finished");
        Ok(names)
    }

    fn import_file(&self, path: &Path, sync: bool) -> Result<(i64, String)> {
        let raw = fs::read_to_string(path)?;
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut skill = NewSkill {
            name: stem,
            content: raw.clone(),
            ..NewSkill::default()
        };
        let mut extras = serde_json::Map::new();

        if let Some((yaml, body)) = split_front_matter(&raw) {
            let mapping: serde_yaml_ng::Mapping = serde_yaml_ng::from_str(&yaml)?;
            skill.content = body;
            for (key, value) in &mapping {
                match key.as_str() {
                    Some("name") => {
                        if let Some(name) = value.as_str() {
                            skill.name = name.to_string();
                        }
                    }
                    Some("description") => {
                        skill.description = value.as_str().unwrap_or_default().to_string();
                    }
                    Some("skill_type") => {
                        let raw_type = value.as_str().unwrap_or_default();
                        skill.skill_type = SkillType::parse(raw_type)?;
                    }
                    Some("tags") => {
                        skill.tags = value
                            .as_sequence()
                            .map(|seq| {
                                seq.iter()
                                    .filter_map(|v| v.as_str().map(str::to_string))
                                    .collect()
                            })
                            .unwrap_or_default();
                    }
                    Some(other) => {
                        extras.insert(other.to_string(), yaml_to_json(value));
                    }
                    None => debug!("dropping non-string front matter key"),
                }
            }
        }

        let name = skill.name.clone();
        let id = self.repo.add_skill(&skill)?;
        if !extras.is_empty() {
            self.repo
                .set_metadata(&name, &serde_json::json!({ "front_matter": extras }))?;
        }
        if sync {
            self.sync_one(&name);
        }
        Ok((id, name))
    }

    // ── Statistics ──────────────────────────────────────────

    pub fn get_system_stats(&self) -> Result<SystemStats> {
        let skills = self.repo.list_skills(None, &[])?;
        let mut stats = SystemStats {
            total_skills: skills.len(),
            basic_skills: 0,
            composite_skills: 0,
            meta_skills: 0,
            total_usage: 0,
            total_success: 0,
            success_rate: 0.0,
            indexed_vectors: self.index.len(),
        };
        for skill in &skills {
            match skill.skill_type {
                SkillType::Basic => stats.basic_skills += 1,
                SkillType::Composite => stats.composite_skills += 1,
                SkillType::Meta => stats.meta_skills += 1,
            }
            stats.total_usage += skill.usage_count;
            stats.total_success += skill.success_count;
        }
        if stats.total_usage > 0 {
            stats.success_rate = stats.total_success as f64 / stats.total_usage as f64;
        }
        Ok(stats)
    }

    // ── Internals ───────────────────────────────────────────

    /// Best-effort vector upsert for one skill. Failures are logged, never
    /// propagated; `rebuild_index()` repairs the divergence later.
    fn sync_one(&self, name: &str) {
        let skill = match self.repo.get_skill(name) {
            Ok(s) => s,
            Err(e) => {
                warn!(skill = %name, error = %e, "skill vanished before vector sync");
                return;
            }
        };
        let result = self
            .index
            .add(&skill.name, skill.skill_type, &skill.embedding_text())
            .and_then(|()| self.index.save())
            .and_then(|()| self.repo.mark_embedded(&skill.name));
        if let Err(e) = result {
            warn!(
                skill = %name,
                error = %e,
                "vector sync failed; skill stored but not searchable until rebuild_index()"
            );
        }
    }
}

// ── Front matter ────────────────────────────────────────────

/// Split a skill file into `(yaml_front_matter, markdown_body)`.
///
/// Expected format:
/// ```text
/// ---
/// name: parse_json
/// skill_type: basic
/// ---
/// # Instructions…
/// ```
fn split_front_matter(content: &str) -> Option<(String, String)> {
    let trimmed = content.trim_start();
    if !trimmed.starts_with("---") {
        return None;
    }
    let after_open = &trimmed[3..];
    let after_open = after_open.strip_prefix('\n').unwrap_or(after_open);
    let close = after_open.find("\n---")?;

    let yaml = after_open[..close].to_string();
    let rest = &after_open[close + 4..];
    let body = rest.strip_prefix('\n').unwrap_or(rest).to_string();
    Some((yaml, body))
}

fn json_to_yaml(value: &serde_json::Value) -> serde_yaml_ng::Value {
    use serde_json::Value as Json;
    use serde_yaml_ng::Value as Yaml;
    match value {
        Json::Null => Yaml::Null,
        Json::Bool(b) => (*b).into(),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into()
            } else {
                n.as_f64().unwrap_or(0.0).into()
            }
        }
        Json::String(s) => s.clone().into(),
        Json::Array(items) => Yaml::Sequence(items.iter().map(json_to_yaml).collect()),
        Json::Object(map) => {
            let mut out = serde_yaml_ng::Mapping::new();
            for (k, v) in map {
                out.insert(k.clone().into(), json_to_yaml(v));
            }
            Yaml::Mapping(out)
        }
    }
}

fn yaml_to_json(value: &serde_yaml_ng::Value) -> serde_json::Value {
    use serde_json::Value as Json;
    use serde_yaml_ng::Value as Yaml;
    match value {
        Yaml::Null => Json::Null,
        Yaml::Bool(b) => Json::Bool(*b),
        Yaml::Number(n) => {
            if let Some(i) = n.as_i64() {
                Json::from(i)
            } else {
                n.as_f64().map(Json::from).unwrap_or(Json::Null)
            }
        }
        Yaml::String(s) => Json::String(s.clone()),
        Yaml::Sequence(items) => Json::Array(items.iter().map(yaml_to_json).collect()),
        Yaml::Mapping(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                if let Some(key) = k.as_str() {
                    out.insert(key.to_string(), yaml_to_json(v));
                }
            }
            Json::Object(out)
        }
        Yaml::Tagged(tagged) => yaml_to_json(&tagged.value),
    }
}

// ── Tests ───────────────────────────────────────────────────
