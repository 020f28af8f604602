//! Core data model: skills, tiers, versions and execution records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How much of a skill's text feeds the embedder.
pub const EMBED_TEXT_CAP: usize = 4096;

/// Skill tier — the role a skill plays in a composed plan, not a storage
/// distinction. `basic` skills are atomic, `composite` ones span several
/// steps, `meta` ones orchestrate other skills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillType {
    Basic,
    Composite,
    Meta,
}

impl SkillType {
    pub const ALL: [SkillType; 3] = [SkillType::Basic, SkillType::Composite, SkillType::Meta];

    pub fn as_str(&self) -> &'static str {
        match self {
            SkillType::Basic => "basic",
            SkillType::Composite => "composite",
            SkillType::Meta => "meta",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "basic" => Ok(SkillType::Basic),
            "composite" => Ok(SkillType::Composite),
            "meta" => Ok(SkillType::Meta),
            other => Err(Error::InvalidType(other.to_string())),
        }
    }

    /// Ordering rank used by the composer: lower ranks sort first so that
    /// dependency-bearing tiers come before orchestration tiers.
    pub fn rank(&self) -> u8 {
        match self {
            SkillType::Basic => 0,
            SkillType::Composite => 1,
            SkillType::Meta => 2,
        }
    }
}

impl Default for SkillType {
    fn default() -> Self {
        SkillType::Basic
    }
}

impl fmt::Display for SkillType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A hydrated skill record, including tags and dependency names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub id: i64,
    pub name: String,
    pub skill_type: SkillType,
    pub description: String,
    /// Full markdown body; also the embedding source.
    pub content: String,
    pub version: i64,
    pub usage_count: u64,
    pub success_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl Skill {
    /// Text fed to the embedder: name, description and body, capped at
    /// [`EMBED_TEXT_CAP`] characters.
    pub fn embedding_text(&self) -> String {
        embedding_text(&self.name, &self.description, &self.content)
    }

    pub fn success_rate(&self) -> f64 {
        if self.usage_count == 0 {
            0.0
        } else {
            self.success_count as f64 / self.usage_count as f64
        }
    }
}

/// Build the canonical embedding input for a skill.
pub fn embedding_text(name: &str, description: &str, content: &str) -> String {
    let mut text = format!("{name}\n{description}\n{content}");
    if text.len() > EMBED_TEXT_CAP {
        let mut end = EMBED_TEXT_CAP;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

/// Input for creating a skill.
#[derive(Debug, Clone, Default)]
pub struct NewSkill {
    pub name: String,
    pub content: String,
    pub skill_type: SkillType,
    pub description: String,
    pub tags: Vec<String>,
    pub dependencies: Vec<String>,
}

impl NewSkill {
    pub fn new(name: impl Into<String>, content: impl Into<String>, skill_type: SkillType) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            skill_type,
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// Immutable historical snapshot of a skill's content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillVersion {
    pub version: i64,
    pub content: String,
    pub change_description: String,
    pub created_at: DateTime<Utc>,
}

/// One line of a per-skill execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

/// Aggregated execution statistics for one skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillStats {
    pub usage_count: u64,
    pub success_count: u64,
    pub success_rate: f64,
    /// Exponential moving average (α = 0.2) over recorded execution times.
    pub avg_execution_ms: Option<f64>,
    pub last_execution_at: Option<DateTime<Utc>>,
}

/// Bank-wide totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStats {
    pub total_skills: usize,
    pub basic_skills: usize,
    pub composite_skills: usize,
    pub meta_skills: usize,
    pub total_usage: u64,
    pub total_success: u64,
    /// `total_success / total_usage`, or 0 when nothing has run yet.
    pub success_rate: f64,
    /// Live entries in the vector index.
    pub indexed_vectors: usize,
}

// ── Tests ───────────────────────────────────────────────────
