//! skillbank — skills management core for AI agents.
//!
//! Stores reusable skill documents in SQLite with full version history,
//! keeps an approximate nearest-neighbor index over their embeddings, and
//! composes dependency-ordered skill sequences for natural-language tasks.
//!
//! Everything lives under a single `storage_dir`:
//!
//! ```text
//! storage_dir/
//!   skills.db              relational store
//!   index/
//!     skills.index         vector entry table
//!     skills_mapping       name ↔ slot map
//!   history/
//!     <skill_name>.jsonl   append-only per-skill execution log
//! ```
//!
//! [`SkillManager`] is the single entry point; one instance per
//! `storage_dir` per process. Callers wanting write parallelism use
//! distinct storage directories.

pub mod composer;
pub mod config;
pub mod embed;
pub mod error;
pub mod history;
pub mod index;
pub mod manager;
pub mod repository;
pub mod skill;

pub use composer::{CoverageReport, Plan, PlanStep, TieredHits, Validation};
pub use config::SkillbankConfig;
pub use error::{Error, Result};
pub use manager::{SearchHit, SkillManager};
pub use skill::{ExecutionRecord, NewSkill, Skill, SkillStats, SkillType, SkillVersion, SystemStats};
