//! Relational skill store — SQLite behind a single mutex.
//!
//! Sole owner of structured persistent state: skills, version history,
//! dependency edges, tags, per-skill counters. Every multi-row write runs
//! in one transaction; a failure aborts the whole operation with no
//! visible side effect. Safe for concurrent readers and a single writer
//! per process.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::history::sanitize_name;
use crate::skill::{NewSkill, Skill, SkillStats, SkillType, SkillVersion};

/// Weight of the newest sample in the execution-time moving average.
pub const EMA_ALPHA: f64 = 0.2;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS skills (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    name          TEXT NOT NULL UNIQUE,
    skill_type    TEXT NOT NULL CHECK (skill_type IN ('basic','composite','meta')),
    description   TEXT NOT NULL DEFAULT '',
    content       TEXT NOT NULL,
    version       INTEGER NOT NULL DEFAULT 1 CHECK (version >= 1),
    usage_count   INTEGER NOT NULL DEFAULT 0 CHECK (usage_count >= 0),
    success_count INTEGER NOT NULL DEFAULT 0
        CHECK (success_count >= 0 AND success_count <= usage_count),
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS skill_versions (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    skill_id           INTEGER NOT NULL REFERENCES skills(id) ON DELETE CASCADE,
    version            INTEGER NOT NULL,
    content            TEXT NOT NULL,
    change_description TEXT NOT NULL DEFAULT '',
    created_at         TEXT NOT NULL,
    UNIQUE (skill_id, version)
);
CREATE TABLE IF NOT EXISTS skill_dependencies (
    skill_id            INTEGER NOT NULL REFERENCES skills(id) ON DELETE CASCADE,
    depends_on_skill_id INTEGER NOT NULL REFERENCES skills(id) ON DELETE CASCADE,
    type                TEXT NOT NULL DEFAULT 'required',
    PRIMARY KEY (skill_id, depends_on_skill_id)
);
CREATE TABLE IF NOT EXISTS skill_tags (
    skill_id INTEGER NOT NULL REFERENCES skills(id) ON DELETE CASCADE,
    tag      TEXT NOT NULL,
    PRIMARY KEY (skill_id, tag)
);
CREATE TABLE IF NOT EXISTS skill_metadata (
    skill_id                  INTEGER PRIMARY KEY REFERENCES skills(id) ON DELETE CASCADE,
    embeddings_updated_at     TEXT,
    last_execution_at         TEXT,
    average_execution_time_ms REAL,
    metadata_json             TEXT
);
CREATE INDEX IF NOT EXISTS idx_skills_type ON skills(skill_type);
CREATE INDEX IF NOT EXISTS idx_deps_reverse ON skill_dependencies(depends_on_skill_id);
";

/// SQLite-backed skill store.
pub struct Repository {
    conn: Mutex<Connection>,
}

impl Repository {
    /// Open (or create) the database at `db_path`, applying pragmas and the
    /// schema idempotently.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── CRUD ────────────────────────────────────────────────

    /// Create a skill atomically: main row, version 1, dependency edges,
    /// tags and an empty metadata row. Returns the new id.
    pub fn add_skill(&self, skill: &NewSkill) -> Result<i64> {
        if skill.name.trim().is_empty() {
            return Err(Error::IntegrityViolation("skill name must not be empty".into()));
        }
        let mut conn = self.conn.lock().expect("skills db poisoned");
        let tx = conn.transaction()?;

        if lookup_id(&tx, &skill.name)?.is_some() {
            return Err(Error::DuplicateName(skill.name.clone()));
        }
        // Names that sanitize to the same history file must not coexist.
        let sanitized = sanitize_name(&skill.name);
        let mut stmt = tx.prepare("SELECT name FROM skills")?;
        let clash = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .any(|existing| sanitize_name(&existing) == sanitized);
        drop(stmt);
        if clash {
            return Err(Error::DuplicateName(skill.name.clone()));
        }

        let mut dep_ids = Vec::with_capacity(skill.dependencies.len());
        for dep in &skill.dependencies {
            match lookup_id(&tx, dep)? {
                Some(id) => dep_ids.push(id),
                None => {
                    return Err(Error::UnknownDependency {
                        skill: skill.name.clone(),
                        dependency: dep.clone(),
                    })
                }
            }
        }

        let now = Utc::now();
        tx.execute(
            "INSERT INTO skills (name, skill_type, description, content, version,
                                 usage_count, success_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1, 0, 0, ?5, ?5)",
            params![
                skill.name,
                skill.skill_type.as_str(),
                skill.description,
                skill.content,
                now
            ],
        )?;
        let id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO skill_versions (skill_id, version, content, change_description, created_at)
             VALUES (?1, 1, ?2, 'Initial version', ?3)",
            params![id, skill.content, now],
        )?;
        for dep_id in &dep_ids {
            tx.execute(
                "INSERT INTO skill_dependencies (skill_id, depends_on_skill_id) VALUES (?1, ?2)",
                params![id, dep_id],
            )?;
        }
        for tag in &skill.tags {
            tx.execute(
                "INSERT OR IGNORE INTO skill_tags (skill_id, tag) VALUES (?1, ?2)",
                params![id, tag],
            )?;
        }
        tx.execute(
            "INSERT INTO skill_metadata (skill_id) VALUES (?1)",
            params![id],
        )?;
        tx.commit()?;

        info!(skill = %skill.name, id, skill_type = %skill.skill_type, "added skill");
        Ok(id)
    }

    /// Bump a skill to a new version: snapshot the new content in the
    /// version history and overwrite the main row. Returns the new version.
    pub fn update_skill(
        &self,
        name: &str,
        new_content: &str,
        change_description: Option<&str>,
    ) -> Result<i64> {
        let mut conn = self.conn.lock().expect("skills db poisoned");
        let tx = conn.transaction()?;

        let (id, version): (i64, i64) = tx
            .query_row(
                "SELECT id, version FROM skills WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| Error::UnknownSkill(name.to_string()))?;

        let new_version = version + 1;
        let now = Utc::now();
        tx.execute(
            "INSERT INTO skill_versions (skill_id, version, content, change_description, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, new_version, new_content, change_description.unwrap_or(""), now],
        )?;
        tx.execute(
            "UPDATE skills SET content = ?1, version = ?2, updated_at = ?3 WHERE id = ?4",
            params![new_content, new_version, now, id],
        )?;
        tx.commit()?;

        info!(skill = %name, version = new_version, "updated skill");
        Ok(new_version)
    }

    /// Delete a skill and everything hanging off it (versions, edges in
    /// both directions, tags, metadata). Returns `false` for absent names.
    pub fn delete_skill(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("skills db poisoned");
        let deleted = conn.execute("DELETE FROM skills WHERE name = ?1", params![name])?;
        if deleted > 0 {
            info!(skill = %name, "deleted skill");
        }
        Ok(deleted > 0)
    }

    /// Fetch one hydrated skill (tags and dependency names included).
    pub fn get_skill(&self, name: &str) -> Result<Skill> {
        let conn = self.conn.lock().expect("skills db poisoned");
        let row = conn
            .query_row(
                "SELECT id, name, skill_type, description, content, version,
                        usage_count, success_count, created_at, updated_at
                 FROM skills WHERE name = ?1",
                params![name],
                raw_skill_row,
            )
            .optional()?
            .ok_or_else(|| Error::UnknownSkill(name.to_string()))?;
        hydrate(&conn, row)
    }

    /// List skills, optionally restricted to one tier and to skills
    /// carrying every requested tag. Ordered by name.
    pub fn list_skills(
        &self,
        skill_type: Option<SkillType>,
        tags: &[String],
    ) -> Result<Vec<Skill>> {
        let conn = self.conn.lock().expect("skills db poisoned");
        let mut stmt;
        let rows: Vec<RawSkill> = match skill_type {
            Some(st) => {
                stmt = conn.prepare(
                    "SELECT id, name, skill_type, description, content, version,
                            usage_count, success_count, created_at, updated_at
                     FROM skills WHERE skill_type = ?1 ORDER BY name",
                )?;
                stmt.query_map(params![st.as_str()], raw_skill_row)?
                    .collect::<rusqlite::Result<_>>()?
            }
            None => {
                stmt = conn.prepare(
                    "SELECT id, name, skill_type, description, content, version,
                            usage_count, success_count, created_at, updated_at
                     FROM skills ORDER BY name",
                )?;
                stmt.query_map([], raw_skill_row)?
                    .collect::<rusqlite::Result<_>>()?
            }
        };

        let mut skills = Vec::with_capacity(rows.len());
        for row in rows {
            let skill = hydrate(&conn, row)?;
            if tags.iter().all(|t| skill.tags.iter().any(|st| st == t)) {
                skills.push(skill);
            }
        }
        Ok(skills)
    }

    /// All skill names, ordered.
    pub fn list_names(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("skills db poisoned");
        let mut stmt = conn.prepare("SELECT name FROM skills ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(names)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().expect("skills db poisoned");
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM skills", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    // ── Versions ────────────────────────────────────────────

    /// Full version history, oldest first.
    pub fn get_versions(&self, name: &str) -> Result<Vec<SkillVersion>> {
        let conn = self.conn.lock().expect("skills db poisoned");
        let id = lookup_id(&conn, name)?.ok_or_else(|| Error::UnknownSkill(name.to_string()))?;
        let mut stmt = conn.prepare(
            "SELECT version, content, change_description, created_at
             FROM skill_versions WHERE skill_id = ?1 ORDER BY version",
        )?;
        let versions = stmt
            .query_map(params![id], |row| {
                Ok(SkillVersion {
                    version: row.get(0)?,
                    content: row.get(1)?,
                    change_description: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(versions)
    }

    // ── Dependencies and tags ───────────────────────────────

    /// Replace a skill's outgoing dependency edges atomically.
    pub fn set_dependencies(&self, name: &str, deps: &[String]) -> Result<()> {
        let mut conn = self.conn.lock().expect("skills db poisoned");
        let tx = conn.transaction()?;
        let id = lookup_id(&tx, name)?.ok_or_else(|| Error::UnknownSkill(name.to_string()))?;

        let mut dep_ids = Vec::with_capacity(deps.len());
        for dep in deps {
            if dep == name {
                return Err(Error::IntegrityViolation(format!(
                    "skill {name:?} cannot depend on itself"
                )));
            }
            match lookup_id(&tx, dep)? {
                Some(dep_id) => dep_ids.push(dep_id),
                None => {
                    return Err(Error::UnknownDependency {
                        skill: name.to_string(),
                        dependency: dep.clone(),
                    })
                }
            }
        }

        tx.execute(
            "DELETE FROM skill_dependencies WHERE skill_id = ?1",
            params![id],
        )?;
        for dep_id in &dep_ids {
            tx.execute(
                "INSERT OR IGNORE INTO skill_dependencies (skill_id, depends_on_skill_id)
                 VALUES (?1, ?2)",
                params![id, dep_id],
            )?;
        }
        tx.execute(
            "UPDATE skills SET updated_at = ?1 WHERE id = ?2",
            params![Utc::now(), id],
        )?;
        tx.commit()?;
        debug!(skill = %name, deps = deps.len(), "replaced dependencies");
        Ok(())
    }

    /// Names of skills that depend on `name`.
    pub fn get_dependents(&self, name: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("skills db poisoned");
        let id = lookup_id(&conn, name)?.ok_or_else(|| Error::UnknownSkill(name.to_string()))?;
        let mut stmt = conn.prepare(
            "SELECT s.name FROM skill_dependencies d
             JOIN skills s ON s.id = d.skill_id
             WHERE d.depends_on_skill_id = ?1 ORDER BY s.name",
        )?;
        let names = stmt
            .query_map(params![id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(names)
    }

    // ── Execution statistics ────────────────────────────────

    /// Record one execution: bump `usage_count` (and `success_count` on
    /// success), fold `elapsed_ms` into the α = 0.2 moving average (the
    /// first sample seeds it) and stamp `last_execution_at`. One
    /// transaction; the history log append is the caller's concern.
    pub fn record_execution(
        &self,
        name: &str,
        success: bool,
        elapsed_ms: Option<f64>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().expect("skills db poisoned");
        let tx = conn.transaction()?;

        let (id, prior_avg): (i64, Option<f64>) = tx
            .query_row(
                "SELECT s.id, m.average_execution_time_ms
                 FROM skills s LEFT JOIN skill_metadata m ON m.skill_id = s.id
                 WHERE s.name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| Error::UnknownSkill(name.to_string()))?;

        let now = Utc::now();
        tx.execute(
            "UPDATE skills SET usage_count = usage_count + 1,
                               success_count = success_count + ?1,
                               updated_at = ?2
             WHERE id = ?3",
            params![success as i64, now, id],
        )?;

        let avg = match (prior_avg, elapsed_ms) {
            (Some(a), Some(e)) => Some(EMA_ALPHA * e + (1.0 - EMA_ALPHA) * a),
            (None, Some(e)) => Some(e),
            (prior, None) => prior,
        };
        tx.execute(
            "INSERT INTO skill_metadata (skill_id, last_execution_at, average_execution_time_ms)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(skill_id) DO UPDATE
             SET last_execution_at = ?2, average_execution_time_ms = ?3",
            params![id, now, avg],
        )?;
        tx.commit()?;
        debug!(skill = %name, success, "recorded execution");
        Ok(())
    }

    /// Aggregated execution statistics for one skill.
    pub fn get_stats(&self, name: &str) -> Result<SkillStats> {
        let conn = self.conn.lock().expect("skills db poisoned");
        let stats = conn
            .query_row(
                "SELECT s.usage_count, s.success_count,
                        m.average_execution_time_ms, m.last_execution_at
                 FROM skills s LEFT JOIN skill_metadata m ON m.skill_id = s.id
                 WHERE s.name = ?1",
                params![name],
                |row| {
                    let usage: i64 = row.get(0)?;
                    let success: i64 = row.get(1)?;
                    Ok(SkillStats {
                        usage_count: usage as u64,
                        success_count: success as u64,
                        success_rate: if usage == 0 {
                            0.0
                        } else {
                            success as f64 / usage as f64
                        },
                        avg_execution_ms: row.get(2)?,
                        last_execution_at: row.get(3)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| Error::UnknownSkill(name.to_string()))?;
        Ok(stats)
    }

    // ── Metadata ────────────────────────────────────────────

    /// Stamp `embeddings_updated_at`; called after a successful vector sync.
    pub fn mark_embedded(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().expect("skills db poisoned");
        let id = lookup_id(&conn, name)?.ok_or_else(|| Error::UnknownSkill(name.to_string()))?;
        conn.execute(
            "INSERT INTO skill_metadata (skill_id, embeddings_updated_at)
             VALUES (?1, ?2)
             ON CONFLICT(skill_id) DO UPDATE SET embeddings_updated_at = ?2",
            params![id, Utc::now()],
        )?;
        Ok(())
    }

    /// Store the free-form metadata blob for a skill.
    pub fn set_metadata(&self, name: &str, value: &serde_json::Value) -> Result<()> {
        let conn = self.conn.lock().expect("skills db poisoned");
        let id = lookup_id(&conn, name)?.ok_or_else(|| Error::UnknownSkill(name.to_string()))?;
        conn.execute(
            "INSERT INTO skill_metadata (skill_id, metadata_json)
             VALUES (?1, ?2)
             ON CONFLICT(skill_id) DO UPDATE SET metadata_json = ?2",
            params![id, serde_json::to_string(value)?],
        )?;
        Ok(())
    }

    pub fn get_metadata(&self, name: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock().expect("skills db poisoned");
        let id = lookup_id(&conn, name)?.ok_or_else(|| Error::UnknownSkill(name.to_string()))?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT metadata_json FROM skill_metadata WHERE skill_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

// ── Row helpers ─────────────────────────────────────────────

struct RawSkill {
    id: i64,
    name: String,
    skill_type: String,
    description: String,
    content: String,
    version: i64,
    usage_count: i64,
    success_count: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn raw_skill_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSkill> {
    Ok(RawSkill {
        id: row.get(0)?,
        name: row.get(1)?,
        skill_type: row.get(2)?,
        description: row.get(3)?,
        content: row.get(4)?,
        version: row.get(5)?,
        usage_count: row.get(6)?,
        success_count: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn lookup_id(conn: &Connection, name: &str) -> Result<Option<i64>> {
    Ok(conn
        .query_row("SELECT id FROM skills WHERE name = ?1", params![name], |r| {
            r.get(0)
        })
        .optional()?)
}

fn hydrate(conn: &Connection, raw: RawSkill) -> Result<Skill> {
    let mut stmt = conn.prepare("SELECT tag FROM skill_tags WHERE skill_id = ?1 ORDER BY tag")?;
    let tags = stmt
        .query_map(params![raw.id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    let mut stmt = conn.prepare(
        "SELECT s.name FROM skill_dependencies d
         JOIN skills s ON s.id = d.depends_on_skill_id
         WHERE d.skill_id = ?1 ORDER BY s.name",
    )?;
    let dependencies = stmt
        .query_map(params![raw.id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    Ok(Skill {
        id: raw.id,
        name: raw.name,
        skill_type: SkillType::parse(&raw.skill_type)?,
        description: raw.description,
        content: raw.content,
        version: raw.version,
        usage_count: raw.usage_count as u64,
        success_count: raw.success_count as u64,
        created_at: raw.created_at,
        updated_at: raw.updated_at,
        tags,
        dependencies,
    })
}

// ── Tests ───────────────────────────────────────────────────
