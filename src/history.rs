//! Append-only per-skill execution logs.
//!
//! One JSONL file per skill under `<storage_dir>/history/`, named after the
//! sanitized skill name. Appends write a single newline-terminated JSON
//! object in one `write_all` call; tail reads tolerate a missing file and
//! skip lines that no longer parse.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use tracing::debug;

use crate::error::Result;
use crate::skill::ExecutionRecord;

/// Make a skill name safe as a file name by replacing path separators
/// (and the Windows drive separator) with underscores.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect()
}

/// Writer/reader for the per-skill history directory.
#[derive(Debug, Clone)]
pub struct HistoryLog {
    dir: PathBuf,
}

impl HistoryLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Log file path for a skill.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", sanitize_name(name)))
    }

    /// Append one record, creating the directory and file on first write.
    pub fn append(&self, name: &str, record: &ExecutionRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let path = self.path_for(name);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        debug!(skill = %name, "appended execution record");
        Ok(())
    }

    /// Read the last `limit` records for a skill. A missing file reads as
    /// an empty history; malformed lines are skipped.
    pub fn tail(&self, name: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let path = self.path_for(name);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records: Vec<ExecutionRecord> = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();
        if records.len() > limit {
            records.drain(..records.len() - limit);
        }
        Ok(records)
    }

    /// Remove a skill's log file. Idempotent.
    pub fn remove(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.path_for(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────
