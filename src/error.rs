//! Crate-wide error taxonomy.
//!
//! Repository errors surface verbatim through the manager; vector errors are
//! downgraded to warnings on the auto-sync path and only propagate from the
//! explicit index operations (`sync`, `rebuild_index`, direct queries).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Operation references a skill name that is not in the store.
    #[error("unknown skill: {0}")]
    UnknownSkill(String),

    /// Insert attempted with a name that already exists (possibly only
    /// after filesystem sanitization).
    #[error("skill name already in use: {0}")]
    DuplicateName(String),

    /// `skill_type` outside `basic | composite | meta`.
    #[error("invalid skill type: {0:?}")]
    InvalidType(String),

    /// A declared dependency does not exist at insert time.
    #[error("skill {skill:?} depends on unknown skill {dependency:?}")]
    UnknownDependency { skill: String, dependency: String },

    /// Constraint or cascade failure surfaced by the store.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// The vector index has no free slots left.
    #[error("vector index full ({capacity} slots); rebuild to reclaim space")]
    CapacityExceeded { capacity: usize },

    /// The embedding backend could not be constructed or invoked.
    #[error("embedding backend unavailable: {0}")]
    VectorUnavailable(String),

    /// Index or mapping file exists but cannot be decoded.
    #[error("corrupt index state: {0}")]
    Corruption(String),

    /// File I/O failure on history, export or import paths.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// Any other storage-engine error.
    #[error("storage error: {0}")]
    Storage(rusqlite::Error),

    /// Serialization failure (history records, front matter, index files).
    #[error("serialization error: {0}")]
    Serialize(String),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, msg)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::IntegrityViolation(
                    msg.clone().unwrap_or_else(|| code.to_string()),
                )
            }
            _ => Error::Storage(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialize(err.to_string())
    }
}

impl From<serde_yaml_ng::Error> for Error {
    fn from(err: serde_yaml_ng::Error) -> Self {
        Error::Serialize(err.to_string())
    }
}
