//! Engine error taxonomy.
//!
//! Every error that can cross a pillar boundary carries a stable wire code.
//! Component-local recovery (memory-only storage, snapshot rebuild, builder
//! lock release) is preferred; what escapes is serialized as
//! `{status, message, code}` with recovery guidance attached downstream.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing or malformed inputs; surfaced immediately with no state change.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// Path or pack id unknown; the caller may retry after an index rebuild.
    #[error("not found: {0}")]
    NotFound(String),

    /// Sensitive-file or budget policy denial; irrecoverable for this call.
    #[error("blocked: {0}")]
    Blocked(String),

    /// Cancelled by deadline; safe to retry with a wider budget.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Edit resolver found multiple candidates.
    #[error("ambiguous match: {0}")]
    AmbiguousMatch(String),

    /// Edit resolver found zero candidates.
    #[error("no match: {0}")]
    NoMatch(String),

    /// File drifted between plan and apply; the caller must refresh.
    #[error("hash mismatch: {0}")]
    HashMismatch(String),

    /// Analysis returned a conservative result; observable but not fatal.
    #[error("index stale: {0}")]
    IndexStale(String),

    /// Corruption or unrecoverable I/O. The owning component demotes itself
    /// (e.g. the store falls back to in-memory) and logs.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("storage: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

impl EngineError {
    /// Stable wire code for the pillar boundary.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidArgs(_) => "invalid_args",
            EngineError::NotFound(_) => "not_found",
            EngineError::Blocked(_) => "blocked",
            EngineError::Timeout(_) => "timeout",
            EngineError::AmbiguousMatch(_) => "ambiguous_match",
            EngineError::NoMatch(_) => "no_match",
            EngineError::HashMismatch(_) => "hash_mismatch",
            EngineError::IndexStale(_) => "index_stale",
            EngineError::Fatal(_) => "fatal",
            EngineError::Io(_) | EngineError::Storage(_) | EngineError::Serde(_) => "fatal",
        }
    }

    /// Pillar status bucket: `invalid_args`, `blocked`, or `failed`.
    pub fn status(&self) -> &'static str {
        match self {
            EngineError::InvalidArgs(_) => "invalid_args",
            EngineError::Blocked(_) => "blocked",
            _ => "failed",
        }
    }

    pub fn to_wire(&self) -> WireError {
        WireError {
            status: self.status().to_string(),
            message: self.to_string(),
            code: self.code().to_string(),
        }
    }
}

/// The `{status, message, code}` shape surfaced across pillar boundaries.
#[derive(Debug, Clone, Serialize)]
pub struct WireError {
    pub status: String,
    pub message: String,
    pub code: String,
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(EngineError::InvalidArgs("x".into()).code(), "invalid_args");
        assert_eq!(EngineError::Blocked("x".into()).code(), "blocked");
        assert_eq!(EngineError::HashMismatch("x".into()).code(), "hash_mismatch");
        assert_eq!(EngineError::Timeout("x".into()).status(), "failed");
        assert_eq!(EngineError::InvalidArgs("x".into()).status(), "invalid_args");
    }

    #[test]
    fn test_wire_shape() {
        let wire = EngineError::NoMatch("edit target".into()).to_wire();
        assert_eq!(wire.code, "no_match");
        assert_eq!(wire.status, "failed");
        assert!(wire.message.contains("edit target"));
    }
}
