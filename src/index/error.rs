//! Error types for the local index.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("failed to open index at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error("migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    #[error("query failed: {0}")]
    Query(String),

    #[error("blocking task failed: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    #[error("unsupported schema version {found} (expected <= {expected})")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },
}

impl IndexError {
    /// Convert a rusqlite error into a Query error with context.
    pub fn query(e: rusqlite::Error) -> Self {
        Self::Query(e.to_string())
    }
}
