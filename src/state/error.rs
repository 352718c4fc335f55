//! Error types for the state store.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by either state backend. Always fatal for the run.
#[derive(Error, Debug)]
pub enum StateError {
    /// Failed to open or create the database file.
    #[error("Failed to open state database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// Failed to run a database migration.
    #[error("State database migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    /// A read or write failed.
    #[error("State store operation '{operation}' failed: {message}")]
    Query {
        operation: &'static str,
        message: String,
    },

    /// Failed to spawn a blocking task.
    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    /// The database schema version is newer than supported.
    #[error("State database schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },
}

impl StateError {
    pub fn query(operation: &'static str, source: impl std::fmt::Display) -> Self {
        Self::Query {
            operation,
            message: source.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_names_operation() {
        let err = StateError::query("mark_version_published", "disk I/O error");
        assert_eq!(
            err.to_string(),
            "State store operation 'mark_version_published' failed: disk I/O error"
        );
    }
}
