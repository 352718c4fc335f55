//! SQLite schema definitions and migrations.

use rusqlite::Connection;

use super::error::StateError;

/// Current schema version. Increment when making schema changes.
pub const SCHEMA_VERSION: i32 = 1;

/// Package root rows carry `version = ''`; every other row is one version.
const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS repositories (
    repository TEXT PRIMARY KEY NOT NULL,
    all_versions_fetched INTEGER NOT NULL DEFAULT 0,
    all_versions_published INTEGER NOT NULL DEFAULT 0,
    publish_failed INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS packages (
    repository TEXT NOT NULL,
    package TEXT NOT NULL,
    version TEXT NOT NULL DEFAULT '',
    origin TEXT NOT NULL DEFAULT 'discovered',
    all_versions_fetched INTEGER NOT NULL DEFAULT 0,
    all_versions_published INTEGER NOT NULL DEFAULT 0,
    published INTEGER NOT NULL DEFAULT 0,
    publish_failed INTEGER NOT NULL DEFAULT 0,
    publish_error TEXT,
    updated_at INTEGER,
    PRIMARY KEY (repository, package, version)
);

CREATE INDEX IF NOT EXISTS idx_packages_failed ON packages(repository, publish_failed);
"#;

const DROP_ALL: &str = r#"
DROP TABLE IF EXISTS packages;
DROP TABLE IF EXISTS repositories;
"#;

/// Get the current schema version from the database.
pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32, StateError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StateError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

/// Initialize or migrate the database schema. Idempotent.
pub(crate) fn migrate(conn: &Connection) -> Result<(), StateError> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(StateError::UnsupportedSchemaVersion {
            found: current_version,
            expected: SCHEMA_VERSION,
        });
    }

    if current_version < SCHEMA_VERSION {
        conn.execute_batch(SCHEMA_V1)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
        tracing::debug!("Initialized state schema at version {}", SCHEMA_VERSION);
    }

    Ok(())
}

/// Drop every table and recreate the empty layout.
pub(crate) fn recreate(conn: &Connection) -> Result<(), StateError> {
    conn.execute_batch(DROP_ALL)?;
    set_schema_version(conn, 0)?;
    migrate(conn)
}
