//! State store trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};

use super::error::StateError;
use super::schema;
use super::types::{FailedVersion, RepositoryState, VersionOrigin};

/// Backend-agnostic replication bookkeeping.
///
/// Object-safe so a single backend can be chosen at startup and shared as
/// `Arc<dyn StateStore>` across concurrent package tasks. Every write is
/// self-contained; callers never hold a transaction across calls.
///
/// A package's root entry (no version) means "package known"; its
/// completeness flags live there. Flag updates on entries that don't exist
/// are no-ops.
#[async_trait]
pub trait StateStore: Send + Sync {
    // ── Writes ──

    /// Insert the repository if absent.
    async fn ensure_repository(&self, repo: &str) -> Result<(), StateError>;

    /// Insert the package root if absent.
    async fn ensure_package(&self, repo: &str, pkg: &str) -> Result<(), StateError>;

    /// Insert the version (and its package root) if absent. A requested
    /// version seen again by enumeration becomes discovered; a discovered
    /// one never goes back to requested.
    async fn ensure_package_version(
        &self,
        repo: &str,
        pkg: &str,
        version: &str,
        origin: VersionOrigin,
    ) -> Result<(), StateError>;

    async fn mark_all_versions_fetched(&self, repo: &str, pkg: &str) -> Result<(), StateError>;

    async fn mark_all_versions_published(&self, repo: &str, pkg: &str)
        -> Result<(), StateError>;

    async fn mark_repo_all_versions_fetched(&self, repo: &str) -> Result<(), StateError>;

    /// Also clears the repository's failure flag.
    async fn mark_repo_all_versions_published(&self, repo: &str) -> Result<(), StateError>;

    /// Create the version if missing, mark it published and clear any
    /// previous failure.
    async fn mark_version_published(
        &self,
        repo: &str,
        pkg: &str,
        version: &str,
    ) -> Result<(), StateError>;

    /// Record a failed publish on the version and flag the repository.
    async fn mark_publish_failed(
        &self,
        repo: &str,
        pkg: &str,
        version: &str,
        error: &str,
    ) -> Result<(), StateError>;

    /// Clear fetch and publish completeness for the repository and the
    /// package roots under it.
    async fn reset_fetch_state(&self, repo: &str) -> Result<(), StateError>;

    /// Drop all state and recreate the empty layout.
    async fn wipe(&self) -> Result<(), StateError>;

    // ── Queries ──

    async fn repository_state(&self, repo: &str) -> Result<Option<RepositoryState>, StateError>;

    async fn package_exists(&self, repo: &str, pkg: &str) -> Result<bool, StateError>;

    async fn version_exists(&self, repo: &str, pkg: &str, version: &str)
        -> Result<bool, StateError>;

    async fn all_versions_fetched(&self, repo: &str, pkg: &str) -> Result<bool, StateError>;

    async fn all_versions_published(&self, repo: &str, pkg: &str) -> Result<bool, StateError>;

    async fn version_published(
        &self,
        repo: &str,
        pkg: &str,
        version: &str,
    ) -> Result<bool, StateError>;

    /// Package names in the repository, sorted.
    async fn list_packages(&self, repo: &str) -> Result<Vec<String>, StateError>;

    /// Versions found by enumerating the source, sorted. Pinned versions
    /// the enumeration never saw are left out.
    async fn list_discovered_versions(&self, repo: &str, pkg: &str) -> Result<Vec<String>, StateError>;

    /// Versions currently failed, sorted by package then version.
    async fn list_failed_versions(&self, repo: &str) -> Result<Vec<FailedVersion>, StateError>;
}

/// SQLite implementation of the state store.
pub struct SqliteStateStore {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    /// Path to the database file (for error messages).
    path: PathBuf,
}

impl std::fmt::Debug for SqliteStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStateStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteStateStore {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            if let Some(parent) = path_clone.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| StateError::query("open", e))?;
                }
            }
            let conn = Connection::open(&path_clone).map_err(|e| StateError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            // WAL so status queries don't block a running replication
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StateError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StateError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, StateError>(conn)
        })
        .await??;

        tracing::debug!(path = %path.display(), "Opened state database");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Open a throwaway in-memory database. Used when caching is disabled
    /// and by tests.
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().map_err(|e| StateError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Run `f` against the locked connection, tagging any error with
    /// `operation`.
    fn with_conn<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StateError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StateError::query(operation, e))?;
        f(&conn).map_err(|e| StateError::query(operation, e))
    }

    /// Like `with_conn`, but inside a transaction.
    fn in_transaction(
        &self,
        operation: &'static str,
        f: impl FnOnce(&Connection) -> rusqlite::Result<()>,
    ) -> Result<(), StateError> {
        self.with_conn(operation, |conn| {
            conn.execute("BEGIN TRANSACTION", [])?;
            match f(conn) {
                Ok(()) => {
                    conn.execute("COMMIT", [])?;
                    Ok(())
                }
                Err(e) => {
                    let _ = conn.execute("ROLLBACK", []);
                    Err(e)
                }
            }
        })
    }
}

fn insert_repository(conn: &Connection, repo: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO repositories (repository) VALUES (?1)",
        [repo],
    )?;
    Ok(())
}

fn insert_root(conn: &Connection, repo: &str, pkg: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO packages (repository, package, version, updated_at) VALUES (?1, ?2, '', ?3)",
        rusqlite::params![repo, pkg, Utc::now().timestamp()],
    )?;
    Ok(())
}

fn insert_version(
    conn: &Connection,
    repo: &str,
    pkg: &str,
    version: &str,
    origin: VersionOrigin,
) -> rusqlite::Result<()> {
    insert_root(conn, repo, pkg)?;
    conn.execute(
        "INSERT OR IGNORE INTO packages (repository, package, version, origin, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![repo, pkg, version, origin.as_str(), Utc::now().timestamp()],
    )?;
    Ok(())
}

/// Read a boolean column from the package root; missing root reads false.
fn root_flag(conn: &Connection, column: &str, repo: &str, pkg: &str) -> rusqlite::Result<bool> {
    let sql = format!(
        "SELECT {} FROM packages WHERE repository = ?1 AND package = ?2 AND version = ''",
        column
    );
    Ok(conn
        .query_row(&sql, [repo, pkg], |row| row.get(0))
        .optional()?
        .unwrap_or(false))
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn ensure_repository(&self, repo: &str) -> Result<(), StateError> {
        self.with_conn("ensure_repository", |conn| insert_repository(conn, repo))
    }

    async fn ensure_package(&self, repo: &str, pkg: &str) -> Result<(), StateError> {
        self.with_conn("ensure_package", |conn| insert_root(conn, repo, pkg))
    }

    async fn ensure_package_version(
        &self,
        repo: &str,
        pkg: &str,
        version: &str,
        origin: VersionOrigin,
    ) -> Result<(), StateError> {
        self.in_transaction("ensure_package_version", |conn| {
            insert_version(conn, repo, pkg, version, origin)?;
            if origin == VersionOrigin::Discovered {
                conn.execute(
                    "UPDATE packages SET origin = ?4 WHERE repository = ?1 AND package = ?2 AND version = ?3",
                    rusqlite::params![repo, pkg, version, origin.as_str()],
                )?;
            }
            Ok(())
        })
    }

    async fn mark_all_versions_fetched(&self, repo: &str, pkg: &str) -> Result<(), StateError> {
        self.with_conn("mark_all_versions_fetched", |conn| {
            conn.execute(
                "UPDATE packages SET all_versions_fetched = 1 WHERE repository = ?1 AND package = ?2 AND version = ''",
                [repo, pkg],
            )?;
            Ok(())
        })
    }

    async fn mark_all_versions_published(
        &self,
        repo: &str,
        pkg: &str,
    ) -> Result<(), StateError> {
        self.with_conn("mark_all_versions_published", |conn| {
            conn.execute(
                "UPDATE packages SET all_versions_published = 1 WHERE repository = ?1 AND package = ?2 AND version = ''",
                [repo, pkg],
            )?;
            Ok(())
        })
    }

    async fn mark_repo_all_versions_fetched(&self, repo: &str) -> Result<(), StateError> {
        self.with_conn("mark_repo_all_versions_fetched", |conn| {
            conn.execute(
                "UPDATE repositories SET all_versions_fetched = 1 WHERE repository = ?1",
                [repo],
            )?;
            Ok(())
        })
    }

    async fn mark_repo_all_versions_published(&self, repo: &str) -> Result<(), StateError> {
        self.with_conn("mark_repo_all_versions_published", |conn| {
            conn.execute(
                "UPDATE repositories SET all_versions_published = 1, publish_failed = 0 WHERE repository = ?1",
                [repo],
            )?;
            Ok(())
        })
    }

    async fn mark_version_published(
        &self,
        repo: &str,
        pkg: &str,
        version: &str,
    ) -> Result<(), StateError> {
        self.in_transaction("mark_version_published", |conn| {
            insert_version(conn, repo, pkg, version, VersionOrigin::Discovered)?;
            conn.execute(
                "UPDATE packages SET published = 1, publish_failed = 0, publish_error = NULL, updated_at = ?4 WHERE repository = ?1 AND package = ?2 AND version = ?3",
                rusqlite::params![repo, pkg, version, Utc::now().timestamp()],
            )?;
            Ok(())
        })
    }

    async fn mark_publish_failed(
        &self,
        repo: &str,
        pkg: &str,
        version: &str,
        error: &str,
    ) -> Result<(), StateError> {
        self.in_transaction("mark_publish_failed", |conn| {
            insert_repository(conn, repo)?;
            insert_version(conn, repo, pkg, version, VersionOrigin::Discovered)?;
            conn.execute(
                "UPDATE packages SET published = 0, publish_failed = 1, publish_error = ?4, updated_at = ?5 WHERE repository = ?1 AND package = ?2 AND version = ?3",
                rusqlite::params![repo, pkg, version, error, Utc::now().timestamp()],
            )?;
            conn.execute(
                "UPDATE repositories SET publish_failed = 1 WHERE repository = ?1",
                [repo],
            )?;
            Ok(())
        })
    }

    async fn reset_fetch_state(&self, repo: &str) -> Result<(), StateError> {
        self.in_transaction("reset_fetch_state", |conn| {
            conn.execute(
                "UPDATE repositories SET all_versions_fetched = 0, all_versions_published = 0 WHERE repository = ?1",
                [repo],
            )?;
            conn.execute(
                "UPDATE packages SET all_versions_fetched = 0, all_versions_published = 0 WHERE repository = ?1 AND version = ''",
                [repo],
            )?;
            Ok(())
        })
    }

    async fn wipe(&self) -> Result<(), StateError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StateError::query("wipe", e))?;
        schema::recreate(&conn)?;
        tracing::info!(path = %self.path.display(), "Wiped state database");
        Ok(())
    }

    async fn repository_state(&self, repo: &str) -> Result<Option<RepositoryState>, StateError> {
        self.with_conn("repository_state", |conn| {
            conn.query_row(
                "SELECT all_versions_fetched, all_versions_published, publish_failed FROM repositories WHERE repository = ?1",
                [repo],
                |row| {
                    Ok(RepositoryState {
                        all_versions_fetched: row.get(0)?,
                        all_versions_published: row.get(1)?,
                        publish_failed: row.get(2)?,
                    })
                },
            )
            .optional()
        })
    }

    async fn package_exists(&self, repo: &str, pkg: &str) -> Result<bool, StateError> {
        self.with_conn("package_exists", |conn| {
            conn.query_row(
                "SELECT 1 FROM packages WHERE repository = ?1 AND package = ?2 AND version = ''",
                [repo, pkg],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
        })
    }

    async fn version_exists(
        &self,
        repo: &str,
        pkg: &str,
        version: &str,
    ) -> Result<bool, StateError> {
        self.with_conn("version_exists", |conn| {
            conn.query_row(
                "SELECT 1 FROM packages WHERE repository = ?1 AND package = ?2 AND version = ?3 AND version <> ''",
                [repo, pkg, version],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
        })
    }

    async fn all_versions_fetched(&self, repo: &str, pkg: &str) -> Result<bool, StateError> {
        self.with_conn("all_versions_fetched", |conn| {
            root_flag(conn, "all_versions_fetched", repo, pkg)
        })
    }

    async fn all_versions_published(&self, repo: &str, pkg: &str) -> Result<bool, StateError> {
        self.with_conn("all_versions_published", |conn| {
            root_flag(conn, "all_versions_published", repo, pkg)
        })
    }

    async fn version_published(
        &self,
        repo: &str,
        pkg: &str,
        version: &str,
    ) -> Result<bool, StateError> {
        self.with_conn("version_published", |conn| {
            Ok(conn
                .query_row(
                    "SELECT published FROM packages WHERE repository = ?1 AND package = ?2 AND version = ?3 AND version <> ''",
                    [repo, pkg, version],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(false))
        })
    }

    async fn list_packages(&self, repo: &str) -> Result<Vec<String>, StateError> {
        self.with_conn("list_packages", |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT DISTINCT package FROM packages WHERE repository = ?1 ORDER BY package",
            )?;
            let packages = stmt
                .query_map([repo], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(packages)
        })
    }

    async fn list_discovered_versions(&self, repo: &str, pkg: &str) -> Result<Vec<String>, StateError> {
        self.with_conn("list_discovered_versions", |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT version FROM packages WHERE repository = ?1 AND package = ?2 AND version <> '' AND origin = ?3 ORDER BY version",
            )?;
            let versions = stmt
                .query_map([repo, pkg, VersionOrigin::Discovered.as_str()], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(versions)
        })
    }

    async fn list_failed_versions(&self, repo: &str) -> Result<Vec<FailedVersion>, StateError> {
        self.with_conn("list_failed_versions", |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT package, version, publish_error, updated_at FROM packages WHERE repository = ?1 AND publish_failed = 1 AND version <> '' ORDER BY package, version",
            )?;
            let failed = stmt
                .query_map([repo], |row| {
                    let updated_at: Option<i64> = row.get(3)?;
                    Ok(FailedVersion {
                        package: row.get(0)?,
                        version: row.get(1)?,
                        error: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        failed_at: updated_at.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(failed)
        })
    }
}
