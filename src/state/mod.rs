//! Persistent replication state.
//!
//! Tracks fetch and publish progress per repository, package and version so
//! a run can resume where the previous one stopped. One [`StateStore`]
//! contract, chosen once at startup:
//! - [`SqliteStateStore`]: single local file (or in-memory when caching is off)
//! - [`KvStateStore`] over [`DynamoTable`]: hosted table-set
//! - [`DryRunStore`]: wraps either and suppresses writes

pub mod db;
pub mod dry_run;
pub mod dynamo;
pub mod error;
pub mod keys;
pub mod kv;
pub mod schema;
pub mod types;

pub use db::{SqliteStateStore, StateStore};
pub use dry_run::DryRunStore;
pub use dynamo::DynamoTable;
pub use error::StateError;
pub use kv::KvStateStore;
pub use types::{FailedVersion, RepositoryState, VersionOrigin};
