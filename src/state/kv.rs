//! Hosted key-value state backend.
//!
//! Two tables per table-set: `packages` (hash key `packagekey`) holding both
//! package roots and versions, and `repositories` (hash key `repositorykey`).
//! Roots carry `repository` + `package` and versions carry
//! `repositorypackage` + `version`, so each secondary index stays sparse:
//! packages-by-repository only sees roots, versions-by-package only sees
//! versions.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{TimeZone, Utc};

use super::db::StateStore;
use super::error::StateError;
use super::keys;
use super::types::{FailedVersion, RepositoryState, VersionOrigin};

pub type Item = HashMap<String, AttributeValue>;

const ATTR_REPOSITORY: &str = "repository";
const ATTR_PACKAGE: &str = "package";
const ATTR_VERSION: &str = "version";
const ATTR_REPOSITORY_PACKAGE: &str = "repositorypackage";
const ATTR_ORIGIN: &str = "origin";
const ATTR_ALL_FETCHED: &str = "allversionsfetched";
const ATTR_ALL_PUBLISHED: &str = "allversionspublished";
const ATTR_PUBLISHED: &str = "published";
const ATTR_PUBLISH_FAILED: &str = "publishfailed";
const ATTR_PUBLISH_ERROR: &str = "publisherror";
const ATTR_UPDATED_AT: &str = "updatedat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Packages,
    Repositories,
}

impl Table {
    pub fn key_attribute(&self) -> &'static str {
        match self {
            Self::Packages => "packagekey",
            Self::Repositories => "repositorykey",
        }
    }

    /// Suffix appended to the table-set name.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Packages => "packages",
            Self::Repositories => "repositories",
        }
    }
}

/// Secondary indexes on the packages table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Index {
    PackagesByRepository,
    VersionsByPackage,
}

impl Index {
    pub const ALL: [Index; 2] = [Index::PackagesByRepository, Index::VersionsByPackage];

    pub fn hash_attribute(&self) -> &'static str {
        match self {
            Self::PackagesByRepository => ATTR_REPOSITORY,
            Self::VersionsByPackage => ATTR_REPOSITORY_PACKAGE,
        }
    }

    pub fn range_attribute(&self) -> &'static str {
        match self {
            Self::PackagesByRepository => ATTR_PACKAGE,
            Self::VersionsByPackage => ATTR_VERSION,
        }
    }

    /// Suffix appended to the packages table name.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::PackagesByRepository => "repositories",
            Self::VersionsByPackage => "versions",
        }
    }
}

/// Minimal item-level operations the key-value store needs from a hosted
/// table service.
#[async_trait]
pub trait ItemTable: Send + Sync {
    /// Create both tables and their indexes if missing, and wait until
    /// they're usable.
    async fn ensure_tables(&self) -> Result<(), StateError>;

    async fn drop_tables(&self) -> Result<(), StateError>;

    async fn get_item(&self, table: Table, key: &str) -> Result<Option<Item>, StateError>;

    /// Returns false when an item with the same key already exists.
    async fn put_if_absent(&self, table: Table, item: Item) -> Result<bool, StateError>;

    /// Set and remove attributes on an existing item. Returns false when
    /// no item has this key.
    async fn update_existing(
        &self,
        table: Table,
        key: &str,
        set: Item,
        remove: &[&str],
    ) -> Result<bool, StateError>;

    /// All items whose index hash attribute equals `hash_value`, ordered by
    /// the index range attribute.
    async fn query_index(&self, index: Index, hash_value: &str) -> Result<Vec<Item>, StateError>;
}

fn s(value: impl Into<String>) -> AttributeValue {
    AttributeValue::S(value.into())
}

fn now() -> AttributeValue {
    AttributeValue::N(Utc::now().timestamp().to_string())
}

fn flag(item: &Item, attr: &str) -> bool {
    item.get(attr)
        .and_then(|v| v.as_bool().ok())
        .copied()
        .unwrap_or(false)
}

fn string(item: &Item, attr: &str) -> Option<String> {
    item.get(attr).and_then(|v| v.as_s().ok()).cloned()
}

fn item(pairs: Vec<(&str, AttributeValue)>) -> Item {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// State store over any [`ItemTable`].
pub struct KvStateStore<T> {
    table: T,
}

impl<T: ItemTable> KvStateStore<T> {
    /// Wrap `table`, creating the table-set if it doesn't exist yet.
    pub async fn open(table: T) -> Result<Self, StateError> {
        table.ensure_tables().await?;
        Ok(Self { table })
    }

    async fn put_root(&self, repo: &str, pkg: &str) -> Result<(), StateError> {
        self.table
            .put_if_absent(
                Table::Packages,
                item(vec![
                    (Table::Packages.key_attribute(), s(keys::package_key(repo, pkg))),
                    (ATTR_REPOSITORY, s(repo)),
                    (ATTR_PACKAGE, s(pkg)),
                    (ATTR_ALL_FETCHED, AttributeValue::Bool(false)),
                    (ATTR_ALL_PUBLISHED, AttributeValue::Bool(false)),
                    (ATTR_UPDATED_AT, now()),
                ]),
            )
            .await?;
        Ok(())
    }

    async fn put_version(
        &self,
        repo: &str,
        pkg: &str,
        version: &str,
        origin: VersionOrigin,
    ) -> Result<bool, StateError> {
        self.put_root(repo, pkg).await?;
        self.table
            .put_if_absent(
                Table::Packages,
                item(vec![
                    (
                        Table::Packages.key_attribute(),
                        s(keys::version_key(repo, pkg, version)),
                    ),
                    (ATTR_REPOSITORY_PACKAGE, s(keys::repository_package(repo, pkg))),
                    (ATTR_PACKAGE, s(pkg)),
                    (ATTR_VERSION, s(version)),
                    (ATTR_ORIGIN, s(origin.as_str())),
                    (ATTR_PUBLISHED, AttributeValue::Bool(false)),
                    (ATTR_PUBLISH_FAILED, AttributeValue::Bool(false)),
                    (ATTR_UPDATED_AT, now()),
                ]),
            )
            .await
    }

    async fn set_root_flags(
        &self,
        repo: &str,
        pkg: &str,
        flags: Vec<(&str, AttributeValue)>,
    ) -> Result<(), StateError> {
        self.table
            .update_existing(
                Table::Packages,
                &keys::package_key(repo, pkg),
                item(flags),
                &[],
            )
            .await?;
        Ok(())
    }

    async fn set_repository_flags(
        &self,
        repo: &str,
        flags: Vec<(&str, AttributeValue)>,
    ) -> Result<(), StateError> {
        self.table
            .update_existing(
                Table::Repositories,
                &keys::repository_key(repo),
                item(flags),
                &[],
            )
            .await?;
        Ok(())
    }

    async fn root(&self, repo: &str, pkg: &str) -> Result<Option<Item>, StateError> {
        self.table
            .get_item(Table::Packages, &keys::package_key(repo, pkg))
            .await
    }

    async fn version(&self, repo: &str, pkg: &str, version: &str) -> Result<Option<Item>, StateError> {
        self.table
            .get_item(Table::Packages, &keys::version_key(repo, pkg, version))
            .await
    }

    async fn version_items(&self, repo: &str, pkg: &str) -> Result<Vec<Item>, StateError> {
        self.table
            .query_index(
                Index::VersionsByPackage,
                &keys::repository_package(repo, pkg),
            )
            .await
    }
}

#[async_trait]
impl<T: ItemTable> StateStore for KvStateStore<T> {
    async fn ensure_repository(&self, repo: &str) -> Result<(), StateError> {
        self.table
            .put_if_absent(
                Table::Repositories,
                item(vec![
                    (Table::Repositories.key_attribute(), s(keys::repository_key(repo))),
                    (ATTR_REPOSITORY, s(repo)),
                    (ATTR_ALL_FETCHED, AttributeValue::Bool(false)),
                    (ATTR_ALL_PUBLISHED, AttributeValue::Bool(false)),
                    (ATTR_PUBLISH_FAILED, AttributeValue::Bool(false)),
                ]),
            )
            .await?;
        Ok(())
    }

    async fn ensure_package(&self, repo: &str, pkg: &str) -> Result<(), StateError> {
        self.put_root(repo, pkg).await
    }

    async fn ensure_package_version(
        &self,
        repo: &str,
        pkg: &str,
        version: &str,
        origin: VersionOrigin,
    ) -> Result<(), StateError> {
        let inserted = self.put_version(repo, pkg, version, origin).await?;
        if !inserted && origin == VersionOrigin::Discovered {
            self.table
                .update_existing(
                    Table::Packages,
                    &keys::version_key(repo, pkg, version),
                    item(vec![(ATTR_ORIGIN, s(origin.as_str()))]),
                    &[],
                )
                .await?;
        }
        Ok(())
    }

    async fn mark_all_versions_fetched(&self, repo: &str, pkg: &str) -> Result<(), StateError> {
        self.set_root_flags(repo, pkg, vec![(ATTR_ALL_FETCHED, AttributeValue::Bool(true))])
            .await
    }

    async fn mark_all_versions_published(
        &self,
        repo: &str,
        pkg: &str,
    ) -> Result<(), StateError> {
        self.set_root_flags(repo, pkg, vec![(ATTR_ALL_PUBLISHED, AttributeValue::Bool(true))])
            .await
    }

    async fn mark_repo_all_versions_fetched(&self, repo: &str) -> Result<(), StateError> {
        self.set_repository_flags(repo, vec![(ATTR_ALL_FETCHED, AttributeValue::Bool(true))])
            .await
    }

    async fn mark_repo_all_versions_published(&self, repo: &str) -> Result<(), StateError> {
        self.set_repository_flags(
            repo,
            vec![
                (ATTR_ALL_PUBLISHED, AttributeValue::Bool(true)),
                (ATTR_PUBLISH_FAILED, AttributeValue::Bool(false)),
            ],
        )
        .await
    }

    async fn mark_version_published(
        &self,
        repo: &str,
        pkg: &str,
        version: &str,
    ) -> Result<(), StateError> {
        self.put_version(repo, pkg, version, VersionOrigin::Discovered)
            .await?;
        self.table
            .update_existing(
                Table::Packages,
                &keys::version_key(repo, pkg, version),
                item(vec![
                    (ATTR_PUBLISHED, AttributeValue::Bool(true)),
                    (ATTR_PUBLISH_FAILED, AttributeValue::Bool(false)),
                    (ATTR_UPDATED_AT, now()),
                ]),
                &[ATTR_PUBLISH_ERROR],
            )
            .await?;
        Ok(())
    }

    async fn mark_publish_failed(
        &self,
        repo: &str,
        pkg: &str,
        version: &str,
        error: &str,
    ) -> Result<(), StateError> {
        self.ensure_repository(repo).await?;
        self.put_version(repo, pkg, version, VersionOrigin::Discovered)
            .await?;
        self.table
            .update_existing(
                Table::Packages,
                &keys::version_key(repo, pkg, version),
                item(vec![
                    (ATTR_PUBLISHED, AttributeValue::Bool(false)),
                    (ATTR_PUBLISH_FAILED, AttributeValue::Bool(true)),
                    (ATTR_PUBLISH_ERROR, s(error)),
                    (ATTR_UPDATED_AT, now()),
                ]),
                &[],
            )
            .await?;
        self.set_repository_flags(repo, vec![(ATTR_PUBLISH_FAILED, AttributeValue::Bool(true))])
            .await
    }

    async fn reset_fetch_state(&self, repo: &str) -> Result<(), StateError> {
        let cleared = || {
            vec![
                (ATTR_ALL_FETCHED, AttributeValue::Bool(false)),
                (ATTR_ALL_PUBLISHED, AttributeValue::Bool(false)),
            ]
        };
        self.set_repository_flags(repo, cleared()).await?;
        for pkg in self.list_packages(repo).await? {
            self.set_root_flags(repo, &pkg, cleared()).await?;
        }
        Ok(())
    }

    async fn wipe(&self) -> Result<(), StateError> {
        self.table.drop_tables().await?;
        self.table.ensure_tables().await?;
        tracing::info!("Wiped key-value state tables");
        Ok(())
    }

    async fn repository_state(&self, repo: &str) -> Result<Option<RepositoryState>, StateError> {
        let item = self
            .table
            .get_item(Table::Repositories, &keys::repository_key(repo))
            .await?;
        Ok(item.map(|item| RepositoryState {
            all_versions_fetched: flag(&item, ATTR_ALL_FETCHED),
            all_versions_published: flag(&item, ATTR_ALL_PUBLISHED),
            publish_failed: flag(&item, ATTR_PUBLISH_FAILED),
        }))
    }

    async fn package_exists(&self, repo: &str, pkg: &str) -> Result<bool, StateError> {
        Ok(self.root(repo, pkg).await?.is_some())
    }

    async fn version_exists(
        &self,
        repo: &str,
        pkg: &str,
        version: &str,
    ) -> Result<bool, StateError> {
        Ok(self.version(repo, pkg, version).await?.is_some())
    }

    async fn all_versions_fetched(&self, repo: &str, pkg: &str) -> Result<bool, StateError> {
        Ok(self
            .root(repo, pkg)
            .await?
            .is_some_and(|item| flag(&item, ATTR_ALL_FETCHED)))
    }

    async fn all_versions_published(&self, repo: &str, pkg: &str) -> Result<bool, StateError> {
        Ok(self
            .root(repo, pkg)
            .await?
            .is_some_and(|item| flag(&item, ATTR_ALL_PUBLISHED)))
    }

    async fn version_published(
        &self,
        repo: &str,
        pkg: &str,
        version: &str,
    ) -> Result<bool, StateError> {
        Ok(self
            .version(repo, pkg, version)
            .await?
            .is_some_and(|item| flag(&item, ATTR_PUBLISHED)))
    }

    async fn list_packages(&self, repo: &str) -> Result<Vec<String>, StateError> {
        let mut packages: Vec<String> = self
            .table
            .query_index(Index::PackagesByRepository, repo)
            .await?
            .iter()
            .filter_map(|item| string(item, ATTR_PACKAGE))
            .collect();
        packages.sort();
        packages.dedup();
        Ok(packages)
    }

    async fn list_discovered_versions(&self, repo: &str, pkg: &str) -> Result<Vec<String>, StateError> {
        let mut versions: Vec<String> = self
            .version_items(repo, pkg)
            .await?
            .iter()
            .filter(|item| {
                string(item, ATTR_ORIGIN).as_deref() == Some(VersionOrigin::Discovered.as_str())
            })
            .filter_map(|item| string(item, ATTR_VERSION))
            .collect();
        versions.sort();
        versions.dedup();
        Ok(versions)
    }

    async fn list_failed_versions(&self, repo: &str) -> Result<Vec<FailedVersion>, StateError> {
        let mut failed = Vec::new();
        for pkg in self.list_packages(repo).await? {
            for item in self.version_items(repo, &pkg).await? {
                if !flag(&item, ATTR_PUBLISH_FAILED) {
                    continue;
                }
                let Some(version) = string(&item, ATTR_VERSION) else {
                    continue;
                };
                let failed_at = item
                    .get(ATTR_UPDATED_AT)
                    .and_then(|v| v.as_n().ok())
                    .and_then(|n| n.parse::<i64>().ok())
                    .and_then(|ts| Utc.timestamp_opt(ts, 0).single());
                failed.push(FailedVersion {
                    package: pkg.clone(),
                    version,
                    error: string(&item, ATTR_PUBLISH_ERROR).unwrap_or_default(),
                    failed_at,
                });
            }
        }
        failed.sort_by(|a, b| (&a.package, &a.version).cmp(&(&b.package, &b.version)));
        Ok(failed)
    }
}
