//! Source inventory: where packages and binaries are read from.

pub mod artifactory;
pub mod error;

use std::path::Path;

use async_trait::async_trait;

use crate::package::{PackageDescriptor, PackageKind};

pub use artifactory::ArtifactoryClient;
pub use error::SourceError;

/// One row of the source's repository summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositorySummary {
    pub key: String,
    /// `LOCAL`, `REMOTE`, `VIRTUAL`...
    pub repo_type: String,
    /// Package-manager format as the source spells it.
    pub package_type: String,
}

impl RepositorySummary {
    /// Only locally hosted repositories are authoritative for their content.
    pub fn is_local(&self) -> bool {
        self.repo_type.eq_ignore_ascii_case("LOCAL")
    }

    pub fn kind(&self) -> Option<PackageKind> {
        PackageKind::from_source_type(&self.package_type)
    }
}

/// Read-only queries against the upstream repository service.
#[async_trait]
pub trait SourceInventory: Send + Sync {
    /// Every repository the service knows about.
    async fn repositories(&self) -> Result<Vec<RepositorySummary>, SourceError>;

    /// Every file path in the repository, relative to its root.
    async fn repository_files(&self, repo: &str) -> Result<Vec<String>, SourceError>;

    async fn package_exists(&self, repo: &str, pkg: &str) -> Result<bool, SourceError>;

    /// Download URIs of every file filed under the package, all versions.
    async fn package_binaries(&self, package: &PackageDescriptor)
        -> Result<Vec<String>, SourceError>;

    /// Stream one binary into `dest`, returning the bytes written.
    async fn fetch_binary(&self, uri: &str, dest: &Path) -> Result<u64, SourceError>;

    /// Package manifest document for registries that publish one.
    async fn package_manifest(
        &self,
        repo: &str,
        pkg: &str,
    ) -> Result<serde_json::Value, SourceError>;
}
