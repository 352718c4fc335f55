//! Destination registry: where versions are published to.

pub mod codeartifact;
pub mod error;
pub mod upload;

use std::path::Path;

use async_trait::async_trait;

use crate::package::{PackageDescriptor, PackageKind};

pub use codeartifact::CodeArtifactRegistry;
pub use error::DestinationError;

/// Short-lived credential for data-plane uploads.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(pub String);

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthToken(..)")
    }
}

/// What the destination reports for one package version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionStatus {
    NotFound,
    /// Fully ingested and visible to consumers.
    Published,
    /// Present in some other state (unfinished, archived...).
    Other(String),
}

impl std::fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => f.write_str("not found"),
            Self::Published => f.write_str("Published"),
            Self::Other(status) => f.write_str(status),
        }
    }
}

/// One file to publish as part of a version.
#[derive(Debug)]
pub struct UploadRequest<'a> {
    pub package: &'a PackageDescriptor,
    pub version: &'a str,
    pub file: &'a Path,
    /// Full source manifest, for kinds that publish through one.
    pub manifest: Option<&'a serde_json::Value>,
}

/// Commands and queries against the downstream registry. Each call makes a
/// single attempt; callers wrap calls in their retry policy.
#[async_trait]
pub trait DestinationRegistry: Send + Sync {
    async fn list_repositories(&self) -> Result<Vec<String>, DestinationError>;

    async fn create_repository(&self, name: &str) -> Result<(), DestinationError>;

    /// Base URL uploads for `kind` go to, with a trailing slash.
    async fn repository_endpoint(
        &self,
        name: &str,
        kind: PackageKind,
    ) -> Result<String, DestinationError>;

    async fn authorization_token(&self) -> Result<AuthToken, DestinationError>;

    async fn describe_version(
        &self,
        package: &PackageDescriptor,
        version: &str,
    ) -> Result<VersionStatus, DestinationError>;

    async fn delete_version(
        &self,
        package: &PackageDescriptor,
        version: &str,
    ) -> Result<(), DestinationError>;

    async fn upload_binary(
        &self,
        token: &AuthToken,
        request: &UploadRequest<'_>,
    ) -> Result<(), DestinationError>;

    /// Ask the registry to move the version to published.
    async fn finalize_status(
        &self,
        package: &PackageDescriptor,
        version: &str,
    ) -> Result<(), DestinationError>;
}
