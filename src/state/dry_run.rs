//! Read-through, write-suppressing state store decorator for dry runs.

use std::sync::Arc;

use async_trait::async_trait;

use super::db::StateStore;
use super::error::StateError;
use super::types::{FailedVersion, RepositoryState, VersionOrigin};

/// Answers queries from the wrapped store and logs every write instead of
/// performing it.
pub struct DryRunStore {
    inner: Arc<dyn StateStore>,
}

impl DryRunStore {
    pub fn new(inner: Arc<dyn StateStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl StateStore for DryRunStore {
    async fn ensure_repository(&self, repo: &str) -> Result<(), StateError> {
        tracing::debug!(repository = %repo, "[DRY RUN] Would record repository");
        Ok(())
    }

    async fn ensure_package(&self, repo: &str, pkg: &str) -> Result<(), StateError> {
        tracing::debug!(repository = %repo, package = %pkg, "[DRY RUN] Would record package");
        Ok(())
    }

    async fn ensure_package_version(
        &self,
        repo: &str,
        pkg: &str,
        version: &str,
        origin: VersionOrigin,
    ) -> Result<(), StateError> {
        tracing::debug!(
            repository = %repo,
            package = %pkg,
            version = %version,
            origin = origin.as_str(),
            "[DRY RUN] Would record version"
        );
        Ok(())
    }

    async fn mark_all_versions_fetched(&self, repo: &str, pkg: &str) -> Result<(), StateError> {
        tracing::info!(repository = %repo, package = %pkg, "[DRY RUN] Would mark all versions fetched");
        Ok(())
    }

    async fn mark_all_versions_published(
        &self,
        repo: &str,
        pkg: &str,
    ) -> Result<(), StateError> {
        tracing::info!(repository = %repo, package = %pkg, "[DRY RUN] Would mark all versions published");
        Ok(())
    }

    async fn mark_repo_all_versions_fetched(&self, repo: &str) -> Result<(), StateError> {
        tracing::info!(repository = %repo, "[DRY RUN] Would mark repository fetched");
        Ok(())
    }

    async fn mark_repo_all_versions_published(&self, repo: &str) -> Result<(), StateError> {
        tracing::info!(repository = %repo, "[DRY RUN] Would mark repository published");
        Ok(())
    }

    async fn mark_version_published(
        &self,
        repo: &str,
        pkg: &str,
        version: &str,
    ) -> Result<(), StateError> {
        tracing::info!(
            repository = %repo,
            package = %pkg,
            version = %version,
            "[DRY RUN] Would mark version published"
        );
        Ok(())
    }

    async fn mark_publish_failed(
        &self,
        repo: &str,
        pkg: &str,
        version: &str,
        error: &str,
    ) -> Result<(), StateError> {
        tracing::info!(
            repository = %repo,
            package = %pkg,
            version = %version,
            error = %error,
            "[DRY RUN] Would mark version failed"
        );
        Ok(())
    }

    async fn reset_fetch_state(&self, repo: &str) -> Result<(), StateError> {
        tracing::info!(repository = %repo, "[DRY RUN] Would reset fetch state");
        Ok(())
    }

    async fn wipe(&self) -> Result<(), StateError> {
        tracing::info!("[DRY RUN] Would wipe all cached state");
        Ok(())
    }

    async fn repository_state(&self, repo: &str) -> Result<Option<RepositoryState>, StateError> {
        self.inner.repository_state(repo).await
    }

    async fn package_exists(&self, repo: &str, pkg: &str) -> Result<bool, StateError> {
        self.inner.package_exists(repo, pkg).await
    }

    async fn version_exists(
        &self,
        repo: &str,
        pkg: &str,
        version: &str,
    ) -> Result<bool, StateError> {
        self.inner.version_exists(repo, pkg, version).await
    }

    async fn all_versions_fetched(&self, repo: &str, pkg: &str) -> Result<bool, StateError> {
        self.inner.all_versions_fetched(repo, pkg).await
    }

    async fn all_versions_published(&self, repo: &str, pkg: &str) -> Result<bool, StateError> {
        self.inner.all_versions_published(repo, pkg).await
    }

    async fn version_published(
        &self,
        repo: &str,
        pkg: &str,
        version: &str,
    ) -> Result<bool, StateError> {
        self.inner.version_published(repo, pkg, version).await
    }

    async fn list_packages(&self, repo: &str) -> Result<Vec<String>, StateError> {
        self.inner.list_packages(repo).await
    }

    async fn list_discovered_versions(&self, repo: &str, pkg: &str) -> Result<Vec<String>, StateError> {
        self.inner.list_discovered_versions(repo, pkg).await
    }

    async fn list_failed_versions(&self, repo: &str) -> Result<Vec<FailedVersion>, StateError> {
        self.inner.list_failed_versions(repo).await
    }
}
