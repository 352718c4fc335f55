//! Per-package reconciliation.
//!
//! For one package (or one pinned version of it) the engine works out which
//! versions still need publishing, moves each one through
//! check → replace/upload → verify, and records the result. A single
//! version's failure is recorded and never aborts the package; only state
//! store errors escape. Log lines go through the caller's progress bar.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use indicatif::ProgressBar;

use crate::destination::{AuthToken, DestinationRegistry, UploadRequest, VersionStatus};
use crate::package::{has_unsafe_chars, PackageDescriptor};
use crate::resolver;
use crate::retry::RetryPolicy;
use crate::source::SourceInventory;
use crate::state::{StateError, StateStore, VersionOrigin};

/// Separator between multiple transport errors in one failure record.
const ERROR_SEPARATOR: &str = " -- ";

/// How one version ended this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionOutcome {
    /// Already published, by cache or by destination.
    SkippedPublished,
    /// Uploaded and confirmed published.
    Published,
    /// Recorded as failed with this error.
    Failed(String),
    /// Dry run: actions logged, nothing verified.
    DryRun,
}

impl VersionOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, Self::SkippedPublished | Self::Published)
    }
}

/// Result of one package-level replication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageReport {
    pub package: String,
    pub outcomes: Vec<(String, VersionOutcome)>,
    /// Every version processed this pass ended published (vacuously true
    /// for a package with no versions).
    pub all_published: bool,
}

impl PackageReport {
    fn unresolved(package: &PackageDescriptor) -> Self {
        Self {
            package: package.path.clone(),
            outcomes: Vec::new(),
            all_published: false,
        }
    }
}

/// Lazily fetched per-package source data, shared by all versions of the
/// package in one pass.
#[derive(Default)]
struct SourceListing {
    binaries: Option<Vec<String>>,
    manifest: Option<serde_json::Value>,
}

pub struct Engine {
    state: Arc<dyn StateStore>,
    source: Arc<dyn SourceInventory>,
    destination: Arc<dyn DestinationRegistry>,
    retry: RetryPolicy,
    scratch_dir: PathBuf,
    dry_run: bool,
}

impl Engine {
    pub fn new(
        state: Arc<dyn StateStore>,
        source: Arc<dyn SourceInventory>,
        destination: Arc<dyn DestinationRegistry>,
        retry: RetryPolicy,
        scratch_dir: PathBuf,
        dry_run: bool,
    ) -> Self {
        Self {
            state,
            source,
            destination,
            retry,
            scratch_dir,
            dry_run,
        }
    }

    /// Replicate every version of `package` the source has.
    pub async fn replicate_package(
        &self,
        package: PackageDescriptor,
        token: &AuthToken,
        progress: &ProgressBar,
    ) -> Result<PackageReport, StateError> {
        let (repo, pkg) = (package.repository.as_str(), package.path.as_str());
        self.state.ensure_package(repo, pkg).await?;

        if self.state.all_versions_published(repo, pkg).await? {
            progress.suspend(|| {
                tracing::info!(repository = %repo, package = %pkg, "All versions already published, skipping")
            });
            return Ok(PackageReport {
                package: package.path.clone(),
                outcomes: Vec::new(),
                all_published: true,
            });
        }

        let mut listing = SourceListing::default();
        let versions = if self.state.all_versions_fetched(repo, pkg).await? {
            progress.suspend(|| {
                tracing::debug!(repository = %repo, package = %pkg, "Using cached version list")
            });
            self.state.list_discovered_versions(repo, pkg).await?
        } else {
            let binaries = match self.binaries(&package, &mut listing).await {
                Ok(binaries) => binaries.to_vec(),
                Err(e) => {
                    progress.suspend(|| {
                        tracing::warn!(repository = %repo, package = %pkg, error = %e, "Failed to list binaries")
                    });
                    return Ok(PackageReport::unresolved(&package));
                }
            };
            let versions = resolver::resolve_versions(&package, &binaries);
            for version in &versions {
                self.state
                    .ensure_package_version(repo, pkg, version, VersionOrigin::Discovered)
                    .await?;
            }
            self.state.mark_all_versions_fetched(repo, pkg).await?;
            versions
        };

        let mut outcomes = Vec::with_capacity(versions.len());
        for version in versions {
            let outcome = self
                .replicate_version(&package, &version, VersionOrigin::Discovered, token, progress, &mut listing)
                .await?;
            outcomes.push((version, outcome));
        }

        let all_published = outcomes.iter().all(|(_, o)| o.is_published());
        if all_published {
            self.state.mark_all_versions_published(repo, pkg).await?;
            progress.suspend(|| {
                tracing::info!(repository = %repo, package = %pkg, "All versions published")
            });
        }
        Ok(PackageReport {
            package: package.path.clone(),
            outcomes,
            all_published,
        })
    }

    /// Replicate one explicitly requested version. Never touches the
    /// package root's completeness flags.
    pub async fn replicate_pinned_version(
        &self,
        package: PackageDescriptor,
        version: &str,
        token: &AuthToken,
        progress: &ProgressBar,
    ) -> Result<PackageReport, StateError> {
        self.state
            .ensure_package(&package.repository, &package.path)
            .await?;
        let mut listing = SourceListing::default();
        let outcome = self
            .replicate_version(&package, version, VersionOrigin::Requested, token, progress, &mut listing)
            .await?;
        let all_published = outcome.is_published();
        Ok(PackageReport {
            package: package.path.clone(),
            outcomes: vec![(version.to_string(), outcome)],
            all_published,
        })
    }

    async fn replicate_version(
        &self,
        package: &PackageDescriptor,
        version: &str,
        origin: VersionOrigin,
        token: &AuthToken,
        progress: &ProgressBar,
        listing: &mut SourceListing,
    ) -> Result<VersionOutcome, StateError> {
        let (repo, pkg) = (package.repository.as_str(), package.path.as_str());
        self.state
            .ensure_package_version(repo, pkg, version, origin)
            .await?;

        if self.state.version_published(repo, pkg, version).await? {
            progress.suspend(|| {
                tracing::info!(repository = %repo, package = %pkg, version = %version, "Already published, skipping")
            });
            return Ok(VersionOutcome::SkippedPublished);
        }

        if has_unsafe_chars(pkg) || has_unsafe_chars(version) {
            let error = format!(
                "package name or version contains characters the destination can't address: {} {}",
                pkg, version
            );
            return self.fail(package, version, error, progress).await;
        }

        let describe_label = format!("describe {} {}", pkg, version);
        let status = self
            .retry
            .run(&describe_label, || {
                self.destination.describe_version(package, version)
            })
            .await;
        match status {
            Ok(VersionStatus::Published) => {
                progress.suspend(|| {
                    tracing::info!(repository = %repo, package = %pkg, version = %version, "Published in destination, skipping")
                });
                self.state.mark_version_published(repo, pkg, version).await?;
                return Ok(VersionOutcome::SkippedPublished);
            }
            Ok(VersionStatus::NotFound) => {
                progress.suspend(|| {
                    tracing::debug!(repository = %repo, package = %pkg, version = %version, "Not in destination")
                });
            }
            Ok(VersionStatus::Other(status)) => {
                progress.suspend(|| {
                    tracing::info!(
                        repository = %repo,
                        package = %pkg,
                        version = %version,
                        status = %status,
                        "Not fully published in destination, replacing"
                    )
                });
                if self.dry_run {
                    progress.suspend(|| {
                        tracing::info!(repository = %repo, package = %pkg, version = %version, "[DRY RUN] Would delete destination version")
                    });
                } else {
                    let label = format!("delete {} {}", pkg, version);
                    if let Err(e) = self
                        .retry
                        .run(&label, || self.destination.delete_version(package, version))
                        .await
                    {
                        return self
                            .fail(package, version, format!("delete of incomplete version failed: {}", e), progress)
                            .await;
                    }
                }
            }
            Err(e) => {
                return self
                    .fail(package, version, format!("status check failed: {}", e), progress)
                    .await;
            }
        }

        let files = match self.binaries(package, listing).await {
            Ok(all) => resolver::binaries_for_version(package, version, all),
            Err(e) => {
                return self
                    .fail(package, version, format!("listing binaries failed: {}", e), progress)
                    .await;
            }
        };
        if files.is_empty() {
            return self
                .fail(package, version, "no binaries found in source".to_string(), progress)
                .await;
        }

        if package.kind.needs_package_manifest() && listing.manifest.is_none() {
            let label = format!("manifest {}", pkg);
            match self
                .retry
                .run(&label, || self.source.package_manifest(repo, pkg))
                .await
            {
                Ok(manifest) => listing.manifest = Some(manifest),
                Err(e) => {
                    return self
                        .fail(package, version, format!("fetching package manifest failed: {}", e), progress)
                        .await;
                }
            }
        }

        if self.dry_run {
            progress.suspend(|| {
                for uri in &files {
                    tracing::info!(repository = %repo, package = %pkg, version = %version, uri = %uri, "[DRY RUN] Would download and publish");
                }
                if package.kind.is_manifest_driven() {
                    tracing::info!(repository = %repo, package = %pkg, version = %version, "[DRY RUN] Would publish metadata and finalize status");
                }
            });
            return Ok(VersionOutcome::DryRun);
        }

        let work_dir = self.scratch_dir.join(package.scratch_dir_name(version));
        let errors = self
            .transfer(package, version, token, &files, listing.manifest.as_ref(), &work_dir, progress)
            .await;
        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                progress.suspend(|| {
                    tracing::warn!(path = %work_dir.display(), error = %e, "Failed to clean up scratch directory")
                });
            }
        }

        let verify_label = format!("verify {} {}", pkg, version);
        let verified = self
            .retry
            .run(&verify_label, || {
                self.destination.describe_version(package, version)
            })
            .await;
        match verified {
            Ok(VersionStatus::Published) => {
                self.state.mark_version_published(repo, pkg, version).await?;
                progress.suspend(|| {
                    tracing::info!(repository = %repo, package = %pkg, version = %version, "Published")
                });
                Ok(VersionOutcome::Published)
            }
            Ok(status) => {
                let error = if errors.is_empty() {
                    format!(
                        "uploaded but destination status is {}, never reached Published; \
                         the version may not match the destination's versioning scheme",
                        status
                    )
                } else {
                    errors.join(ERROR_SEPARATOR)
                };
                self.fail(package, version, error, progress).await
            }
            Err(e) => {
                let mut errors = errors;
                errors.push(format!("verification failed: {}", e));
                self.fail(package, version, errors.join(ERROR_SEPARATOR), progress)
                    .await
            }
        }
    }

    /// Download and upload every file of one version. Returns the
    /// transport errors hit along the way; the caller decides from the
    /// destination's final status.
    async fn transfer(
        &self,
        package: &PackageDescriptor,
        version: &str,
        token: &AuthToken,
        files: &[String],
        manifest: Option<&serde_json::Value>,
        work_dir: &Path,
        progress: &ProgressBar,
    ) -> Vec<String> {
        let mut errors = Vec::new();
        if let Err(e) = tokio::fs::create_dir_all(work_dir).await {
            errors.push(format!("creating {}: {}", work_dir.display(), e));
            return errors;
        }

        for uri in files {
            if let Err(e) = self
                .fetch_and_upload(package, version, token, uri, manifest, work_dir)
                .await
            {
                errors.push(e);
            }
        }

        if package.kind.is_manifest_driven() {
            let metadata_uri = files
                .last()
                .and_then(|last| resolver::trailing_metadata_uri(package.kind, last));
            if let Some(uri) = metadata_uri {
                if let Err(e) = self
                    .fetch_and_upload(package, version, token, &uri, manifest, work_dir)
                    .await
                {
                    progress.suspend(|| {
                        tracing::warn!(package = %package.path, version = %version, error = %e, "Metadata upload failed")
                    });
                }
            }
            let label = format!("finalize {} {}", package.path, version);
            if let Err(e) = self
                .retry
                .run(&label, || self.destination.finalize_status(package, version))
                .await
            {
                progress.suspend(|| {
                    tracing::warn!(package = %package.path, version = %version, error = %e, "Status finalize failed")
                });
            }
        }
        errors
    }

    async fn fetch_and_upload(
        &self,
        package: &PackageDescriptor,
        version: &str,
        token: &AuthToken,
        uri: &str,
        manifest: Option<&serde_json::Value>,
        work_dir: &Path,
    ) -> Result<(), String> {
        let file_name = uri.rsplit('/').next().unwrap_or(uri);
        let dest = work_dir.join(file_name);
        let label = format!("download {}", file_name);
        self.retry
            .run(&label, || self.source.fetch_binary(uri, &dest))
            .await
            .map_err(|e| format!("download of {} failed: {}", file_name, e))?;

        let request = UploadRequest {
            package,
            version,
            file: &dest,
            manifest,
        };
        let label = format!("upload {}", file_name);
        self.retry
            .run(&label, || self.destination.upload_binary(token, &request))
            .await
            .map_err(|e| e.to_string())
    }

    async fn binaries<'a>(
        &self,
        package: &PackageDescriptor,
        listing: &'a mut SourceListing,
    ) -> Result<&'a [String], crate::source::SourceError> {
        if listing.binaries.is_none() {
            let label = format!("list {}", package.path);
            let binaries = self
                .retry
                .run(&label, || self.source.package_binaries(package))
                .await?;
            listing.binaries = Some(binaries);
        }
        Ok(listing.binaries.as_deref().unwrap_or_default())
    }

    async fn fail(
        &self,
        package: &PackageDescriptor,
        version: &str,
        error: String,
        progress: &ProgressBar,
    ) -> Result<VersionOutcome, StateError> {
        progress.suspend(|| {
            tracing::warn!(
                repository = %package.repository,
                package = %package.path,
                version = %version,
                error = %error,
                "Publish failed"
            )
        });
        self.state
            .mark_publish_failed(&package.repository, &package.path, version, &error)
            .await?;
        Ok(VersionOutcome::Failed(error))
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    //! Recording fakes of both external services.

    use std::collections::{HashMap, HashSet};
    use std::path::Path;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::destination::{
        AuthToken, DestinationError, DestinationRegistry, UploadRequest, VersionStatus,
    };
    use crate::package::{PackageDescriptor, PackageKind};
    use crate::source::{RepositorySummary, SourceError, SourceInventory};

    #[derive(Default)]
    pub struct FakeSource {
        pub repositories: Vec<RepositorySummary>,
        /// repo → file listing
        pub files: HashMap<String, Vec<String>>,
        /// (repo, package) → binary URIs
        pub binaries: HashMap<(String, String), Vec<String>>,
        pub manifests: HashMap<(String, String), serde_json::Value>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeSource {
        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl SourceInventory for FakeSource {
        async fn repositories(&self) -> Result<Vec<RepositorySummary>, SourceError> {
            self.record("repositories".into());
            Ok(self.repositories.clone())
        }

        async fn repository_files(&self, repo: &str) -> Result<Vec<String>, SourceError> {
            self.record(format!("files {}", repo));
            Ok(self.files.get(repo).cloned().unwrap_or_default())
        }

        async fn package_exists(&self, repo: &str, pkg: &str) -> Result<bool, SourceError> {
            self.record(format!("exists {}/{}", repo, pkg));
            Ok(self
                .binaries
                .contains_key(&(repo.to_string(), pkg.to_string())))
        }

        async fn package_binaries(
            &self,
            package: &PackageDescriptor,
        ) -> Result<Vec<String>, SourceError> {
            self.record(format!("binaries {}", package.path));
            Ok(self
                .binaries
                .get(&(package.repository.clone(), package.path.clone()))
                .cloned()
                .unwrap_or_default())
        }

        async fn fetch_binary(&self, uri: &str, dest: &Path) -> Result<u64, SourceError> {
            self.record(format!("fetch {}", uri));
            tokio::fs::write(dest, uri.as_bytes())
                .await
                .map_err(|e| SourceError::Disk {
                    path: dest.display().to_string(),
                    source: e,
                })?;
            Ok(uri.len() as u64)
        }

        async fn package_manifest(
            &self,
            repo: &str,
            pkg: &str,
        ) -> Result<serde_json::Value, SourceError> {
            self.record(format!("manifest {}", pkg));
            self.manifests
                .get(&(repo.to_string(), pkg.to_string()))
                .cloned()
                .ok_or_else(|| SourceError::HttpStatus {
                    status: 404,
                    url: pkg.to_string(),
                })
        }
    }

    /// Destination whose published set grows as uploads succeed. Versions
    /// in `failing_uploads` always answer 503; versions in `never_publish`
    /// accept uploads but stay unfinished.
    #[derive(Default)]
    pub struct FakeDestination {
        pub repositories: Mutex<Vec<String>>,
        pub statuses: Mutex<HashMap<(String, String), VersionStatus>>,
        pub failing_uploads: HashSet<String>,
        pub never_publish: HashSet<String>,
        pub calls: Mutex<Vec<String>>,
        pub tokens_issued: Mutex<u32>,
    }

    impl FakeDestination {
        pub fn with_published(pairs: &[(&str, &str)]) -> Self {
            let dest = Self::default();
            {
                let mut statuses = dest.statuses.lock().unwrap();
                for (pkg, version) in pairs {
                    statuses.insert(
                        (pkg.to_string(), version.to_string()),
                        VersionStatus::Published,
                    );
                }
            }
            dest
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        /// Calls that change destination state.
        pub fn writes(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter(|c| {
                    c.starts_with("upload")
                        || c.starts_with("delete")
                        || c.starts_with("finalize")
                        || c.starts_with("create")
                })
                .collect()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl DestinationRegistry for FakeDestination {
        async fn list_repositories(&self) -> Result<Vec<String>, DestinationError> {
            self.record("list_repositories".into());
            Ok(self.repositories.lock().unwrap().clone())
        }

        async fn create_repository(&self, name: &str) -> Result<(), DestinationError> {
            self.record(format!("create {}", name));
            self.repositories.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn repository_endpoint(
            &self,
            name: &str,
            kind: PackageKind,
        ) -> Result<String, DestinationError> {
            Ok(format!("https://dest/{}/{}/", kind, name))
        }

        async fn authorization_token(&self) -> Result<AuthToken, DestinationError> {
            let mut issued = self.tokens_issued.lock().unwrap();
            *issued += 1;
            Ok(AuthToken(format!("token-{}", *issued)))
        }

        async fn describe_version(
            &self,
            package: &PackageDescriptor,
            version: &str,
        ) -> Result<VersionStatus, DestinationError> {
            self.record(format!("describe {} {}", package.path, version));
            Ok(self
                .statuses
                .lock()
                .unwrap()
                .get(&(package.path.clone(), version.to_string()))
                .cloned()
                .unwrap_or(VersionStatus::NotFound))
        }

        async fn delete_version(
            &self,
            package: &PackageDescriptor,
            version: &str,
        ) -> Result<(), DestinationError> {
            self.record(format!("delete {} {}", package.path, version));
            self.statuses
                .lock()
                .unwrap()
                .remove(&(package.path.clone(), version.to_string()));
            Ok(())
        }

        async fn upload_binary(
            &self,
            _token: &AuthToken,
            request: &UploadRequest<'_>,
        ) -> Result<(), DestinationError> {
            let file = request
                .file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            self.record(format!("upload {} {} {}", request.package.path, request.version, file));
            if self.failing_uploads.contains(request.version) {
                return Err(DestinationError::UploadStatus {
                    status: 503,
                    reason: "Service Unavailable".into(),
                    body: "try later".into(),
                });
            }
            let status = if self.never_publish.contains(request.version) {
                VersionStatus::Other("Unfinished".into())
            } else {
                VersionStatus::Published
            };
            self.statuses.lock().unwrap().insert(
                (request.package.path.clone(), request.version.to_string()),
                status,
            );
            Ok(())
        }

        async fn finalize_status(
            &self,
            package: &PackageDescriptor,
            version: &str,
        ) -> Result<(), DestinationError> {
            self.record(format!("finalize {} {}", package.path, version));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::fakes::{FakeDestination, FakeSource};
    use super::*;
    use crate::package::PackageKind;
    use crate::state::SqliteStateStore;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("replicator-engine-{}-{}", name, std::process::id()))
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn pypi_source() -> FakeSource {
        let mut binaries = HashMap::new();
        binaries.insert(
            ("R".to_string(), "p".to_string()),
            vec![
                "https://src/R/p/1.0/p-1.0.tar.gz".to_string(),
                "https://src/R/p/2.0/p-2.0.tar.gz".to_string(),
                "https://src/R/p/2.0/p-2.0-py3-none-any.whl".to_string(),
            ],
        );
        FakeSource {
            binaries,
            ..Default::default()
        }
    }

    fn pkg(kind: PackageKind, path: &str) -> PackageDescriptor {
        PackageDescriptor::new("R", path, kind, "https://dest/R/")
    }

    struct Harness {
        engine: Engine,
        state: Arc<SqliteStateStore>,
        source: Arc<FakeSource>,
        destination: Arc<FakeDestination>,
    }

    fn harness(name: &str, source: FakeSource, destination: FakeDestination, dry_run: bool) -> Harness {
        let state = Arc::new(SqliteStateStore::open_in_memory().unwrap());
        let source = Arc::new(source);
        let destination = Arc::new(destination);
        let engine = Engine::new(
            state.clone(),
            source.clone(),
            destination.clone(),
            quick_retry(),
            scratch(name),
            dry_run,
        );
        Harness {
            engine,
            state,
            source,
            destination,
        }
    }

    fn token() -> AuthToken {
        AuthToken("t".into())
    }

    #[tokio::test]
    async fn test_skips_published_and_uploads_missing() {
        let h = harness("e2e", pypi_source(), FakeDestination::with_published(&[("p", "1.0")]), false);

        let report = h
            .engine
            .replicate_package(pkg(PackageKind::Pypi, "p"), &token(), &ProgressBar::hidden())
            .await
            .unwrap();

        assert_eq!(
            report.outcomes,
            vec![
                ("1.0".to_string(), VersionOutcome::SkippedPublished),
                ("2.0".to_string(), VersionOutcome::Published),
            ]
        );
        assert!(report.all_published);
        assert_eq!(
            h.destination.writes(),
            vec![
                "upload p 2.0 p-2.0.tar.gz",
                "upload p 2.0 p-2.0-py3-none-any.whl"
            ]
        );
        assert!(h.state.all_versions_published("R", "p").await.unwrap());
        assert!(h.state.version_published("R", "p", "1.0").await.unwrap());
        assert!(h.state.version_published("R", "p", "2.0").await.unwrap());
        assert!(!scratch("e2e").join("p@2.0").exists());
    }

    #[tokio::test]
    async fn test_transport_failure_recorded() {
        let mut destination = FakeDestination::with_published(&[("p", "1.0")]);
        destination.failing_uploads.insert("2.0".into());
        let h = harness("fail", pypi_source(), destination, false);

        let report = h
            .engine
            .replicate_package(pkg(PackageKind::Pypi, "p"), &token(), &ProgressBar::hidden())
            .await
            .unwrap();

        assert!(!report.all_published);
        let VersionOutcome::Failed(error) = &report.outcomes[1].1 else {
            panic!("expected failure, got {:?}", report.outcomes[1].1);
        };
        assert!(error.contains("503"));
        assert!(error.contains(ERROR_SEPARATOR));

        // 2 files x 3 attempts
        let uploads = h
            .destination
            .writes()
            .iter()
            .filter(|c| c.starts_with("upload"))
            .count();
        assert_eq!(uploads, 6);

        let failed = h.state.list_failed_versions("R").await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].version, "2.0");
        assert!(!failed[0].error.is_empty());
        assert!(!h.state.all_versions_published("R", "p").await.unwrap());
    }

    #[tokio::test]
    async fn test_never_published_hints_versioning_mismatch() {
        let mut destination = FakeDestination::default();
        destination.never_publish.insert("1.0".into());
        let mut source = pypi_source();
        source.binaries.insert(
            ("R".to_string(), "p".to_string()),
            vec!["https://src/R/p/1.0/p-1.0.tar.gz".to_string()],
        );
        let h = harness("mismatch", source, destination, false);

        let report = h
            .engine
            .replicate_package(pkg(PackageKind::Pypi, "p"), &token(), &ProgressBar::hidden())
            .await
            .unwrap();
        let VersionOutcome::Failed(error) = &report.outcomes[0].1 else {
            panic!("expected failure");
        };
        assert!(error.contains("never reached Published"));
    }

    #[tokio::test]
    async fn test_second_run_makes_no_destination_calls() {
        let h = harness("idem", pypi_source(), FakeDestination::with_published(&[("p", "1.0")]), false);
        h.engine
            .replicate_package(pkg(PackageKind::Pypi, "p"), &token(), &ProgressBar::hidden())
            .await
            .unwrap();
        let calls_after_first = h.destination.calls().len();
        let source_calls_after_first = h.source.call_count();

        let report = h
            .engine
            .replicate_package(pkg(PackageKind::Pypi, "p"), &token(), &ProgressBar::hidden())
            .await
            .unwrap();
        assert!(report.all_published);
        assert_eq!(h.destination.calls().len(), calls_after_first);
        assert_eq!(h.source.call_count(), source_calls_after_first);
    }

    #[tokio::test]
    async fn test_failed_pinned_version_stays_out_of_cached_listing() {
        let h = harness("pinned-rollup", pypi_source(), FakeDestination::default(), false);
        h.state
            .ensure_package_version("R", "p", "1.0", VersionOrigin::Discovered)
            .await
            .unwrap();
        h.state.mark_all_versions_fetched("R", "p").await.unwrap();

        let pinned = h
            .engine
            .replicate_pinned_version(pkg(PackageKind::Pypi, "p"), "9.9", &token(), &ProgressBar::hidden())
            .await
            .unwrap();
        assert!(matches!(pinned.outcomes[0].1, VersionOutcome::Failed(_)));

        let report = h
            .engine
            .replicate_package(pkg(PackageKind::Pypi, "p"), &token(), &ProgressBar::hidden())
            .await
            .unwrap();
        assert_eq!(
            report.outcomes,
            vec![("1.0".to_string(), VersionOutcome::Published)]
        );
        assert!(report.all_published);
        assert!(h.state.all_versions_published("R", "p").await.unwrap());
        assert_eq!(
            h.state.list_discovered_versions("R", "p").await.unwrap(),
            vec!["1.0"]
        );
        let failed = h.state.list_failed_versions("R").await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].version, "9.9");
    }

    #[tokio::test]
    async fn test_logs_through_live_bar_without_advancing_it() {
        use indicatif::ProgressDrawTarget;

        let mut destination = FakeDestination::with_published(&[("p", "1.0")]);
        destination.failing_uploads.insert("2.0".into());
        let h = harness("live-bar", pypi_source(), destination, false);
        let pb = ProgressBar::with_draw_target(Some(1), ProgressDrawTarget::hidden());

        let report = h
            .engine
            .replicate_package(pkg(PackageKind::Pypi, "p"), &token(), &pb)
            .await
            .unwrap();

        assert!(!report.all_published);
        assert_eq!(pb.position(), 0);
        assert!(!pb.is_finished());
    }

    #[tokio::test]
    async fn test_unsafe_name_fails_without_network() {
        let h = harness("unsafe", FakeSource::default(), FakeDestination::default(), false);

        let report = h
            .engine
            .replicate_pinned_version(pkg(PackageKind::Pypi, "bad name!"), "1.0", &token(), &ProgressBar::hidden())
            .await
            .unwrap();

        assert!(matches!(report.outcomes[0].1, VersionOutcome::Failed(_)));
        assert!(h.destination.calls().is_empty());
        assert_eq!(h.source.call_count(), 0);
        let failed = h.state.list_failed_versions("R").await.unwrap();
        assert_eq!(failed[0].package, "bad name!");
        assert!(!h.state.all_versions_fetched("R", "bad name!").await.unwrap());
    }

    #[tokio::test]
    async fn test_incomplete_version_replaced() {
        let destination = FakeDestination::default();
        destination.statuses.lock().unwrap().insert(
            ("p".to_string(), "1.0".to_string()),
            VersionStatus::Other("Unfinished".into()),
        );
        let mut source = pypi_source();
        source.binaries.insert(
            ("R".to_string(), "p".to_string()),
            vec!["https://src/R/p/1.0/p-1.0.tar.gz".to_string()],
        );
        let h = harness("replace", source, destination, false);

        let report = h
            .engine
            .replicate_package(pkg(PackageKind::Pypi, "p"), &token(), &ProgressBar::hidden())
            .await
            .unwrap();
        assert_eq!(report.outcomes[0].1, VersionOutcome::Published);
        assert_eq!(
            h.destination.writes(),
            vec!["delete p 1.0", "upload p 1.0 p-1.0.tar.gz"]
        );
    }

    #[tokio::test]
    async fn test_maven_uploads_metadata_and_finalizes() {
        let mut binaries = HashMap::new();
        binaries.insert(
            ("R".to_string(), "com/acme/lib".to_string()),
            vec![
                "https://src/R/com/acme/lib/1.0/lib-1.0.pom".to_string(),
                "https://src/R/com/acme/lib/1.0/lib-1.0.jar".to_string(),
                "https://src/R/com/acme/lib/maven-metadata.xml".to_string(),
            ],
        );
        let source = FakeSource {
            binaries,
            ..Default::default()
        };
        let h = harness("maven", source, FakeDestination::default(), false);

        h.engine
            .replicate_package(pkg(PackageKind::Maven, "com/acme/lib"), &token(), &ProgressBar::hidden())
            .await
            .unwrap();
        assert_eq!(
            h.destination.writes(),
            vec![
                "upload com/acme/lib 1.0 lib-1.0.pom",
                "upload com/acme/lib 1.0 lib-1.0.jar",
                "upload com/acme/lib 1.0 maven-metadata.xml",
                "finalize com/acme/lib 1.0",
            ]
        );
    }

    #[tokio::test]
    async fn test_npm_fetches_manifest_once() {
        let mut binaries = HashMap::new();
        binaries.insert(
            ("R".to_string(), "left-pad".to_string()),
            vec![
                "https://src/R/left-pad/-/left-pad-1.0.0.tgz".to_string(),
                "https://src/R/left-pad/-/left-pad-1.1.0.tgz".to_string(),
            ],
        );
        let mut manifests = HashMap::new();
        manifests.insert(
            ("R".to_string(), "left-pad".to_string()),
            serde_json::json!({"versions": {"1.0.0": {}, "1.1.0": {}}}),
        );
        let source = FakeSource {
            binaries,
            manifests,
            ..Default::default()
        };
        let h = harness("npm", source, FakeDestination::default(), false);

        let report = h
            .engine
            .replicate_package(pkg(PackageKind::Npm, "left-pad"), &token(), &ProgressBar::hidden())
            .await
            .unwrap();
        assert!(report.all_published);
        let manifest_calls = h
            .source
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with("manifest"))
            .count();
        assert_eq!(manifest_calls, 1);
    }

    #[tokio::test]
    async fn test_dry_run_performs_no_writes() {
        let h = harness("dry", pypi_source(), FakeDestination::with_published(&[("p", "1.0")]), true);

        let report = h
            .engine
            .replicate_package(pkg(PackageKind::Pypi, "p"), &token(), &ProgressBar::hidden())
            .await
            .unwrap();
        assert_eq!(report.outcomes[1].1, VersionOutcome::DryRun);
        assert!(!report.all_published);
        assert!(h.destination.writes().is_empty());
        assert!(!h
            .source
            .calls
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.starts_with("fetch")));
    }

    #[tokio::test]
    async fn test_package_without_versions_rolls_up() {
        let h = harness("empty", FakeSource::default(), FakeDestination::default(), false);
        let report = h
            .engine
            .replicate_package(pkg(PackageKind::Pypi, "ghost"), &token(), &ProgressBar::hidden())
            .await
            .unwrap();
        assert!(report.outcomes.is_empty());
        assert!(report.all_published);
        assert!(h.state.all_versions_fetched("R", "ghost").await.unwrap());
    }
}
