//! Replication driver.
//!
//! Resolves the run's scope to a list of repositories, enumerates the
//! packages of each and feeds them to the [`Engine`] in fixed-size batches.
//! Batches run their packages concurrently and are strictly sequential; the
//! destination token is reissued and the shutdown token checked only
//! between batches.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use crate::destination::{AuthToken, DestinationError, DestinationRegistry};
use crate::engine::{Engine, PackageReport, VersionOutcome};
use crate::package::{has_unsafe_chars, PackageDescriptor, PackageKind};
use crate::resolver;
use crate::retry::RetryPolicy;
use crate::source::{RepositorySummary, SourceError, SourceInventory};
use crate::state::{StateError, StateStore};

/// Host used in place of the destination endpoint during dry runs, when the
/// destination repository may not exist yet.
const DRY_RUN_ENDPOINT_HOST: &str = "codeartifact-test-endpoint-dryrun.com";

/// Conditions that end the whole run.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("Repository '{0}' not found in source")]
    UnknownRepository(String),

    #[error("Repository '{repository}' has unsupported package type '{package_type}'")]
    UnsupportedKind {
        repository: String,
        package_type: String,
    },

    #[error("Package '{package}' not found in repository '{repository}'")]
    PackageNotFound { repository: String, package: String },

    #[error("Source inventory unavailable: {0}")]
    Source(#[source] SourceError),

    #[error("Destination registry unavailable: {0}")]
    Destination(#[source] DestinationError),

    #[error(transparent)]
    State(#[from] StateError),
}

/// One entry of an explicit package list: `name` or `name:version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRequest {
    pub name: String,
    pub version: Option<String>,
}

/// What a run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Named packages (optionally version-pinned) of one repository.
    Packages {
        repository: String,
        packages: Vec<PackageRequest>,
    },
    /// Every package of the named repositories.
    Repositories(Vec<String>),
    /// Every locally hosted repository in the source.
    All,
}

#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Packages per batch, at least 1.
    pub workers: usize,
    pub refresh: bool,
    pub dry_run: bool,
    /// Reissue the destination token once it is this old.
    pub token_max_age: Duration,
    pub retry: RetryPolicy,
    pub scratch_dir: PathBuf,
    pub no_progress_bar: bool,
}

/// Totals over one run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub repositories: usize,
    pub packages: usize,
    pub published: usize,
    pub skipped: usize,
    pub failed: usize,
    pub dry_run: usize,
    /// Stopped early on a shutdown request.
    pub interrupted: bool,
}

impl RunSummary {
    fn record(&mut self, report: &PackageReport) {
        self.packages += 1;
        for (_, outcome) in &report.outcomes {
            match outcome {
                VersionOutcome::SkippedPublished => self.skipped += 1,
                VersionOutcome::Published => self.published += 1,
                VersionOutcome::Failed(_) => self.failed += 1,
                VersionOutcome::DryRun => self.dry_run += 1,
            }
        }
    }

    pub fn log(&self, elapsed: Duration) {
        tracing::info!("── Summary ──");
        if self.interrupted {
            tracing::info!("  Interrupted by shutdown request");
        }
        tracing::info!(
            "  {} repositories, {} packages",
            self.repositories,
            self.packages
        );
        if self.dry_run > 0 {
            tracing::info!("  {} versions would be published", self.dry_run);
        }
        tracing::info!(
            "  {} published, {} already published, {} failed",
            self.published,
            self.skipped,
            self.failed
        );
        tracing::info!("  elapsed: {}", format_duration(elapsed));
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

/// Destination token, issued on first use and reissued once older than
/// `max_age`. Only consulted at batch boundaries.
struct TokenLease {
    current: Option<(AuthToken, Instant)>,
    max_age: Duration,
}

impl TokenLease {
    fn new(max_age: Duration) -> Self {
        Self {
            current: None,
            max_age,
        }
    }

    async fn token(
        &mut self,
        destination: &dyn DestinationRegistry,
        retry: &RetryPolicy,
    ) -> Result<AuthToken, DestinationError> {
        if let Some((token, issued)) = &self.current {
            if issued.elapsed() < self.max_age {
                return Ok(token.clone());
            }
            tracing::info!("Destination token older than {:?}, reissuing", self.max_age);
        }
        let token = retry
            .run("authorization token", || destination.authorization_token())
            .await?;
        self.current = Some((token.clone(), Instant::now()));
        Ok(token)
    }
}

/// One schedulable unit of a repository pass.
#[derive(Debug, Clone)]
enum WorkItem {
    Package(String),
    Pinned { package: String, version: String },
}

impl WorkItem {
    fn package(&self) -> &str {
        match self {
            Self::Package(name) | Self::Pinned { package: name, .. } => name,
        }
    }
}

/// Returns `ProgressBar::hidden()` when disabled or stdout is not a TTY.
fn create_progress_bar(no_progress_bar: bool, total: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} packages ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("=> "));
    }
    pb
}

pub struct Driver {
    state: Arc<dyn StateStore>,
    source: Arc<dyn SourceInventory>,
    destination: Arc<dyn DestinationRegistry>,
    engine: Engine,
    options: DriverOptions,
}

impl Driver {
    pub fn new(
        state: Arc<dyn StateStore>,
        source: Arc<dyn SourceInventory>,
        destination: Arc<dyn DestinationRegistry>,
        options: DriverOptions,
    ) -> Self {
        let engine = Engine::new(
            state.clone(),
            source.clone(),
            destination.clone(),
            options.retry,
            options.scratch_dir.clone(),
            options.dry_run,
        );
        Self {
            state,
            source,
            destination,
            engine,
            options,
        }
    }

    /// Replicate everything in `scope`. Per-version failures are recorded
    /// and counted; only fatal conditions return an error.
    pub async fn run(
        &self,
        scope: &Scope,
        shutdown: &CancellationToken,
    ) -> Result<RunSummary, ReplicationError> {
        let retry = &self.options.retry;
        let source_repos = retry
            .run("list source repositories", || self.source.repositories())
            .await
            .map_err(ReplicationError::Source)?;
        let destination_repos = retry
            .run("list destination repositories", || {
                self.destination.list_repositories()
            })
            .await
            .map_err(ReplicationError::Destination)?;

        let find = |name: &String| {
            source_repos
                .iter()
                .find(|r| &r.key == name)
                .cloned()
                .ok_or_else(|| ReplicationError::UnknownRepository(name.clone()))
        };
        let targets: Vec<RepositorySummary> = match scope {
            Scope::Packages { repository, .. } => vec![find(repository)?],
            Scope::Repositories(names) => names.iter().map(find).collect::<Result<_, _>>()?,
            Scope::All => source_repos.iter().filter(|r| r.is_local()).cloned().collect(),
        };
        let requests = match scope {
            Scope::Packages { packages, .. } => Some(packages.as_slice()),
            _ => None,
        };

        let mut summary = RunSummary::default();
        for repo in &targets {
            if shutdown.is_cancelled() {
                tracing::info!("Shutdown requested, skipping remaining repositories");
                summary.interrupted = true;
                break;
            }
            let Some(kind) = repo.kind() else {
                if requests.is_some() {
                    return Err(ReplicationError::UnsupportedKind {
                        repository: repo.key.clone(),
                        package_type: repo.package_type.clone(),
                    });
                }
                tracing::warn!(
                    repository = %repo.key,
                    package_type = %repo.package_type,
                    "Unsupported package type, skipping repository"
                );
                continue;
            };
            summary.repositories += 1;
            self.replicate_repository(
                &repo.key,
                kind,
                requests,
                &destination_repos,
                shutdown,
                &mut summary,
            )
            .await?;
        }
        Ok(summary)
    }

    async fn replicate_repository(
        &self,
        repo: &str,
        kind: PackageKind,
        requests: Option<&[PackageRequest]>,
        destination_repos: &[String],
        shutdown: &CancellationToken,
        summary: &mut RunSummary,
    ) -> Result<(), ReplicationError> {
        let retry = &self.options.retry;
        tracing::info!(repository = %repo, kind = %kind, "Replicating repository");

        if self.options.refresh {
            tracing::info!(repository = %repo, "Refresh requested, discarding cached listings");
            self.state.reset_fetch_state(repo).await?;
        }
        self.state.ensure_repository(repo).await?;
        self.report_previous_failures(repo).await?;

        let cached = self.state.repository_state(repo).await?.unwrap_or_default();
        if requests.is_none() && cached.all_versions_published {
            tracing::info!(repository = %repo, "All packages already published, skipping");
            return Ok(());
        }

        let endpoint = if self.options.dry_run {
            if !destination_repos.iter().any(|r| r == repo) {
                tracing::info!(repository = %repo, "[DRY RUN] Would create destination repository");
            }
            format!("https://{}/{}/", DRY_RUN_ENDPOINT_HOST, repo)
        } else {
            if !destination_repos.iter().any(|r| r == repo) {
                retry
                    .run("create repository", || {
                        self.destination.create_repository(repo)
                    })
                    .await
                    .map_err(ReplicationError::Destination)?;
            }
            retry
                .run("repository endpoint", || {
                    self.destination.repository_endpoint(repo, kind)
                })
                .await
                .map_err(ReplicationError::Destination)?
        };

        let items = match requests {
            Some(requests) => self.requested_items(repo, requests).await?,
            None => {
                let Some(packages) = self.repository_packages(repo, kind, cached.all_versions_fetched).await? else {
                    return Ok(());
                };
                packages.into_iter().map(WorkItem::Package).collect()
            }
        };
        tracing::info!(repository = %repo, packages = items.len(), "Packages to replicate");

        let mut lease = TokenLease::new(self.options.token_max_age);
        let pb = create_progress_bar(self.options.no_progress_bar, items.len() as u64);
        let mut all_published = true;
        let mut interrupted = false;
        for batch in items.chunks(self.options.workers.max(1)) {
            if shutdown.is_cancelled() {
                pb.suspend(|| tracing::info!("Shutdown requested, stopping before next batch"));
                interrupted = true;
                break;
            }
            let token = lease
                .token(self.destination.as_ref(), retry)
                .await
                .map_err(ReplicationError::Destination)?;

            let token = &token;
            let engine = &self.engine;
            let progress = &pb;
            let results = join_all(batch.iter().map(|item| {
                let descriptor = PackageDescriptor::new(repo, item.package(), kind, &endpoint);
                async move {
                    match item {
                        WorkItem::Package(_) => {
                            engine.replicate_package(descriptor, token, progress).await
                        }
                        WorkItem::Pinned { version, .. } => {
                            engine
                                .replicate_pinned_version(descriptor, version, token, progress)
                                .await
                        }
                    }
                }
            }))
            .await;

            for result in results {
                let report = result?;
                all_published &= report.all_published;
                summary.record(&report);
                pb.set_message(report.package.clone());
                pb.inc(1);
            }
        }
        pb.finish_and_clear();

        if interrupted {
            summary.interrupted = true;
            return Ok(());
        }
        // Explicit package lists cover a subset; they never settle the
        // repository.
        if requests.is_none() {
            self.state.mark_repo_all_versions_fetched(repo).await?;
            if all_published {
                self.state.mark_repo_all_versions_published(repo).await?;
                tracing::info!(repository = %repo, "All packages published");
            }
        }
        Ok(())
    }

    /// Packages of the repository, from the cache once fully listed.
    /// `None` when the source listing failed and the repository should be
    /// skipped this pass.
    async fn repository_packages(
        &self,
        repo: &str,
        kind: PackageKind,
        fetched: bool,
    ) -> Result<Option<Vec<String>>, ReplicationError> {
        if fetched {
            tracing::debug!(repository = %repo, "Using cached package list");
            return Ok(Some(self.state.list_packages(repo).await?));
        }
        let files = match self
            .options
            .retry
            .run("list repository files", || self.source.repository_files(repo))
            .await
        {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(repository = %repo, error = %e, "Failed to list repository, skipping");
                return Ok(None);
            }
        };
        let packages = resolver::packages_from_listing(kind, &files);
        for package in &packages {
            self.state.ensure_package(repo, package).await?;
        }
        Ok(Some(packages))
    }

    /// Explicit package list. Every package must exist in the source;
    /// names the destination can't address go straight to the engine,
    /// which records them as failed.
    async fn requested_items(
        &self,
        repo: &str,
        requests: &[PackageRequest],
    ) -> Result<Vec<WorkItem>, ReplicationError> {
        let mut items = Vec::with_capacity(requests.len());
        for request in requests {
            let addressable = !has_unsafe_chars(&request.name)
                && request
                    .version
                    .as_deref()
                    .map_or(true, |v| !has_unsafe_chars(v));
            if addressable {
                let exists = self
                    .options
                    .retry
                    .run("package exists", || {
                        self.source.package_exists(repo, &request.name)
                    })
                    .await
                    .map_err(ReplicationError::Source)?;
                if !exists {
                    return Err(ReplicationError::PackageNotFound {
                        repository: repo.to_string(),
                        package: request.name.clone(),
                    });
                }
            }
            items.push(match &request.version {
                Some(version) => WorkItem::Pinned {
                    package: request.name.clone(),
                    version: version.clone(),
                },
                None => WorkItem::Package(request.name.clone()),
            });
        }
        Ok(items)
    }

    async fn report_previous_failures(&self, repo: &str) -> Result<(), StateError> {
        for failed in self.state.list_failed_versions(repo).await? {
            tracing::warn!(
                repository = %repo,
                package = %failed.package,
                version = %failed.version,
                error = %failed.error,
                "Previous publish failed; retry with --repositories {} --packages {}:{}",
                repo,
                failed.package,
                failed.version
            );
        }
        Ok(())
    }
}
