use std::path::PathBuf;
use std::time::Duration;

use crate::cli::{CacheArgs, ReplicateArgs};
use crate::driver::{PackageRequest, Scope};
use crate::retry::RetryPolicy;
use crate::types::CacheBackend;

/// Cap on the exponential retry backoff.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

const SQLITE_PROD_FILE: &str = "replicator-prod.db";
const SQLITE_DRY_RUN_FILE: &str = "replicator-dryrun.db";
const DYNAMO_PROD_NAME: &str = "artifact-replicator-prod";
const DYNAMO_DRY_RUN_NAME: &str = "artifact-replicator-dryrun";

/// Concrete state store selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLocation {
    /// Nothing persists.
    Memory,
    Sqlite(PathBuf),
    DynamoDb { name: String },
}

impl CacheLocation {
    /// Resolve the persistent location for `args`, defaulting the name by
    /// whether this is a dry run so trial runs never share prod state.
    pub fn persistent(args: &CacheArgs, dry_run: bool) -> Self {
        match args.cache_backend {
            CacheBackend::Sqlite => {
                let file = match &args.cache_name {
                    Some(name) => format!("{}.db", name),
                    None if dry_run => SQLITE_DRY_RUN_FILE.to_string(),
                    None => SQLITE_PROD_FILE.to_string(),
                };
                CacheLocation::Sqlite(expand_tilde(&args.scratch_dir).join(file))
            }
            CacheBackend::DynamoDb => CacheLocation::DynamoDb {
                name: args.cache_name.clone().unwrap_or_else(|| {
                    if dry_run {
                        DYNAMO_DRY_RUN_NAME.to_string()
                    } else {
                        DYNAMO_PROD_NAME.to_string()
                    }
                }),
            },
        }
    }
}

/// Validated settings for one `replicate` run.
pub struct Config {
    pub artifactory_url: String,
    pub artifactory_user: String,
    pub artifactory_password: Option<String>,
    pub codeartifact_domain: String,
    pub codeartifact_account: Option<String>,
    pub region: Option<String>,
    pub scratch_dir: PathBuf,
    pub cache: CacheLocation,
    pub scope: Scope,

    pub http_timeout: Duration,
    pub token_max_age: Duration,
    pub retry: RetryPolicy,

    pub workers: usize,

    pub dry_run: bool,
    pub refresh: bool,
    pub clean: bool,
    pub no_progress_bar: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("artifactory_url", &self.artifactory_url)
            .field("artifactory_user", &self.artifactory_user)
            .field("artifactory_password", &"<redacted>")
            .field("codeartifact_domain", &self.codeartifact_domain)
            .field("cache", &self.cache)
            .field("scope", &self.scope)
            .field("workers", &self.workers)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

impl Config {
    pub fn from_cli(cli: ReplicateArgs) -> anyhow::Result<Self> {
        let scope = resolve_scope(cli.repositories, &cli.packages)?;

        let cache = if cli.cache {
            CacheLocation::persistent(&cli.store, cli.dry_run)
        } else {
            CacheLocation::Memory
        };

        let prefix = cli.artifactory_prefix.trim_matches('/');
        let artifactory_url = if prefix.is_empty() {
            format!("{}://{}", cli.artifactory_protocol.as_str(), cli.artifactory_host)
        } else {
            format!(
                "{}://{}/{}",
                cli.artifactory_protocol.as_str(),
                cli.artifactory_host,
                prefix
            )
        };

        Ok(Self {
            artifactory_url,
            artifactory_user: cli.artifactory_user,
            artifactory_password: cli.artifactory_password,
            codeartifact_domain: cli.codeartifact_domain,
            codeartifact_account: cli.codeartifact_account,
            region: cli.store.region.clone(),
            scratch_dir: expand_tilde(&cli.store.scratch_dir),
            cache,
            scope,
            http_timeout: Duration::from_secs(cli.http_timeout),
            token_max_age: Duration::from_secs(cli.token_refresh_hours * 3600),
            retry: RetryPolicy {
                max_attempts: cli.max_retries,
                base_delay: Duration::from_secs(cli.retry_delay),
                max_delay: MAX_RETRY_DELAY,
            },
            workers: usize::from(cli.workers.max(1)),
            dry_run: cli.dry_run,
            refresh: cli.refresh,
            clean: cli.clean,
            no_progress_bar: cli.no_progress_bar,
        })
    }
}

/// Explicit packages → explicit repositories → everything local.
fn resolve_scope(repositories: Vec<String>, packages: &[String]) -> anyhow::Result<Scope> {
    if !packages.is_empty() {
        let [repository] = repositories.as_slice() else {
            anyhow::bail!(
                "--packages needs exactly one repository (got {}); pass a single --repositories entry",
                repositories.len()
            );
        };
        let packages = packages
            .iter()
            .map(|spec| parse_package_spec(spec))
            .collect::<anyhow::Result<Vec<_>>>()?;
        return Ok(Scope::Packages {
            repository: repository.clone(),
            packages,
        });
    }
    if !repositories.is_empty() {
        return Ok(Scope::Repositories(repositories));
    }
    Ok(Scope::All)
}

/// Parse `name` or `name:version`.
pub(crate) fn parse_package_spec(spec: &str) -> anyhow::Result<PackageRequest> {
    let mut parts = spec.split(':');
    let name = parts.next().unwrap_or_default();
    let version = parts.next();
    if parts.next().is_some() {
        anyhow::bail!(
            "Cannot parse package '{}'. Expected name or name:version",
            spec
        );
    }
    if name.is_empty() {
        anyhow::bail!("Package name missing in '{}'", spec);
    }
    match version {
        Some("") => anyhow::bail!("Version missing after ':' in '{}'", spec),
        Some(version) => Ok(PackageRequest {
            name: name.to_string(),
            version: Some(version.to_string()),
        }),
        None => Ok(PackageRequest {
            name: name.to_string(),
            version: None,
        }),
    }
}
