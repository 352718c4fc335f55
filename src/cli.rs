use clap::{Args, Parser, Subcommand};

use crate::types::*;

#[derive(Parser, Debug)]
#[command(
    name = "artifact-replicator",
    version,
    about = "Replicate Artifactory repositories into AWS CodeArtifact"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log level (RUST_LOG overrides)
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Replicate repositories or packages into the destination
    Replicate(ReplicateArgs),
    /// Show cached replication state for repositories
    Status(StatusArgs),
}

/// Where cached state lives.
#[derive(Args, Debug, Clone)]
pub struct CacheArgs {
    /// Cache backend
    #[arg(long, value_enum, default_value = "sqlite")]
    pub cache_backend: CacheBackend,

    /// Cache name: SQLite file stem or DynamoDB table-set prefix
    #[arg(long)]
    pub cache_name: Option<String>,

    /// Scratch directory for downloads and the SQLite cache
    #[arg(long, default_value = ".replication")]
    pub scratch_dir: String,

    /// AWS region for CodeArtifact and DynamoDB (default: SDK chain)
    #[arg(long, env = "AWS_REGION")]
    pub region: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ReplicateArgs {
    #[command(flatten)]
    pub store: CacheArgs,

    /// Persist state between runs (otherwise an in-memory cache is used)
    #[arg(long)]
    pub cache: bool,

    /// Log intended actions without writing to the destination or the cache
    #[arg(long)]
    pub dry_run: bool,

    /// Discard cached listings and re-read versions from the source
    #[arg(long)]
    pub refresh: bool,

    /// Wipe all cached state before running
    #[arg(long)]
    pub clean: bool,

    /// Packages replicated concurrently per batch
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u16).range(1..))]
    pub workers: u16,

    /// Artifactory host name
    #[arg(long)]
    pub artifactory_host: String,

    /// Path prefix Artifactory is served under
    #[arg(long, default_value = "artifactory")]
    pub artifactory_prefix: String,

    #[arg(long, value_enum, default_value = "https")]
    pub artifactory_protocol: HttpProtocol,

    #[arg(long)]
    pub artifactory_user: String,

    /// Artifactory password (if not provided, will prompt).
    /// WARNING: passing via --artifactory-password is visible in process
    /// listings. Prefer the ARTIFACTORY_PASSWORD environment variable.
    #[arg(long, env = "ARTIFACTORY_PASSWORD", hide_env_values = true)]
    pub artifactory_password: Option<String>,

    /// CodeArtifact domain
    #[arg(long)]
    pub codeartifact_domain: String,

    /// AWS account that owns the CodeArtifact domain
    #[arg(long)]
    pub codeartifact_account: Option<String>,

    /// Repositories to replicate (default: every local repository)
    #[arg(long, num_args = 1..)]
    pub repositories: Vec<String>,

    /// Packages to replicate, `name` or `name:version`; needs exactly one
    /// repository
    #[arg(long, num_args = 1..)]
    pub packages: Vec<String>,

    /// Maximum attempts per outbound call
    #[arg(long, default_value_t = 10)]
    pub max_retries: u32,

    /// Base delay between retries in seconds
    #[arg(long, default_value_t = 1)]
    pub retry_delay: u64,

    /// Connect and read timeout for HTTP calls, in seconds
    #[arg(long, default_value_t = 120)]
    pub http_timeout: u64,

    /// Reissue the CodeArtifact token after this many hours
    #[arg(long, default_value_t = 5)]
    pub token_refresh_hours: u64,

    /// Disable progress bar
    #[arg(long)]
    pub no_progress_bar: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub store: CacheArgs,

    /// Repositories to report on
    #[arg(long, num_args = 1.., required = true)]
    pub repositories: Vec<String>,
}
