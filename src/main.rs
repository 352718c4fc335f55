//! artifact-replicator: resumable replication of Artifactory repositories
//! into AWS CodeArtifact.
//!
//! Versions are discovered from the source, compared against what the
//! destination already reports as published and uploaded only when missing
//! or incomplete. Progress is cached per repository, package and version so
//! an interrupted or partially failed run picks up where it stopped.

#![warn(clippy::all)]

mod cli;
mod config;
mod destination;
mod driver;
mod engine;
mod package;
mod resolver;
pub mod retry;
mod shutdown;
mod source;
mod state;
mod types;

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Instant;

use aws_config::{BehaviorVersion, Region, SdkConfig};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Command;
use config::{CacheLocation, Config};
use destination::CodeArtifactRegistry;
use driver::{Driver, DriverOptions};
use source::ArtifactoryClient;
use state::{DryRunStore, DynamoTable, KvStateStore, SqliteStateStore, StateStore};

async fn load_aws_config(region: Option<&str>) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(Region::new(region.to_string()));
    }
    loader.load().await
}

/// Open the configured state store.
async fn open_state(
    location: &CacheLocation,
    sdk_config: &SdkConfig,
) -> anyhow::Result<Arc<dyn StateStore>> {
    let state: Arc<dyn StateStore> = match location {
        CacheLocation::Memory => {
            tracing::debug!("Caching disabled, using in-memory state");
            Arc::new(SqliteStateStore::open_in_memory()?)
        }
        CacheLocation::Sqlite(path) => {
            tracing::debug!("State database at {}", path.display());
            Arc::new(SqliteStateStore::open(path).await?)
        }
        CacheLocation::DynamoDb { name } => {
            tracing::debug!(name = %name, "State in DynamoDB");
            let client = aws_sdk_dynamodb::Client::new(sdk_config);
            Arc::new(KvStateStore::open(DynamoTable::new(client, name)).await?)
        }
    };
    Ok(state)
}

/// Run the status command.
async fn run_status(args: cli::StatusArgs) -> anyhow::Result<()> {
    let location = CacheLocation::persistent(&args.store, false);
    if let CacheLocation::Sqlite(path) = &location {
        if !path.exists() {
            println!("No state database found at {}", path.display());
            println!("Run a replication with --cache first to create it.");
            return Ok(());
        }
    }
    let sdk_config = load_aws_config(args.store.region.as_deref()).await;
    let state = open_state(&location, &sdk_config).await?;

    for repo in &args.repositories {
        println!("Repository: {}", repo);
        let Some(repo_state) = state.repository_state(repo).await? else {
            println!("  not replicated yet");
            println!();
            continue;
        };
        let yes_no = |b: bool| if b { "yes" } else { "no" };
        println!("  Versions fetched:  {}", yes_no(repo_state.all_versions_fetched));
        println!("  All published:     {}", yes_no(repo_state.all_versions_published));
        println!("  Publish failures:  {}", yes_no(repo_state.publish_failed));
        println!("  Packages:          {}", state.list_packages(repo).await?.len());

        let failed = state.list_failed_versions(repo).await?;
        if !failed.is_empty() {
            println!("  Failed versions:");
            for version in failed {
                let when = version
                    .failed_at
                    .map(|t| t.format(" (%Y-%m-%d %H:%M:%S UTC)").to_string())
                    .unwrap_or_default();
                println!(
                    "    {}:{}{} - {}",
                    version.package, version.version, when, version.error
                );
            }
        }
        println!();
    }
    Ok(())
}

/// Run the replicate command.
async fn run_replicate(args: cli::ReplicateArgs) -> anyhow::Result<()> {
    let mut config = Config::from_cli(args)?;
    tracing::debug!(?config, "Configuration");
    tracing::info!(
        workers = config.workers,
        dry_run = config.dry_run,
        "Starting artifact-replicator"
    );

    let password = match config.artifactory_password.take() {
        Some(password) => password,
        None if std::io::stdin().is_terminal() => tokio::task::block_in_place(|| {
            rpassword::prompt_password(format!(
                "Artifactory password for {}: ",
                config.artifactory_user
            ))
        })?,
        None => anyhow::bail!(
            "No Artifactory password: set ARTIFACTORY_PASSWORD or run interactively"
        ),
    };
    let source = Arc::new(ArtifactoryClient::new(
        &config.artifactory_url,
        &config.artifactory_user,
        &password,
        config.http_timeout,
    )?);

    let sdk_config = load_aws_config(config.region.as_deref()).await;
    // Retries are applied per call by the driver and engine
    let codeartifact_config = aws_sdk_codeartifact::config::Builder::from(&sdk_config)
        .retry_config(aws_sdk_codeartifact::config::retry::RetryConfig::disabled())
        .build();
    let destination = Arc::new(CodeArtifactRegistry::new(
        aws_sdk_codeartifact::Client::from_conf(codeartifact_config),
        &config.codeartifact_domain,
        config.codeartifact_account.clone(),
        config.http_timeout,
    )?);

    let mut state = open_state(&config.cache, &sdk_config).await?;
    if config.dry_run {
        state = Arc::new(DryRunStore::new(state));
    }
    if config.clean {
        tracing::info!("Wiping cached replication state");
        state.wipe().await?;
    }

    let shutdown_token = shutdown::install_signal_handler()?;
    let driver = Driver::new(
        state,
        source,
        destination,
        DriverOptions {
            workers: config.workers,
            refresh: config.refresh,
            dry_run: config.dry_run,
            token_max_age: config.token_max_age,
            retry: config.retry,
            scratch_dir: config.scratch_dir.clone(),
            no_progress_bar: config.no_progress_bar,
        },
    );

    let started = Instant::now();
    let summary = driver
        .run(&config.scope, &shutdown_token)
        .await
        .inspect_err(|e| tracing::error!(error = %e, "Replication aborted"))?;
    summary.log(started.elapsed());
    if summary.failed > 0 {
        tracing::warn!(
            "{} versions failed; they are retried on the next run",
            summary.failed
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    match cli.command {
        Command::Status(args) => run_status(args).await,
        Command::Replicate(args) => run_replicate(args).await,
    }
}
