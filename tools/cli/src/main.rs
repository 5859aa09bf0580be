//! FieldSync CLI - Command line interface for offline sync tooling.
//!
//! This tool resolves conflict descriptors, reconciles JSON fixtures of a
//! local cache against a remote replica, and edits the persisted scheduler
//! configuration.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fieldsync_storage::{MemoryCache, MemoryRemote};
use fieldsync_sync::{
    config::load_config_or_default, ConflictDescriptor, ConflictResolver, EntitySyncOutcome,
    JsonFileSchedulerStore, PolicyRegistry, ResolutionStrategy, SchedulerStore, SyncEngine,
    SyncEngineConfig,
};

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "FieldSync - Offline sync and conflict resolution")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a single conflict descriptor.
    Resolve {
        /// JSON file holding the descriptor.
        #[arg(short, long)]
        descriptor: PathBuf,

        /// Default strategy, e.g. "latest-wins" or "local-wins".
        #[arg(short, long, default_value = "latest-wins")]
        strategy: String,

        /// Entity type used to look up merge functions.
        #[arg(short, long)]
        entity_type: Option<String>,
    },

    /// Reconcile every cached entity of a type against a remote fixture.
    Sync {
        /// Local cache fixture (JSON).
        #[arg(short, long)]
        local: PathBuf,

        /// Remote replica fixture (JSON).
        #[arg(short, long)]
        remote: PathBuf,

        /// Entity type to reconcile.
        #[arg(short, long)]
        entity_type: String,

        /// Default strategy.
        #[arg(short, long, default_value = "latest-wins")]
        strategy: String,

        /// Maximum entities reconciled at once.
        #[arg(short, long, default_value_t = 3)]
        concurrency: usize,

        /// Push resolved values back to the remote.
        #[arg(long)]
        push: bool,

        /// Write the updated fixtures back to disk.
        #[arg(short, long)]
        write: bool,
    },

    /// Show or change the persisted scheduler configuration.
    Config {
        /// Scheduler state file.
        #[arg(long, default_value = "fieldsync-scheduler.json")]
        store: PathBuf,

        /// Set a field, e.g. `--set requireWifi=true`. Repeatable.
        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging, RUST_LOG wins over --verbose
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Resolve {
            descriptor,
            strategy,
            entity_type,
        } => cmd_resolve(&descriptor, &strategy, entity_type.as_deref()).await,

        Commands::Sync {
            local,
            remote,
            entity_type,
            strategy,
            concurrency,
            push,
            write,
        } => {
            let options = SyncOptions {
                strategy: parse_strategy(&strategy)?,
                concurrency,
                push,
                write,
            };
            cmd_sync(&local, &remote, &entity_type, options).await
        }

        Commands::Config { store, overrides } => cmd_config(&store, &overrides).await,
    }
}

fn parse_strategy(value: &str) -> Result<ResolutionStrategy> {
    value
        .parse()
        .with_context(|| format!("Invalid strategy: {}", value))
}

async fn read_file(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

/// Resolve one descriptor and print the outcome.
async fn cmd_resolve(path: &Path, strategy: &str, entity_type: Option<&str>) -> Result<()> {
    let descriptor: ConflictDescriptor =
        serde_json::from_str(&read_file(path).await?).context("Invalid descriptor JSON")?;

    let policy = Arc::new(PolicyRegistry::with_default_strategy(parse_strategy(strategy)?));
    let resolver = ConflictResolver::new(policy);

    let outcome = resolver
        .resolve(&descriptor, entity_type)
        .await
        .context("Failed to resolve conflict")?;

    info!(
        "Resolved {} ({}) using {}",
        descriptor.id(),
        descriptor.conflict_type(),
        outcome.strategy_used()
    );
    let report = serde_json::json!({
        "id": descriptor.id(),
        "type": descriptor.conflict_type(),
        "strategyUsed": outcome.strategy_used(),
        "shouldDelete": outcome.should_delete(),
        "resolvedData": outcome.resolved_data(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

struct SyncOptions {
    strategy: ResolutionStrategy,
    concurrency: usize,
    push: bool,
    write: bool,
}

/// Reconcile a local fixture against a remote fixture.
async fn cmd_sync(
    local_path: &Path,
    remote_path: &Path,
    entity_type: &str,
    options: SyncOptions,
) -> Result<()> {
    let cache = Arc::new(
        MemoryCache::from_json(&read_file(local_path).await?)
            .context("Invalid local cache fixture")?,
    );
    let remote = Arc::new(
        MemoryRemote::from_json(&read_file(remote_path).await?)
            .context("Invalid remote fixture")?,
    );

    let engine = SyncEngine::new(
        cache.clone(),
        remote.clone(),
        Arc::new(PolicyRegistry::with_default_strategy(options.strategy)),
        SyncEngineConfig {
            max_concurrent: options.concurrency.max(1),
            push_resolved: options.push,
            ..SyncEngineConfig::default()
        },
    );

    let batch = engine
        .sync_all_entities(entity_type)
        .await
        .context("Sync failed")?;

    let mut reports = batch.reports.clone();
    reports.sort_by(|a, b| a.key.cmp(&b.key));
    for report in &reports {
        let status = match &report.outcome {
            EntitySyncOutcome::NothingToDo => "nothing to do".to_string(),
            EntitySyncOutcome::Unchanged => "unchanged".to_string(),
            EntitySyncOutcome::Resolved { strategy } => format!("resolved ({})", strategy),
            EntitySyncOutcome::Deleted { strategy } => format!("deleted ({})", strategy),
            EntitySyncOutcome::Deferred { reason } => format!("deferred: {}", reason),
        };
        println!("  {:<30} {}", report.key.to_string(), status);
    }
    for failure in batch.failures.iter().filter(|f| !f.deferred) {
        println!("  {:<30} error: {}", failure.key.to_string(), failure.message);
    }

    println!(
        "\n{} attempted, {} synced, {} conflicts resolved, {} deferred, {} failed ({:?})",
        batch.attempted(),
        batch.synced(),
        batch.conflicts_resolved(),
        batch.deferred(),
        batch.failed(),
        batch.duration
    );

    if options.write {
        tokio::fs::write(local_path, cache.to_json()?)
            .await
            .with_context(|| format!("Failed to write {}", local_path.display()))?;
        tokio::fs::write(remote_path, remote.to_json()?)
            .await
            .with_context(|| format!("Failed to write {}", remote_path.display()))?;
        info!("Fixtures updated");
    }

    Ok(())
}

/// Print the scheduler configuration, applying any overrides first.
async fn cmd_config(path: &Path, overrides: &[String]) -> Result<()> {
    let store = JsonFileSchedulerStore::new(path);
    let mut config = load_config_or_default(&store)
        .await
        .context("Failed to load scheduler configuration")?;

    if !overrides.is_empty() {
        for entry in overrides {
            let (field, value) = entry
                .split_once('=')
                .with_context(|| format!("Expected KEY=VALUE, got {}", entry))?;
            config = config
                .with_override(field.trim(), value.trim())
                .with_context(|| format!("Cannot apply {}", entry))?;
        }
        store
            .save_config(&config)
            .await
            .context("Failed to save scheduler configuration")?;
        info!("Saved configuration to {}", path.display());
    }

    println!("{}", serde_json::to_string_pretty(&config)?);

    let last_sync = store
        .load_last_sync()
        .await
        .context("Failed to load last sync time")?;
    match last_sync {
        Some(at) => println!("Last successful sync: {}", at.to_rfc3339()),
        None => println!("Last successful sync: never"),
    }

    Ok(())
}
