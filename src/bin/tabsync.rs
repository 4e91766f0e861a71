//! Tabsync CLI Binary
//!
//! Command-line harness for the synchronization engine: runs a simulated
//! multi-context session against an in-memory or sled-backed shared store,
//! and inspects persisted records.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tabsync::config::SyncConfig;
use tabsync::coordinator::Coordinator;
use tabsync::events::EventBus;
use tabsync::logging::{init_logging, LoggingConfig};
use tabsync::runtime::{ContextRuntime, OpOutcome};
use tabsync::sharedstore::{MemorySharedStore, SharedStore, SledSharedStore};
use tabsync::types::{Geometry, PartitionId};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "tabsync", about = "Cross-context window state synchronization engine")]
struct Cli {
    /// Path to a configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error, off
    #[arg(long)]
    log_level: Option<String>,

    /// Log format: json, text
    #[arg(long)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a simulated two-context session and print the event stream
    Demo {
        /// Persist to a sled store at this path instead of in-memory
        #[arg(long)]
        store: Option<PathBuf>,
    },
    /// Print the persisted record held in a sled store
    Inspect {
        #[arg(long)]
        store: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::default();
    if let Some(ref level) = cli.log_level {
        logging.level = level.clone();
    }
    if let Some(ref format) = cli.log_format {
        logging.format = format.clone();
    }
    if let Err(e) = init_logging(Some(&logging)) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    let cfg = match SyncConfig::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Demo { store } => run_demo(cfg, store).await,
        Command::Inspect { store } => inspect(store).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        eprintln!("{}", e);
        process::exit(1);
    }
}

/// Two contexts share one store and one coordinator: the first creates,
/// moves, minimizes, and restores a window; the second observes it all
/// through the propagation paths.
async fn run_demo(cfg: SyncConfig, store_path: Option<PathBuf>) -> anyhow::Result<()> {
    let store: Arc<dyn SharedStore> = match store_path {
        Some(path) => Arc::new(SledSharedStore::new(path)?),
        None => Arc::new(MemorySharedStore::new()),
    };
    let coordinator = Coordinator::new(PartitionId(0));
    let events = EventBus::new();
    let feed = events.subscribe();

    let first = ContextRuntime::new(
        cfg.clone(),
        store.clone(),
        coordinator.client(cfg.clone()),
        events.clone(),
    )?;
    let second = ContextRuntime::new(
        cfg.clone(),
        store.clone(),
        coordinator.client(cfg.clone()),
        events.clone(),
    )?;

    let ctx_a = first.init().await?;
    let ctx_b = second.init().await?;
    first.spawn_tasks();
    second.spawn_tasks();
    info!(%ctx_a, %ctx_b, "contexts online");

    let id = match first.create_entity(Geometry::new(120, 80, 480, 320)).await? {
        OpOutcome::Applied(entity) => entity.id,
        other => anyhow::bail!("unexpected create outcome: {:?}", other),
    };
    let token = first.epoch_token(&id);
    first
        .on_geometry_change_end(&id, Geometry::new(200, 140, 480, 320), token)
        .await?;
    first.minimize(&id).await?;
    first.restore(&id).await?;
    first.flush_now().await?;

    // Let the notice and relay paths drain before reading the second
    // context's view.
    tokio::time::sleep(Duration::from_millis(200)).await;
    if let Some(replica) = second.entity(&id) {
        info!(
            id = %replica.id, revision = %replica.revision,
            "second context converged"
        );
    }

    first.destroy(&id).await?;
    first.flush_now().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    while let Ok(envelope) = feed.try_recv() {
        println!("{}", serde_json::to_string(&envelope)?);
    }

    let record = store.read().await?;
    println!("final record: {}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

async fn inspect(path: PathBuf) -> anyhow::Result<()> {
    let store = SledSharedStore::new(path)?;
    let record = store.read().await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
