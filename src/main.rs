mod agent;
mod cache;
mod classifier;
mod config;
mod error;
mod event;
mod lifecycle;
mod logging;
mod messaging;
mod notification;
mod origin;
mod request;
mod server;
mod strategy;
mod sync;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{CacheManager, CacheStorage, MemoryStorage, SqliteStorage, SystemClock};
use crate::config::{Config, StorageBackend};
use crate::event::{Event, Outcome};
use crate::origin::HttpOrigin;
use crate::sync::ConnectivityMonitor;

#[derive(Parser, Debug)]
#[command(name = "tarmac")]
#[command(about = "An offline-first caching agent for a client app and its origin server")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tarmac/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Origin server base URL
  #[arg(long, global = true)]
  origin: Option<String>,

  /// Address to listen on
  #[arg(long, global = true)]
  listen: Option<String>,

  /// Keep the cache in memory only
  #[arg(long, global = true)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
  /// Run the agent (default)
  Serve,
  /// List cache partitions with their entry counts
  Partitions,
  /// Delete every cache partition
  Purge,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration, then let flags win
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(origin) = args.origin {
    config.origin = origin;
  }
  if let Some(listen) = args.listen {
    config.listen = listen;
  }
  if args.ephemeral {
    config.storage.backend = StorageBackend::Memory;
  }

  let command = args.command.unwrap_or(Command::Serve);
  let log_dir = match command {
    Command::Serve => logging::default_log_dir(),
    _ => None,
  };
  let _guard = logging::init(log_dir.as_deref())?;

  let storage = open_storage(&config)?;

  match command {
    Command::Serve => serve(config, storage).await,
    Command::Partitions => list_partitions(&config, storage),
    Command::Purge => {
      let removed = CacheManager::new(storage, config.version.clone()).purge_all()?;
      println!("Removed {removed} partitions");
      Ok(())
    }
  }
}

fn open_storage(config: &Config) -> Result<Arc<dyn CacheStorage>> {
  Ok(match config.storage.backend {
    StorageBackend::Memory => Arc::new(MemoryStorage::new()),
    StorageBackend::Sqlite => Arc::new(SqliteStorage::open(&config.database_path()?)?),
  })
}

fn list_partitions(config: &Config, storage: Arc<dyn CacheStorage>) -> Result<()> {
  let manager = CacheManager::new(storage, config.version.clone());
  let allow = manager.allow_list();

  for partition in manager.partitions()? {
    let entries = manager.entry_count(&partition.name)?;
    let marker = if allow.contains(&partition.name) {
      ""
    } else {
      "  (obsolete)"
    };
    println!("{:<24} {:>6} entries{}", partition.name, entries, marker);
  }
  Ok(())
}

async fn serve(config: Config, storage: Arc<dyn CacheStorage>) -> Result<()> {
  let origin = Arc::new(HttpOrigin::new(&config.origin, config.fetch_timeout())?);
  let probe = origin.base().clone();
  let listen = config.listen.clone();
  let interval = config.probe_interval();
  let timeout = config.fetch_timeout();

  let agent = Arc::new(agent::Agent::new(
    config,
    storage,
    origin.clone(),
    Arc::new(SystemClock),
  )?);
  let dispatch = agent.start();

  match dispatch.dispatch(Event::Install).await? {
    Outcome::Installed(report) => info!(
      version = %report.version,
      precached = report.precached,
      failed = report.failed.len(),
      state = report.state.as_str(),
      "install finished"
    ),
    other => warn!(?other, "unexpected install outcome"),
  }

  if let Some(interval) = interval {
    ConnectivityMonitor::new(origin, probe, timeout).spawn(interval, dispatch.clone());
  }

  server::serve(server::AppState { agent, dispatch }, &listen).await
}
