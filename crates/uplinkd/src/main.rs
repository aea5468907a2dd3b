//! uplinkd: uplink health and failover daemon.
//!
//! Wires the probe scheduler to the real world:
//! - Status store (redb)
//! - System `ping` for next-hop probes
//! - hyper/rustls HTTP client for remote probes
//! - Device ports and network instances from the config file
//!
//! # Usage
//!
//! ```text
//! uplinkd run --config /etc/uplinkd/uplinkd.toml
//! uplinkd status --config /etc/uplinkd/uplinkd.toml
//! ```
//!
//! Sending SIGHUP to a running daemon re-reads the ports and instances from
//! the config file. Probe settings only take effect on restart.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use uplink_health::{HyperProbe, ProbeScheduler, SystemPinger, TopologyEvent};
use uplink_state::StatusStore;

use crate::config::{DEFAULT_CONFIG_PATH, DaemonConfig};

#[derive(Parser)]
#[command(name = "uplinkd", about = "Uplink health and failover daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe uplinks until interrupted.
    Run {
        /// Path to the configuration file.
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Print the stored status of every network instance.
    Status {
        /// Path to the configuration file.
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run { config } => run(config).await,
        Command::Status { config } => status(&config),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,uplinkd=debug,uplink_health=debug"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    info!(config = ?config_path, "uplink daemon starting");
    let config = DaemonConfig::from_file(&config_path)?;

    // ── Subsystems ─────────────────────────────────────────────

    if let Some(dir) = config.store.path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating store directory {}", dir.display()))?;
    }
    let store = StatusStore::open(&config.store.path)?;
    info!(path = ?config.store.path, "status store opened");

    let default_target = config.probe.resolve_default_server();
    let http = HyperProbe::new().context("building TLS client config")?;
    let scheduler = ProbeScheduler::new(
        config.probe.clone(),
        store,
        Arc::new(SystemPinger::new()),
        Arc::new(http),
    )
    .with_default_target(default_target);
    let mut signals = scheduler.subscribe();

    // ── Background tasks ───────────────────────────────────────

    let (events_tx, events_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler_handle = tokio::spawn(scheduler.run(events_rx, shutdown_rx.clone()));

    let mut listener_shutdown = shutdown_rx;
    let listener_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = signals.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let signal = signals.borrow_and_update().clone();
                    info!(
                        generation = signal.generation,
                        instances = ?signal.instances,
                        "uplink topology changed"
                    );
                }
                _ = listener_shutdown.changed() => break,
            }
        }
    });

    deliver(&events_tx, config.topology_events()).await?;
    info!(
        ports = config.ports.len(),
        instances = config.instances.len(),
        "topology delivered"
    );

    // ── Signals ────────────────────────────────────────────────

    let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let mut current = config;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for Ctrl-C")?;
                info!("shutdown signal received");
                break;
            }
            _ = hangup.recv() => {
                current = reload(&config_path, current, &events_tx).await?;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = scheduler_handle.await;
    let _ = listener_handle.await;

    info!("uplink daemon stopped");
    Ok(())
}

/// Re-read the config file and re-deliver its topology. Keeps `current`
/// if the file cannot be loaded.
async fn reload(
    path: &Path,
    current: DaemonConfig,
    events_tx: &mpsc::Sender<TopologyEvent>,
) -> anyhow::Result<DaemonConfig> {
    let next = match DaemonConfig::from_file(path) {
        Ok(next) => next,
        Err(e) => {
            warn!(error = %e, "config reload failed, keeping current configuration");
            return Ok(current);
        }
    };

    let removed = next.removed_instances(&current);
    let mut events = next.topology_events();
    events.extend(removed.iter().cloned().map(TopologyEvent::InstanceRemoved));
    deliver(events_tx, events).await?;

    info!(
        ports = next.ports.len(),
        instances = next.instances.len(),
        removed = ?removed,
        "configuration reloaded"
    );
    Ok(next)
}

async fn deliver(
    events_tx: &mpsc::Sender<TopologyEvent>,
    events: Vec<TopologyEvent>,
) -> anyhow::Result<()> {
    for event in events {
        events_tx
            .send(event)
            .await
            .context("probe scheduler is not running")?;
    }
    Ok(())
}

fn status(config_path: &Path) -> anyhow::Result<()> {
    let config = DaemonConfig::from_file(config_path)?;
    let store = StatusStore::open(&config.store.path)
        .with_context(|| format!("opening status store {}", config.store.path.display()))?;
    let statuses = store.list_instance_statuses()?;
    println!("{}", serde_json::to_string_pretty(&statuses)?);
    Ok(())
}
