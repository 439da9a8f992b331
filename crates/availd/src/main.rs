//! availd: the cluster availability daemon.
//!
//! Single binary that assembles the availability layers:
//! - Entity tables (redb)
//! - Service and service group state machines
//! - Service domains: election, neighbor exchange, scheduling
//! - Controller failover and peer heartbeat
//!
//! # Usage
//!
//! ```text
//! availd run --config /etc/availd/availd.toml
//! availd set-node --node controller-1 --action swact
//! ```

mod engine;
mod process;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use avail_core::{
    AdminState, AvailConfig, AvailStatus, NodeSetAction, OperState, TracingAlarmSink, WorkerThread,
};
use avail_failover::{FileMarker, MemoryMarker, StayFailedMarker};
use avail_msg::{ControlRequest, SetNode};
use avail_state::{StateStore, Tables};
use clap::{Parser, Subcommand};
use tokio::net::UnixDatagram;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::engine::{Engine, EngineEvent};
use crate::process::TokioLauncher;
use crate::transport::Transport;

/// Upper bound on a loop iteration when no timer is armed.
const IDLE_WAKEUP: Duration = Duration::from_secs(1);
const CONTROL_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "availd", about = "Cluster availability daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon.
    Run {
        #[arg(long, default_value = "/etc/availd/availd.toml")]
        config: PathBuf,
    },

    /// Parse and validate a configuration file.
    CheckConfig {
        #[arg(long, default_value = "/etc/availd/availd.toml")]
        config: PathBuf,
    },

    /// Print a starter configuration for a simplex node.
    Scaffold {
        #[arg(long)]
        node: String,
    },

    /// Send a SET_NODE request to a running daemon and wait for the ack.
    SetNode {
        #[arg(long, default_value = "/etc/availd/availd.toml")]
        config: PathBuf,
        #[arg(long)]
        node: String,
        /// lock, unlock, swact, swact-force or event.
        #[arg(long)]
        action: String,
        #[arg(long, default_value = "unlocked")]
        admin: String,
        #[arg(long, default_value = "enabled")]
        oper: String,
        #[arg(long, default_value = "available")]
        avail: String,
    },

    /// Ask a running daemon to restart a service.
    RestartService {
        #[arg(long, default_value = "/etc/availd/availd.toml")]
        config: PathBuf,
        #[arg(long)]
        service: String,
        /// Leave dependent services running.
        #[arg(long)]
        skip_dependents: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => {
            let config = AvailConfig::from_file(&config)?;
            init_tracing(&config);
            run(config).await
        }
        Command::CheckConfig { config } => {
            let parsed = AvailConfig::from_file(&config)?;
            println!(
                "{}: ok (node {}, {} services, {} groups, {} domains)",
                config.display(),
                parsed.node.name,
                parsed.services.len(),
                parsed.service_groups.len(),
                parsed.domains.len()
            );
            Ok(())
        }
        Command::Scaffold { node } => {
            print!("{}", AvailConfig::scaffold(&node).to_toml_string()?);
            Ok(())
        }
        Command::SetNode {
            config,
            node,
            action,
            admin,
            oper,
            avail,
        } => {
            let set = SetNode {
                seqno: seqno(),
                origin: "availd-cli".into(),
                node,
                action: action.parse::<NodeSetAction>()?,
                admin: admin.parse::<AdminState>()?,
                oper: oper.parse::<OperState>()?,
                avail: avail.parse::<AvailStatus>()?,
            };
            let config = AvailConfig::from_file(&config)?;
            let reply = request(&config, ControlRequest::SetNode(set), true).await?;
            if let Some(reply) = reply {
                println!("{reply}");
            }
            Ok(())
        }
        Command::RestartService {
            config,
            service,
            skip_dependents,
        } => {
            let config = AvailConfig::from_file(&config)?;
            let restart = ControlRequest::RestartService {
                seqno: seqno(),
                origin: "availd-cli".into(),
                service,
                skip_dependents,
            };
            request(&config, restart, false).await?;
            Ok(())
        }
    }
}

/// `RUST_LOG` wins over the configured filter.
fn init_tracing(config: &AvailConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.logging.filter))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn seqno() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

async fn run(config: AvailConfig) -> anyhow::Result<()> {
    info!(node = %config.node.name, mode = %config.node.system_mode, "availd starting");

    std::fs::create_dir_all(&config.paths.data_dir)
        .with_context(|| format!("creating {}", config.paths.data_dir.display()))?;
    let db_path = config.paths.data_dir.join("availd.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    let mut tables = Tables::with_store(store)?;
    tables.provision(&config)?;
    info!(
        nodes = tables.nodes.len(),
        services = tables.services.len(),
        groups = tables.service_groups.len(),
        domains = tables.domains.len(),
        "tables provisioned"
    );

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let launcher = Arc::new(TokioLauncher::new(Handle::current(), events_tx.clone()));
    let marker = stay_failed_marker(&config);
    let worker = WorkerThread::spawn("availd-worker")?;

    let mut engine = Engine::new(
        &config,
        tables,
        launcher.clone(),
        marker,
        Arc::new(TracingAlarmSink),
        Some(worker),
    )?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    // ── Sockets ────────────────────────────────────────────────

    let transport = Transport::bind(&config, events_tx.clone(), shutdown_rx.clone()).await?;

    engine.set_clock(std::time::Instant::now());
    engine.start()?;
    // Interfaces whose sockets bound are taken to be up.
    for kind in transport.kinds() {
        engine.handle(EngineEvent::LinkChange { kind, up: true })?;
    }
    transport.send(engine.take_outbox()).await;
    info!("availd running");

    // ── Event loop ─────────────────────────────────────────────

    loop {
        let wake = engine
            .next_deadline()
            .map(tokio::time::Instant::from_std)
            .unwrap_or_else(|| tokio::time::Instant::now() + IDLE_WAKEUP);

        tokio::select! {
            Some(event) = events_rx.recv() => {
                engine.set_clock(std::time::Instant::now());
                if let Err(e) = engine.handle(event) {
                    warn!(error = %e, "event handling failed");
                }
            }
            _ = tokio::time::sleep_until(wake) => {
                if let Err(e) = engine.dispatch_timers(std::time::Instant::now()) {
                    error!(error = %e, "timer dispatch failed");
                }
            }
            _ = shutdown_rx.changed() => {
                if let Err(e) = engine.handle(EngineEvent::Shutdown) {
                    warn!(error = %e, "shutdown incomplete");
                }
            }
        }
        transport.send(engine.take_outbox()).await;
        if engine.is_stopped() {
            break;
        }
    }

    let stats = engine.stats();
    info!(
        rx = stats.rx_total,
        tx = stats.tx_total,
        dropped = stats.dropped(),
        plugins_running = launcher.running(),
        "availd stopped"
    );
    match serde_json::to_string(stats) {
        Ok(json) => info!(stats = %json, "message counters"),
        Err(e) => warn!(error = %e, "message counters not serializable"),
    }
    Ok(())
}

fn stay_failed_marker(config: &AvailConfig) -> Box<dyn StayFailedMarker> {
    if config.node.system_mode.is_duplex() {
        Box::new(FileMarker::new(&config.paths.stay_failed_file))
    } else {
        Box::new(MemoryMarker::default())
    }
}

async fn wait_for_signal() {
    let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

/// Send one control request. With `wait_ack`, bind the client socket and
/// wait for the daemon's reply.
async fn request(
    config: &AvailConfig,
    request: ControlRequest,
    wait_ack: bool,
) -> anyhow::Result<Option<ControlRequest>> {
    let client_path = &config.paths.control_client_socket;
    let socket = if wait_ack {
        if client_path.exists() {
            std::fs::remove_file(client_path)?;
        }
        UnixDatagram::bind(client_path).with_context(|| format!("binding {}", client_path.display()))?
    } else {
        UnixDatagram::unbound()?
    };
    socket
        .send_to(request.to_string().as_bytes(), &config.paths.control_socket)
        .await
        .with_context(|| format!("sending to {}", config.paths.control_socket.display()))?;
    if !wait_ack {
        return Ok(None);
    }

    let mut buf = [0u8; 1024];
    let len = tokio::time::timeout(CONTROL_REPLY_TIMEOUT, socket.recv(&mut buf))
        .await
        .context("no reply from availd")??;
    let _ = std::fs::remove_file(client_path);
    let reply = ControlRequest::parse(&String::from_utf8_lossy(&buf[..len]))?;
    Ok(Some(reply))
}
