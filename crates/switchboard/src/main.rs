//! # switchboard
//!
//! Switchboard server binary. Loads settings, starts the hub and serves
//! WebSocket clients until SIGINT/SIGTERM.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use switchboard_core::logging::{LogFormat, init_subscriber};
use switchboard_hub::{ClusterForwarder, Hub};
use switchboard_rpc::{ActionRegistry, InMemorySessionStore, RequestRouter, SessionStore};
use switchboard_server::actions::register_builtin_actions;
use switchboard_server::config::hub_config;
use switchboard_server::metrics::install_recorder;
use switchboard_server::shutdown::wait_for_signal;
use switchboard_server::{HttpClusterTransport, ServerConfig, SwitchboardServer};
use switchboard_settings::{ClusterSettings, SwitchboardSettings, load_settings_from_path, settings_path};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Switchboard real-time connection hub.
#[derive(Parser, Debug)]
#[command(name = "switchboard", version, about = "Switchboard real-time connection hub")]
struct Cli {
    /// Settings file (default `~/.switchboard/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Log level or filter directive (`RUST_LOG` still wins).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,

    /// This node's cluster id.
    #[arg(long)]
    node_id: Option<String>,

    /// Peer base URL. Repeat for several; enables forwarding. The shared
    /// secret comes from settings or `SWITCHBOARD_CLUSTER_SECRET`.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// JSON file seeding the session store.
    #[arg(long)]
    sessions_file: Option<PathBuf>,
}

impl Cli {
    /// Flags win over the settings file and environment.
    fn apply(&self, settings: &mut SwitchboardSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.log_json {
            settings.logging.json = true;
        }
        if let Some(node_id) = &self.node_id {
            settings.cluster.node_id.clone_from(node_id);
        }
        if !self.peers.is_empty() {
            settings.cluster.peers.clone_from(&self.peers);
            settings.cluster.enabled = true;
        }
        if let Some(path) = &self.sessions_file {
            settings.auth.sessions_file = Some(path.to_string_lossy().into_owned());
        }
    }
}

/// Configured node id, or a fresh one.
fn resolve_node_id(cluster: &ClusterSettings) -> String {
    if cluster.node_id.is_empty() {
        format!("node-{}", uuid::Uuid::now_v7().simple())
    } else {
        cluster.node_id.clone()
    }
}

fn load_sessions(path: Option<&str>) -> Result<InMemorySessionStore> {
    let Some(path) = path else {
        warn!("no sessions file configured, every connection will be refused");
        return Ok(InMemorySessionStore::new());
    };
    let store = InMemorySessionStore::from_json_file(Path::new(path))
        .with_context(|| format!("Failed to load sessions from {path}"))?;
    info!(path, sessions = store.len(), "session store loaded");
    Ok(store)
}

/// Start the forwarder when clustering is enabled and peers are known.
fn start_forwarder(cluster: &ClusterSettings) -> Result<Option<(ClusterForwarder, JoinHandle<()>)>> {
    if !cluster.enabled {
        return Ok(None);
    }
    if cluster.peers.is_empty() {
        warn!("cluster enabled without peers, forwarding disabled");
        return Ok(None);
    }
    let transport = HttpClusterTransport::new(
        cluster.peers.clone(),
        cluster.secret.clone(),
        Duration::from_millis(cluster.request_timeout_ms),
    )
    .context("Failed to build cluster HTTP client")?;
    info!(peers = ?cluster.peers, "cluster forwarding enabled");
    Ok(Some(ClusterForwarder::spawn(
        Arc::new(transport),
        cluster.forward_queue_capacity,
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = cli.config.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    init_subscriber(
        &settings.logging.level,
        LogFormat::from_json_flag(settings.logging.json),
    );
    let metrics = install_recorder().context("Failed to install metrics recorder")?;

    let node_id = resolve_node_id(&settings.cluster);
    let sessions: Arc<dyn SessionStore> =
        Arc::new(load_sessions(settings.auth.sessions_file.as_deref())?);

    let (forwarder, forwarder_task) = start_forwarder(&settings.cluster)?.unzip();
    let hub = Hub::start(hub_config(&settings), node_id.clone(), forwarder);

    let mut registry =
        ActionRegistry::with_timeout(Duration::from_millis(settings.rpc.handler_timeout_ms));
    register_builtin_actions(&mut registry);
    info!(actions = ?registry.actions(), "actions registered");
    let router = RequestRouter::new(Arc::new(registry), Arc::clone(&sessions), Arc::clone(&hub));

    let server = SwitchboardServer::new(
        ServerConfig::from_settings(&settings),
        Arc::clone(&hub),
        router,
        sessions,
        metrics,
    );
    let (addr, serve_task) = server
        .listen()
        .await
        .with_context(|| format!("Failed to bind {}", server.config().bind_addr()))?;
    info!(%addr, node_id = %node_id, "switchboard ready");

    let shutdown = Arc::clone(server.shutdown());
    shutdown.track(serve_task);
    if let Some(task) = forwarder_task {
        shutdown.track(task);
    }

    wait_for_signal().await;
    info!("shutting down");
    // stop accepting first, then close live connections
    shutdown.shutdown();
    hub.shutdown().await;
    shutdown
        .graceful_shutdown(server.config().shutdown_timeout)
        .await;
    info!("shutdown complete");
    Ok(())
}
