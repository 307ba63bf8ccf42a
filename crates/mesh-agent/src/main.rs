//! mesh-agent: Per-node liveness agent.
//!
//! Registers with the curator, keeps links open to every peer the curator
//! lists, and reports which of them are reachable.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mesh_agent::{identity, AlertPipeline, Agent, Config, PeerServer, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "mesh-agent")]
#[command(about = "Node liveness mesh agent")]
struct Args {
    /// Path to a JSON config file
    #[arg(short, long, env = "MESH_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Curator address (host:port)
    #[arg(long, env = "CURATOR_ADDR")]
    curator: Option<String>,

    /// Cluster API base URL used to resolve the node name
    #[arg(long, env = "CLUSTER_ADDR")]
    cluster_addr: Option<String>,

    /// Host used to discover the outbound IP
    #[arg(long, env = "KUBERNETES_API_ADDR")]
    kubernetes_api_addr: Option<String>,

    /// Bearer token for the cluster API
    #[arg(long, env = "AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    /// Port for the inbound peer server
    #[arg(long, env = "PEER_PORT")]
    peer_port: Option<u16>,

    /// Use this node name instead of asking the cluster API
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// Advertise this IP instead of probing for it
    #[arg(long, env = "ADVERTISE_IP")]
    advertise_ip: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    /// Flags win over the config file.
    fn apply(self, config: &mut Config) {
        if let Some(curator) = self.curator {
            config.curator_addr = curator;
        }
        if let Some(cluster_addr) = self.cluster_addr {
            config.cluster_addr = cluster_addr;
        }
        if let Some(addr) = self.kubernetes_api_addr {
            config.kubernetes_api_addr = addr;
        }
        if let Some(token) = self.auth_token {
            config.auth_token = token;
        }
        if let Some(port) = self.peer_port {
            config.peer_port = port;
        }
        if self.node_name.is_some() {
            config.node_name = self.node_name;
        }
        if self.advertise_ip.is_some() {
            config.advertise_ip = self.advertise_ip;
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,mesh_agent=debug"
    } else {
        "info,mesh_agent=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting mesh-agent");

    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    info!("Curator address: {}", config.curator_addr);

    let identity = match identity::resolve(&config).await {
        Ok(identity) => identity,
        Err(e) => {
            error!("Cannot determine local identity: {}", e);
            return Err(e).context("Identity resolution failed");
        }
    };

    let shutdown = CancellationToken::new();
    let grace = config.timing.shutdown_grace();
    let listen_addr = format!("{}:{}", identity.ip, config.peer_port);
    let ws_path = config.ws_path.clone();

    let (agent, queues) = Agent::new(config, identity);
    tokio::spawn(AlertPipeline::new(queues.alerts).run(agent.clone()));
    tokio::spawn(Supervisor::new(agent.clone(), queues.outbound).run(shutdown.clone()));

    let listener = PeerServer::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind peer server on {}", listen_addr))?;
    tokio::spawn(PeerServer::new(ws_path).serve(listener, shutdown.clone()));

    info!("Agent running. Press Ctrl+C to stop.");
    wait_for_shutdown_signal().await?;

    info!("Shutdown signal received, exiting in {:?}", grace);
    shutdown.cancel();
    tokio::time::sleep(grace).await;

    info!("Shutting down");
    Ok(())
}
