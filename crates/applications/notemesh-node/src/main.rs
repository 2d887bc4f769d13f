//! notemesh command-line node and development relay

mod console;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use notemesh_net::{event_channel, spawn, Node, NodeConfig, RelayClient, RelayServer, WebRtcTransport};
use notemesh_replica::FileSnapshotStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Peer-to-peer replicated notes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the signaling relay
    Relay {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:3000")]
        listen: SocketAddr,
    },
    /// Run a node and read commands from stdin
    Node {
        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Relay URL, overriding the configuration
        #[arg(long)]
        relay: Option<String>,

        /// Directory for note snapshots
        #[arg(long, default_value = "notemesh-data")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Relay { listen } => run_relay(listen).await,
        Command::Node {
            config,
            relay,
            data_dir,
        } => run_node(config, relay, data_dir).await,
    }
}

async fn run_relay(listen: SocketAddr) -> Result<()> {
    let server = RelayServer::bind(listen)
        .await
        .with_context(|| format!("failed to bind relay to {listen}"))?;

    tokio::select! {
        result = server.run() => result.context("relay stopped"),
        _ = tokio::signal::ctrl_c() => {
            info!("Relay shutting down");
            Ok(())
        }
    }
}

fn load_config(path: Option<PathBuf>, relay: Option<String>) -> Result<NodeConfig> {
    let mut config = match path {
        Some(path) => NodeConfig::from_file(&path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => NodeConfig::default(),
    };
    if let Some(relay) = relay {
        config.relay_url = relay;
    }
    config.validate()?;
    Ok(config)
}

async fn run_node(config_path: Option<PathBuf>, relay_url: Option<String>, data_dir: PathBuf) -> Result<()> {
    let config = load_config(config_path, relay_url)?;
    let local_id = config.resolve_node_id();
    info!(node = %local_id, relay = %config.relay_url, "Starting notemesh node");

    let persistence = Arc::new(
        FileSnapshotStore::open(&data_dir)
            .with_context(|| format!("failed to open data dir {}", data_dir.display()))?,
    );
    let transport = Arc::new(WebRtcTransport::new(&config.webrtc)?);
    let relay = Arc::new(RelayClient::new(config.relay_url.clone(), local_id.clone()));
    let (events_tx, events_rx) = event_channel();

    let node = Node::new(config, local_id.clone(), transport, relay.clone(), events_tx.clone(), persistence)?;
    let handle = spawn(node, events_rx);
    relay.connect(events_tx).await.context("failed to reach relay")?;

    println!("node {local_id} ready, type help for commands");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match console::parse(&line) {
                    Ok(command) => match console::execute(&handle, command).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => {
                            error!("command failed: {e:#}");
                            println!("error: {e:#}");
                        }
                    },
                    Err(e) => println!("{e:#}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!(node = %local_id, "Shutting down");
    if let Err(e) = handle.shutdown().await {
        warn!("node did not shut down cleanly: {e}");
    }
    relay.disconnect().await;
    Ok(())
}
