//! Hoplink CLI - Forward a node's port through the forward registry
//!
//! Runs the whole data path in one process: the forwarded port, the registry,
//! a framed tunnel and a loopback agent that dials the target.

mod loopback;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hoplink_forward::{ForwardConfig, ForwardManager};
use hoplink_proto::FrameCodec;
use hoplink_server_tcp::{write_frames, ForwardServer, ForwardServerConfig, TunnelDemux};
use loopback::LoopbackAgent;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Hoplink - Multi-hop TCP port forwarding
#[derive(Parser, Debug)]
#[command(name = "hoplink")]
#[command(about = "Hoplink - Multi-hop TCP port forwarding")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a forwarded port and relay its connections to a target address
    #[command(long_about = r#"
Open a forwarded port for a node. Every accepted connection is registered
with the forward registry, tunneled as frames to an in-process agent and
relayed to the target address.

EXAMPLES:
  # Forward local port 15432 to PostgreSQL
  hoplink forward --listen 127.0.0.1:15432 --target 127.0.0.1:5432

  # Load registry settings from a JSON file
  hoplink forward --listen 0.0.0.0:8080 --target 10.0.0.5:80 \
    --config forward.json

ENVIRONMENT VARIABLES:
  HOPLINK_LISTEN   Address to listen on
  HOPLINK_TARGET   Target address to relay to
  HOPLINK_NODE     Node identifier
  HOPLINK_CONFIG   Registry configuration file (JSON)
    "#)]
    Forward {
        /// Address to listen on (e.g., 0.0.0.0:8080)
        #[arg(long, env = "HOPLINK_LISTEN", default_value = "127.0.0.1:0")]
        listen: SocketAddr,

        /// Target address to relay connections to (e.g., 127.0.0.1:5432)
        #[arg(long, env = "HOPLINK_TARGET")]
        target: String,

        /// Node identifier (auto-generated if not specified)
        #[arg(long, env = "HOPLINK_NODE")]
        node: Option<String>,

        /// Registry configuration file (JSON)
        #[arg(long, env = "HOPLINK_CONFIG")]
        config: Option<PathBuf>,

        /// Forget sequence bindings once their connection is closed
        #[arg(long)]
        reclaim_bindings: bool,

        /// Read buffer size per connection in bytes
        #[arg(long, default_value = "8192")]
        read_buffer_size: usize,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<ForwardConfig> {
    let Some(path) = path else {
        return Ok(ForwardConfig::default());
    };

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

async fn run_forward(
    listen: SocketAddr,
    target: String,
    node: String,
    config: ForwardConfig,
    read_buffer_size: usize,
) -> Result<()> {
    if config.reclaim_bindings {
        info!("Sequence bindings are reclaimed on close");
    }
    let registry = ForwardManager::spawn(config);

    // Relay side of the tunnel: demux reads, writer drains outbound frames
    let (relay_side, agent_side) = tokio::io::duplex(64 * 1024);
    let (relay_read, relay_write) = tokio::io::split(relay_side);
    let (tunnel_tx, tunnel_rx) = mpsc::channel(256);

    let writer = tokio::spawn(write_frames(
        tunnel_rx,
        FramedWrite::new(relay_write, FrameCodec),
    ));
    let demux = TunnelDemux::new(registry.clone());
    let mut reader =
        tokio::spawn(async move { demux.run(FramedRead::new(relay_read, FrameCodec)).await });
    let mut agent = tokio::spawn(LoopbackAgent::new(target.clone(), read_buffer_size).run(agent_side));

    let server_config = ForwardServerConfig {
        bind_addr: listen,
        node_uuid: node,
        read_buffer_size,
    };
    let server = ForwardServer::bind(server_config, registry.clone(), tunnel_tx)
        .await
        .context("Failed to open forwarded port")?;

    info!("Node: {}", server.node_uuid());
    info!("Forwarding {} -> {}", server.local_addr(), target);
    let mut server_task = tokio::spawn(server.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        result = &mut reader => {
            match result {
                Ok(Ok(())) => warn!("Tunnel closed"),
                Ok(Err(e)) => error!("Tunnel reader error: {}", e),
                Err(e) => error!("Tunnel reader panicked: {}", e),
            }
        }
        result = &mut agent => {
            match result {
                Ok(Ok(())) => warn!("Agent stopped"),
                Ok(Err(e)) => error!("Agent error: {:#}", e),
                Err(e) => error!("Agent panicked: {}", e),
            }
        }
    }

    // Closes the listener and every connection
    match tokio::time::timeout(Duration::from_secs(5), registry.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => warn!("Forward registry already stopped"),
        Err(_) => warn!("Forward registry did not stop in time"),
    }
    if tokio::time::timeout(Duration::from_secs(5), &mut server_task)
        .await
        .is_err()
    {
        warn!("Accept loop did not stop in time");
        server_task.abort();
    }

    reader.abort();
    agent.abort();
    writer.abort();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Forward {
            listen,
            target,
            node,
            config,
            reclaim_bindings,
            read_buffer_size,
        } => {
            info!("Hoplink starting...");

            let mut forward_config = load_config(config.as_deref())?;
            if reclaim_bindings {
                forward_config.reclaim_bindings = true;
            }

            // Generate node ID if not provided
            let node = node.unwrap_or_else(|| {
                let id = uuid::Uuid::new_v4().to_string();
                info!("Auto-generated node ID: {}", id);
                id
            });

            run_forward(listen, target, node, forward_config, read_buffer_size).await?;

            info!("Hoplink stopped");
            Ok(())
        }
    }
}
