//! Overlay node CLI Application
//!
//! Runs a node that admits peers through the overlay handshake.

use clap::{Parser, Subcommand};
use overlay_admission::network::{Node, NodeConfig, OverlayAddress};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "overlay-node")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Overlay network node with handshake-gated admission", long_about = None)]
struct Cli {
    /// JSON config file; flags given on the command line take precedence
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Run {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Initial peers to connect to (comma-separated)
        #[arg(long)]
        peers: Option<String>,

        /// Network id announced in the handshake
        #[arg(long)]
        network_id: Option<u64>,

        /// Protocol version announced in the handshake
        #[arg(long)]
        protocol_version: Option<u32>,
    },

    /// Generate a fresh overlay address
    Address,
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };

    match cli.command {
        Commands::Run {
            port,
            peers,
            network_id,
            protocol_version,
        } => {
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(peers) = peers {
                config.bootstrap_peers = peers.split(',').map(|s| s.trim().to_string()).collect();
            }
            if let Some(network_id) = network_id {
                config.network_id = network_id;
            }
            if let Some(version) = protocol_version {
                config.protocol_version = version;
            }
            run_node(config)
        }

        Commands::Address => {
            let addr = OverlayAddress::random();
            println!("overlay:  {}", hex::encode(addr.overlay));
            println!("underlay: {}", hex::encode(&addr.underlay));
            Ok(())
        }
    }
}

fn run_node(config: NodeConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let mut node = Node::new(config)?;
        log::info!("Local overlay address {}", hex::encode(node.address.overlay));

        // Handle Ctrl+C
        let shutdown = node.shutdown_handle();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            let _ = shutdown.send(()).await;
        });

        node.start().await
    })
}
