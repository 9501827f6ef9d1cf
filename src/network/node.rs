//! Overlay node implementation
//!
//! The node accepts TCP connections, dials bootstrap peers and runs every
//! connection through the admission protocol.

use crate::network::codemap::CodeMap;
use crate::network::message::{
    HandshakeMessage, OverlayAddress, PeerIdentity, NETWORK_ID, PROTOCOL_VERSION,
};
use crate::network::peer::{PeerError, PeerRegistry};
use crate::network::server::{attach, connect_to_peer, Server};
use crate::network::session::{Connection, Protocol};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Port to listen on
    pub port: u16,
    /// Initial peers to connect to
    pub bootstrap_peers: Vec<String>,
    /// Protocol version announced in our handshake
    pub protocol_version: u32,
    /// Network we belong to
    pub network_id: u64,
    /// Seconds to wait for a peer's handshake
    pub handshake_timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: 30399,
            bootstrap_peers: Vec::new(),
            protocol_version: PROTOCOL_VERSION,
            network_id: NETWORK_ID,
            handshake_timeout_secs: 10,
        }
    }
}

impl NodeConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Node status information
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub port: u16,
    pub network_id: u64,
    pub peers: usize,
}

/// The overlay node
pub struct Node {
    pub config: NodeConfig,
    pub address: OverlayAddress,
    pub registry: PeerRegistry,
    protocol: Arc<Protocol>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: Option<mpsc::Receiver<()>>,
}

impl Node {
    /// Create a node with a fresh overlay address
    pub fn new(config: NodeConfig) -> Result<Self, PeerError> {
        Self::with_address(config, OverlayAddress::random())
    }

    pub fn with_address(config: NodeConfig, address: OverlayAddress) -> Result<Self, PeerError> {
        let registry = PeerRegistry::new();
        let local = HandshakeMessage::new(
            config.protocol_version,
            config.network_id,
            address.clone(),
        );
        let protocol = Protocol::new(local, Arc::new(CodeMap::standard()))?
            .with_handshake_timeout(config.handshake_timeout())
            .with_initializer(Arc::new(registry.clone()));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        Ok(Self {
            config,
            address,
            registry,
            protocol: Arc::new(protocol),
            shutdown_tx,
            shutdown_rx: Some(shutdown_rx),
        })
    }

    /// Start the node and serve until shut down
    pub async fn start(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut shutdown_rx = self.shutdown_rx.take().ok_or("node already started")?;

        let server = Server::bind(self.config.port).await?;
        log::info!(
            "Node started on port {} (network {})",
            server.port(),
            self.config.network_id
        );

        for peer_addr in &self.config.bootstrap_peers {
            if let Err(e) = self.connect_to(peer_addr).await {
                log::warn!("Failed to connect to {}: {}", peer_addr, e);
            }
        }

        loop {
            tokio::select! {
                accepted = server.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::info!("Incoming connection from {}", addr);
                        spawn_session(self.protocol.clone(), addr, attach(stream, addr));
                    }
                    Err(e) => {
                        log::error!("Accept error: {}", e);
                    }
                },
                _ = shutdown_rx.recv() => {
                    log::info!("Node shutting down...");
                    break;
                }
            }
        }

        for id in self.registry.peer_ids() {
            if let Some(peer) = self.registry.get(&id) {
                peer.disconnect(None);
            }
        }

        Ok(())
    }

    /// Connect to a peer
    pub async fn connect_to(&self, addr: &str) -> Result<(), PeerError> {
        log::info!("Connecting to peer: {}", addr);
        let (stream, peer_addr) = connect_to_peer(addr).await?;
        spawn_session(self.protocol.clone(), peer_addr, attach(stream, peer_addr));
        Ok(())
    }

    /// Handle that stops a running node
    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            port: self.config.port,
            network_id: self.config.network_id,
            peers: self.registry.len(),
        }
    }
}

/// Identity of a TCP peer, derived from its socket address
pub fn identity_for(addr: &SocketAddr) -> PeerIdentity {
    PeerIdentity::derive(addr.to_string().as_bytes())
}

fn spawn_session(protocol: Arc<Protocol>, addr: SocketAddr, conn: Connection) {
    tokio::spawn(async move {
        let disconnect = protocol.run(identity_for(&addr), conn).await;
        log::info!("Session with {} ended: {}", addr, disconnect.error);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_creation() {
        let config = NodeConfig {
            port: 18333,
            ..Default::default()
        };

        let node = Node::new(config).unwrap();
        let status = node.status();

        assert_eq!(status.port, 18333);
        assert_eq!(status.network_id, 322);
        assert_eq!(status.peers, 0);
    }

    #[test]
    fn test_load_config_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{"port": 4000, "network_id": 7}"#).unwrap();

        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.network_id, 7);
        assert_eq!(config.protocol_version, PROTOCOL_VERSION);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_load_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, "port = 4000").unwrap();

        assert!(matches!(
            NodeConfig::load(&path),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            NodeConfig::load(&dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_start_until_shutdown() {
        let mut node = Node::new(NodeConfig {
            port: 0,
            ..Default::default()
        })
        .unwrap();
        let shutdown = node.shutdown_handle();
        shutdown.send(()).await.unwrap();

        node.start().await.unwrap();
        assert!(node.start().await.is_err());
    }

    #[tokio::test]
    async fn test_two_nodes_admit_each_other() {
        let a = Node::new(NodeConfig::default()).unwrap();
        let b = Node::new(NodeConfig::default()).unwrap();

        let server = Server::bind(0).await.unwrap();
        let port = server.port();
        let dial = tokio::spawn(async move {
            connect_to_peer(&format!("127.0.0.1:{}", port)).await.unwrap()
        });
        let (inbound, inbound_addr) = server.accept().await.unwrap();
        let (outbound, outbound_addr) = dial.await.unwrap();

        spawn_session(a.protocol.clone(), inbound_addr, attach(inbound, inbound_addr));
        spawn_session(b.protocol.clone(), outbound_addr, attach(outbound, outbound_addr));

        let admitted = tokio::time::timeout(Duration::from_secs(5), async {
            while a.registry.is_empty() || b.registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(admitted.is_ok());
        assert!(a.registry.has(&identity_for(&inbound_addr)));
        assert!(b.registry.has(&identity_for(&outbound_addr)));
    }
}
