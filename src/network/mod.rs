//! P2P Networking module
//!
//! Provides the entry protocol for peers joining the overlay.
//!
//! # Features
//! - Message code registry
//! - Version and network id handshake
//! - Registry of admitted peers
//! - Per-connection session runtime
//! - TCP transport and node

pub mod codemap;
pub mod handshake;
pub mod message;
pub mod node;
pub mod peer;
pub mod server;
pub mod session;

pub use codemap::{CodeMap, CodeMapError, MessageType};
pub use handshake::{perform_handshake, validate};
pub use message::{
    Frame, HandshakeMessage, OverlayAddress, PeerIdentity, ProtocolMessage, HANDSHAKE_CODE,
    NETWORK_ID, PROTOCOL_VERSION,
};
pub use node::{identity_for, ConfigError, Node, NodeConfig, NodeStatus};
pub use peer::{DisconnectHook, Peer, PeerError, PeerRegistry};
pub use server::{attach, connect_to_peer, FrameCodec, Server, MAGIC, MAX_FRAME_SIZE};
pub use session::{
    pipe, Connection, Disconnect, MessageHandler, PeerInitializer, Protocol, HANDSHAKE_TIMEOUT,
};
