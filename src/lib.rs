//! Overlay Admission: the entry protocol of a peer-to-peer overlay network
//!
//! This crate provides:
//! - A message code registry mapping message types to wire codes
//! - A handshake negotiating protocol version and network membership
//! - A peer registry kept in step with session connect/disconnect events
//! - A session runtime over in-memory pipes or TCP
//! - A scripted exchange harness for protocol conformance tests
//!
//! # Example
//!
//! ```rust
//! use overlay_admission::network::{HandshakeMessage, OverlayAddress, PeerError};
//! use overlay_admission::network::validate;
//!
//! let local = HandshakeMessage::new(0, 322, OverlayAddress::random());
//! let remote = HandshakeMessage::new(1, 322, OverlayAddress::random());
//!
//! let err = validate(&local, &remote).unwrap_err();
//! assert_eq!(err, PeerError::VersionMismatch { incoming: 1, local: 0 });
//! assert_eq!(err.to_string(), "version mismatch 1 (!= 0)");
//! ```

pub mod crypto;
pub mod network;
pub mod testing;

// Re-export commonly used types
pub use network::{
    CodeMap, HandshakeMessage, Node, NodeConfig, OverlayAddress, Peer, PeerError, PeerIdentity,
    PeerRegistry, Protocol,
};
pub use testing::ExchangeSession;
