//! Network message types for overlay admission
//!
//! Defines peer identities, overlay addresses, the handshake message and the
//! framed wire representation every message travels in.

use crate::crypto::sha256_array;
use bytes::Bytes;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version spoken by this node
pub const PROTOCOL_VERSION: u32 = 0;

/// Default network id
pub const NETWORK_ID: u64 = 322;

/// Wire code reserved for the handshake message
pub const HANDSHAKE_CODE: u64 = 0;

/// A message type that can be registered in a [`CodeMap`](super::CodeMap)
pub trait ProtocolMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Type name used in diagnostics
    const NAME: &'static str;
}

/// Unique identifier of a network participant
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerIdentity([u8; 32]);

impl PeerIdentity {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive an identity from arbitrary address material
    pub fn derive(data: &[u8]) -> Self {
        Self(sha256_array(data))
    }

    /// Generate a random identity
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps registry dumps readable
        write!(f, "PeerIdentity({})", &self.to_hex()[..8])
    }
}

/// Routable overlay address carried inside the handshake
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OverlayAddress {
    /// Position in the overlay address space
    pub overlay: [u8; 32],
    /// Transport-level address material
    pub underlay: Vec<u8>,
}

impl OverlayAddress {
    pub fn new(overlay: [u8; 32], underlay: Vec<u8>) -> Self {
        Self { overlay, underlay }
    }

    /// Address of the peer with the given identity.
    ///
    /// The underlay is the identity itself and the overlay is its hash, so
    /// [`OverlayAddress::identity`] recovers the identity.
    pub fn from_identity(id: &PeerIdentity) -> Self {
        Self {
            overlay: sha256_array(id.as_bytes()),
            underlay: id.as_bytes().to_vec(),
        }
    }

    /// Address for a freshly generated identity
    pub fn random() -> Self {
        Self::from_identity(&PeerIdentity::random())
    }

    /// Identity encoded in the underlay, if it holds one
    pub fn identity(&self) -> Option<PeerIdentity> {
        let bytes: [u8; 32] = self.underlay.as_slice().try_into().ok()?;
        Some(PeerIdentity(bytes))
    }
}

/// Handshake message exchanged once per direction at connection start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    /// Protocol version
    pub version: u32,
    /// Network the node belongs to
    pub network_id: u64,
    /// Node's overlay address
    pub addr: OverlayAddress,
}

impl HandshakeMessage {
    pub fn new(version: u32, network_id: u64, addr: OverlayAddress) -> Self {
        Self {
            version,
            network_id,
            addr,
        }
    }

    /// Handshake for the default protocol version and network
    pub fn standard(addr: OverlayAddress) -> Self {
        Self::new(PROTOCOL_VERSION, NETWORK_ID, addr)
    }
}

impl ProtocolMessage for HandshakeMessage {
    const NAME: &'static str = "HandshakeMessage";
}

/// A message on the wire: its code and encoded payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(code: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }

    /// Payload rendered for logs and diagnostics
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_from_identity() {
        let id = PeerIdentity::derive(b"sim-peer-0");
        let addr = OverlayAddress::from_identity(&id);

        assert_eq!(addr.identity(), Some(id));
        assert_eq!(addr.overlay, sha256_array(id.as_bytes()));
    }

    #[test]
    fn test_address_without_identity() {
        let addr = OverlayAddress::new([7u8; 32], b"127.0.0.1:30399".to_vec());
        assert_eq!(addr.identity(), None);
    }

    #[test]
    fn test_handshake() {
        let handshake = HandshakeMessage::standard(OverlayAddress::random());
        assert_eq!(handshake.version, PROTOCOL_VERSION);
        assert_eq!(handshake.network_id, 322);
    }

    #[test]
    fn test_identity_derivation_is_deterministic() {
        assert_eq!(PeerIdentity::derive(b"a"), PeerIdentity::derive(b"a"));
        assert_ne!(PeerIdentity::derive(b"a"), PeerIdentity::derive(b"b"));
        assert_ne!(PeerIdentity::random(), PeerIdentity::random());
    }
}
