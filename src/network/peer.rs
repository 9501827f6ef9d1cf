//! Peers and the peer registry
//!
//! A [`Peer`] is the runtime record of an admitted connection. The
//! [`PeerRegistry`] tracks every peer that passed the handshake and has not
//! disconnected yet.

use crate::network::codemap::{CodeMap, CodeMapError};
use crate::network::message::{Frame, OverlayAddress, PeerIdentity, ProtocolMessage};
use crate::network::session::{Delivery, PeerInitializer};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Peer connection errors.
///
/// Every session ends with one of these; its `Display` text is the
/// disconnect reason observed by the rest of the system.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("version mismatch {incoming} (!= {local})")]
    VersionMismatch { incoming: u32, local: u32 },
    #[error("network id mismatch {incoming} (!= {local})")]
    NetworkIdMismatch { incoming: u64, local: u64 },
    #[error("read or write on closed message pipe")]
    ClosedPipe,
    #[error("expected handshake, got message code {0}")]
    UnexpectedMessage(u64),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("peer {0} not found")]
    UnknownPeer(PeerIdentity),
    #[error(transparent)]
    Codec(#[from] CodeMapError),
    /// Transport failure, text passed through verbatim
    #[error("{0}")]
    Transport(String),
}

impl From<std::io::Error> for PeerError {
    fn from(err: std::io::Error) -> Self {
        PeerError::Transport(err.to_string())
    }
}

/// Notification fired once when a peer's session terminates
pub trait DisconnectHook: Send + Sync {
    fn on_disconnect(&self, peer: &PeerIdentity, reason: &PeerError);
}

impl<F> DisconnectHook for F
where
    F: Fn(&PeerIdentity, &PeerError) + Send + Sync,
{
    fn on_disconnect(&self, peer: &PeerIdentity, reason: &PeerError) {
        self(peer, reason)
    }
}

struct PeerInner {
    id: PeerIdentity,
    addr: OverlayAddress,
    codemap: Arc<CodeMap>,
    /// Outbound half of the connection, taken when the session ends
    tx: Mutex<Option<mpsc::Sender<Delivery>>>,
    drop_tx: mpsc::UnboundedSender<PeerError>,
    hooks: Mutex<Vec<Arc<dyn DisconnectHook>>>,
}

/// Handle to an admitted peer session
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    pub(crate) fn new(
        id: PeerIdentity,
        addr: OverlayAddress,
        codemap: Arc<CodeMap>,
        tx: mpsc::Sender<Delivery>,
        drop_tx: mpsc::UnboundedSender<PeerError>,
    ) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                id,
                addr,
                codemap,
                tx: Mutex::new(Some(tx)),
                drop_tx,
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> PeerIdentity {
        self.inner.id
    }

    /// Overlay address resolved during the handshake
    pub fn addr(&self) -> &OverlayAddress {
        &self.inner.addr
    }

    pub fn codemap(&self) -> &CodeMap {
        &self.inner.codemap
    }

    /// Whether the session is still running
    pub fn is_connected(&self) -> bool {
        self.inner.tx.lock().is_some()
    }

    /// Send a typed message to the peer
    pub async fn send<T: ProtocolMessage>(&self, msg: &T) -> Result<(), PeerError> {
        let frame = self.inner.codemap.encode(msg)?;
        self.send_frame(frame).await
    }

    /// Send an already encoded frame to the peer
    pub async fn send_frame(&self, frame: Frame) -> Result<(), PeerError> {
        let tx = self.inner.tx.lock().clone().ok_or(PeerError::ClosedPipe)?;
        log::debug!("Sending code {} to {}", frame.code, self.inner.id);
        tx.send(Ok(frame)).await.map_err(|_| PeerError::ClosedPipe)
    }

    /// Force-terminate the session.
    ///
    /// Without a reason the session ends as if its pipe had been closed.
    pub fn disconnect(&self, reason: Option<PeerError>) {
        let reason = reason.unwrap_or(PeerError::ClosedPipe);
        if self.inner.drop_tx.send(reason).is_err() {
            log::debug!("Disconnect requested for finished session {}", self.inner.id);
        }
    }

    /// Subscribe to the termination of this session
    pub fn subscribe(&self, hook: Arc<dyn DisconnectHook>) {
        self.inner.hooks.lock().push(hook);
    }

    /// Close the outbound pipe and fire every subscribed hook once
    pub(crate) fn terminate(&self, reason: &PeerError) {
        self.inner.tx.lock().take();
        let hooks = std::mem::take(&mut *self.inner.hooks.lock());
        for hook in hooks {
            hook.on_disconnect(&self.inner.id, reason);
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.inner.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Registry of admitted peers.
///
/// Cloning yields another handle onto the same registry.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<PeerIdentity, Peer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer, replacing any entry with the same identity
    pub fn add(&self, peer: Peer) {
        let id = peer.id();
        if self.peers.write().insert(id, peer).is_some() {
            log::debug!("Replaced registry entry for {}", id);
        }
        log::info!("Added peer: {}", id);
    }

    /// Remove a peer. Unknown identities are ignored.
    pub fn remove(&self, id: &PeerIdentity) {
        if self.peers.write().remove(id).is_some() {
            log::info!("Removed peer: {}", id);
        }
    }

    pub fn has(&self, id: &PeerIdentity) -> bool {
        self.peers.read().contains_key(id)
    }

    pub fn get(&self, id: &PeerIdentity) -> Option<Peer> {
        self.peers.read().get(id).cloned()
    }

    /// Identities of all admitted peers
    pub fn peer_ids(&self) -> Vec<PeerIdentity> {
        self.peers.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Send a message to a specific peer
    pub async fn send_to<T: ProtocolMessage>(
        &self,
        id: &PeerIdentity,
        msg: &T,
    ) -> Result<(), PeerError> {
        let peer = self.get(id).ok_or(PeerError::UnknownPeer(*id))?;
        peer.send(msg).await
    }

    /// Broadcast a message to all peers
    pub async fn broadcast<T: ProtocolMessage>(&self, msg: &T) {
        let peers: Vec<Peer> = self.peers.read().values().cloned().collect();
        for peer in peers {
            if let Err(e) = peer.send(msg).await {
                log::warn!("Failed to send to {}: {}", peer.id(), e);
            }
        }
    }
}

impl DisconnectHook for PeerRegistry {
    fn on_disconnect(&self, peer: &PeerIdentity, reason: &PeerError) {
        log::debug!("Peer {} disconnected: {}", peer, reason);
        self.remove(peer);
    }
}

impl PeerInitializer for PeerRegistry {
    fn init(&self, peer: &Peer) -> Result<(), PeerError> {
        self.add(peer.clone());
        peer.subscribe(Arc::new(self.clone()));
        Ok(())
    }
}

impl fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.peers.read().keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_peer(seed: &[u8]) -> (Peer, mpsc::Receiver<Delivery>) {
        let id = PeerIdentity::derive(seed);
        let (tx, rx) = mpsc::channel(8);
        let (drop_tx, _drop_rx) = mpsc::unbounded_channel();
        let peer = Peer::new(
            id,
            OverlayAddress::from_identity(&id),
            Arc::new(CodeMap::standard()),
            tx,
            drop_tx,
        );
        (peer, rx)
    }

    #[test]
    fn test_disconnect_reasons() {
        assert_eq!(
            PeerError::VersionMismatch {
                incoming: 1,
                local: 0
            }
            .to_string(),
            "version mismatch 1 (!= 0)"
        );
        assert_eq!(
            PeerError::NetworkIdMismatch {
                incoming: 321,
                local: 322
            }
            .to_string(),
            "network id mismatch 321 (!= 322)"
        );
        assert_eq!(
            PeerError::ClosedPipe.to_string(),
            "read or write on closed message pipe"
        );
    }

    #[test]
    fn test_add_remove() {
        let registry = PeerRegistry::new();
        let (peer, _rx) = test_peer(b"a");
        let id = peer.id();

        registry.add(peer);
        assert!(registry.has(&id));
        assert_eq!(registry.get(&id).map(|p| p.id()), Some(id));

        registry.remove(&id);
        assert!(!registry.has(&id));
        assert!(registry.get(&id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_without_add_is_noop() {
        let registry = PeerRegistry::new();
        let (peer, _rx) = test_peer(b"a");
        registry.add(peer.clone());

        registry.remove(&PeerIdentity::derive(b"unknown"));
        registry.remove(&PeerIdentity::derive(b"unknown"));
        assert_eq!(registry.peer_ids(), vec![peer.id()]);
    }

    #[test]
    fn test_double_add_overwrites() {
        let registry = PeerRegistry::new();
        let (first, _rx1) = test_peer(b"a");
        let (second, _rx2) = test_peer(b"a");

        registry.add(first);
        registry.add(second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_hooks_fire_once() {
        let (peer, _rx) = test_peer(b"a");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        peer.subscribe(Arc::new(move |_: &PeerIdentity, _: &PeerError| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        peer.terminate(&PeerError::ClosedPipe);
        peer.terminate(&PeerError::ClosedPipe);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!peer.is_connected());
    }

    #[test]
    fn test_registry_initializer_wires_removal() {
        let registry = PeerRegistry::new();
        let (peer, _rx) = test_peer(b"a");

        registry.init(&peer).unwrap();
        assert!(registry.has(&peer.id()));

        peer.terminate(&PeerError::ClosedPipe);
        assert!(!registry.has(&peer.id()));
    }

    #[tokio::test]
    async fn test_send_after_terminate_fails() {
        let (peer, mut rx) = test_peer(b"a");
        peer.send_frame(Frame::new(0, b"{}".to_vec())).await.unwrap();
        assert!(rx.recv().await.is_some());

        peer.terminate(&PeerError::ClosedPipe);
        let err = peer.send_frame(Frame::new(0, b"{}".to_vec())).await;
        assert_eq!(err, Err(PeerError::ClosedPipe));
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let registry = PeerRegistry::new();
        let id = PeerIdentity::derive(b"missing");
        let handshake = crate::network::HandshakeMessage::standard(OverlayAddress::random());
        assert_eq!(
            registry.send_to(&id, &handshake).await,
            Err(PeerError::UnknownPeer(id))
        );
    }
}
