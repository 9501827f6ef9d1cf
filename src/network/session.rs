//! Peer session runtime
//!
//! Every connection runs as its own task: the handshake first, then the
//! initialization steps (registry admission among them), then the message
//! loop until the pipe closes or the peer is dropped.

use crate::network::codemap::CodeMap;
use crate::network::handshake::perform_handshake;
use crate::network::message::{Frame, HandshakeMessage, PeerIdentity, HANDSHAKE_CODE};
use crate::network::peer::{Peer, PeerError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Default time allowed for the remote handshake to arrive
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffered frames per pipe direction
const PIPE_CAPACITY: usize = 64;

/// What a pipe delivers: a frame, or the transport failure that ended it
pub(crate) type Delivery = Result<Frame, PeerError>;

/// One end of a bidirectional frame pipe
#[derive(Debug)]
pub struct Connection {
    pub(crate) tx: mpsc::Sender<Delivery>,
    pub(crate) rx: mpsc::Receiver<Delivery>,
}

/// Create an in-memory connected pair of pipe ends
pub fn pipe() -> (Connection, Connection) {
    let (a_tx, b_rx) = mpsc::channel(PIPE_CAPACITY);
    let (b_tx, a_rx) = mpsc::channel(PIPE_CAPACITY);
    (
        Connection { tx: a_tx, rx: a_rx },
        Connection { tx: b_tx, rx: b_rx },
    )
}

impl Connection {
    pub(crate) fn from_parts(tx: mpsc::Sender<Delivery>, rx: mpsc::Receiver<Delivery>) -> Self {
        Self { tx, rx }
    }

    pub async fn send(&self, frame: Frame) -> Result<(), PeerError> {
        send_frame(&self.tx, frame).await
    }

    /// Receive the next frame. A closed pipe is an error.
    pub async fn recv(&mut self) -> Result<Frame, PeerError> {
        recv_frame(&mut self.rx).await
    }

    /// Close both directions
    pub fn close(self) {}
}

pub(crate) async fn send_frame(
    tx: &mpsc::Sender<Delivery>,
    frame: Frame,
) -> Result<(), PeerError> {
    tx.send(Ok(frame)).await.map_err(|_| PeerError::ClosedPipe)
}

pub(crate) async fn recv_frame(rx: &mut mpsc::Receiver<Delivery>) -> Result<Frame, PeerError> {
    rx.recv().await.unwrap_or(Err(PeerError::ClosedPipe))
}

/// Termination event for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub peer: PeerIdentity,
    pub error: PeerError,
}

/// Setup step run for every newly admitted peer
pub trait PeerInitializer: Send + Sync {
    fn init(&self, peer: &Peer) -> Result<(), PeerError>;
}

/// Service receiving post-handshake traffic
pub trait MessageHandler: Send + Sync {
    fn handle(&self, peer: &Peer, frame: Frame) -> Result<(), PeerError>;
}

/// The admission protocol as run on each connection
#[derive(Clone)]
pub struct Protocol {
    local: HandshakeMessage,
    codemap: Arc<CodeMap>,
    initializers: Vec<Arc<dyn PeerInitializer>>,
    handler: Option<Arc<dyn MessageHandler>>,
    handshake_timeout: Duration,
}

impl Protocol {
    /// Create a protocol instance for the given local handshake.
    ///
    /// Fails if the code map does not carry the handshake at code 0.
    pub fn new(local: HandshakeMessage, codemap: Arc<CodeMap>) -> Result<Self, PeerError> {
        codemap.ensure_handshake_reserved()?;
        Ok(Self {
            local,
            codemap,
            initializers: Vec::new(),
            handler: None,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        })
    }

    /// Append an initialization step. Steps run in the order added.
    pub fn with_initializer(mut self, step: Arc<dyn PeerInitializer>) -> Self {
        self.initializers.push(step);
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn local(&self) -> &HandshakeMessage {
        &self.local
    }

    pub fn codemap(&self) -> &Arc<CodeMap> {
        &self.codemap
    }

    /// Run one connection to completion and report why it ended
    pub async fn run(&self, id: PeerIdentity, mut conn: Connection) -> Disconnect {
        let remote = match perform_handshake(
            &mut conn,
            &self.codemap,
            &self.local,
            self.handshake_timeout,
        )
        .await
        {
            Ok(remote) => remote,
            Err(error) => {
                log::warn!("Handshake with {} failed: {}", id, error);
                return Disconnect { peer: id, error };
            }
        };

        let (drop_tx, mut drop_rx) = mpsc::unbounded_channel();
        let Connection { tx, mut rx } = conn;
        let peer = Peer::new(id, remote.addr, self.codemap.clone(), tx, drop_tx);
        log::info!("Peer {} admitted (network {})", id, remote.network_id);

        let error = match self.initialize(&peer) {
            Err(error) => error,
            Ok(()) => loop {
                tokio::select! {
                    Some(reason) = drop_rx.recv() => break reason,
                    delivery = recv_frame(&mut rx) => {
                        let result = delivery.and_then(|frame| self.dispatch(&peer, frame));
                        if let Err(error) = result {
                            break error;
                        }
                    }
                }
            },
        };

        // Dropping the receiver closes the inbound direction as well
        drop(rx);
        peer.terminate(&error);
        log::info!("Peer {} disconnected: {}", id, error);
        Disconnect { peer: id, error }
    }

    fn initialize(&self, peer: &Peer) -> Result<(), PeerError> {
        for step in &self.initializers {
            step.init(peer)?;
        }
        Ok(())
    }

    fn dispatch(&self, peer: &Peer, frame: Frame) -> Result<(), PeerError> {
        let entry = self.codemap.type_of(frame.code)?;
        if frame.code == HANDSHAKE_CODE {
            log::warn!("Ignoring repeated handshake from {}", peer.id());
            return Ok(());
        }
        match &self.handler {
            Some(handler) => handler.handle(peer, frame),
            None => {
                log::debug!("No handler for {} from {}", entry.name, peer.id());
                Ok(())
            }
        }
    }
}
