//! Exchange session driver
//!
//! Attaches simulated peers to one protocol instance over in-memory pipes and
//! drives them through connect, exchange and disconnect assertions. Any
//! mismatch stops the run with an [`ExchangeError`]; nothing is retried.

use crate::network::message::{Frame, PeerIdentity};
use crate::network::peer::{Peer, PeerError};
use crate::network::session::{pipe, Connection, Disconnect, PeerInitializer, Protocol};
use crate::network::CodeMap;
use crate::testing::exchange::{Exchange, ExchangeError, Expect, ExpectedDisconnect};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Default wait for each expected message or event
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(2);

/// Reports admissions back to the harness. Runs after every other step.
struct AdmissionSignal(mpsc::UnboundedSender<PeerIdentity>);

impl PeerInitializer for AdmissionSignal {
    fn init(&self, peer: &Peer) -> Result<(), PeerError> {
        // The harness may already be gone during teardown
        let _ = self.0.send(peer.id());
        Ok(())
    }
}

/// Scripted driver over simulated peer connections
pub struct ExchangeSession {
    protocol: Arc<Protocol>,
    ids: Vec<PeerIdentity>,
    conns: HashMap<PeerIdentity, Connection>,
    tasks: Vec<JoinHandle<()>>,
    admitted_rx: mpsc::UnboundedReceiver<PeerIdentity>,
    admitted: HashSet<PeerIdentity>,
    events_tx: mpsc::UnboundedSender<Disconnect>,
    events_rx: mpsc::UnboundedReceiver<Disconnect>,
    timeout: Duration,
}

impl ExchangeSession {
    /// Create a session with `peers` simulated peers.
    ///
    /// Peer `i` has the identity derived from the address `sim-peer-<i>`.
    pub fn new(protocol: Protocol, peers: usize) -> Self {
        let (admitted_tx, admitted_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let protocol = protocol.with_initializer(Arc::new(AdmissionSignal(admitted_tx)));
        let ids = (0..peers)
            .map(|i| PeerIdentity::derive(format!("sim-peer-{}", i).as_bytes()))
            .collect();

        Self {
            protocol: Arc::new(protocol),
            ids,
            conns: HashMap::new(),
            tasks: Vec::new(),
            admitted_rx,
            admitted: HashSet::new(),
            events_tx,
            events_rx,
            timeout: EXCHANGE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Identities of the simulated peers
    pub fn ids(&self) -> &[PeerIdentity] {
        &self.ids
    }

    pub fn codemap(&self) -> &CodeMap {
        self.protocol.codemap()
    }

    pub fn is_connected(&self, id: &PeerIdentity) -> bool {
        self.conns.contains_key(id)
    }

    /// Connect the given simulated peers, each starting its own session
    pub fn connect(&mut self, ids: &[PeerIdentity]) -> Result<(), ExchangeError> {
        for id in ids {
            if !self.ids.contains(id) {
                return Err(ExchangeError::UnknownPeer(*id));
            }
            if self.conns.contains_key(id) {
                return Err(ExchangeError::AlreadyConnected(*id));
            }
        }

        for id in ids {
            self.admitted.remove(id);
            let (local, remote) = pipe();
            let protocol = self.protocol.clone();
            let events = self.events_tx.clone();
            let id = *id;
            self.tasks.push(tokio::spawn(async move {
                let disconnect = protocol.run(id, local).await;
                let _ = events.send(disconnect);
            }));
            self.conns.insert(id, remote);
            log::debug!("Simulated peer {} connected", id);
        }
        Ok(())
    }

    /// Close a simulated peer's end of its pipe, as a transport failure would
    pub fn disconnect(&mut self, id: &PeerIdentity) -> Result<(), ExchangeError> {
        self.conns
            .remove(id)
            .map(Connection::close)
            .ok_or(ExchangeError::NotConnected(*id))
    }

    /// Run a script step by step
    pub async fn run_exchanges(&mut self, script: &[Exchange]) -> Result<(), ExchangeError> {
        for (step, exchange) in script.iter().enumerate() {
            self.run_exchange(step, exchange).await?;
        }
        Ok(())
    }

    async fn run_exchange(&mut self, step: usize, exchange: &Exchange) -> Result<(), ExchangeError> {
        for trigger in &exchange.triggers {
            self.codemap()
                .type_of(trigger.code)
                .map_err(|source| ExchangeError::Script { step, source })?;
            let payload = serde_json::to_vec(&trigger.msg)
                .map_err(|e| ExchangeError::Encode(e.to_string()))?;
            let conn = self
                .conns
                .get(&trigger.peer)
                .ok_or(ExchangeError::NotConnected(trigger.peer))?;
            conn.send(Frame::new(trigger.code, payload))
                .await
                .map_err(|e| ExchangeError::TriggerFailed {
                    step,
                    peer: trigger.peer,
                    code: trigger.code,
                    reason: e.to_string(),
                })?;
        }

        // Expects are matched per peer, in any order within the step
        let mut by_peer: Vec<(PeerIdentity, Vec<&Expect>)> = Vec::new();
        for expect in &exchange.expects {
            self.codemap()
                .type_of(expect.code)
                .map_err(|source| ExchangeError::Script { step, source })?;
            match by_peer.iter_mut().find(|(peer, _)| *peer == expect.peer) {
                Some((_, pending)) => pending.push(expect),
                None => by_peer.push((expect.peer, vec![expect])),
            }
        }

        for (peer, mut pending) in by_peer {
            let wait = self.timeout;
            let conn = self
                .conns
                .get_mut(&peer)
                .ok_or(ExchangeError::NotConnected(peer))?;

            while let Some(first) = pending.first() {
                let code = first.code;
                let frame = match timeout(wait, conn.recv()).await {
                    Err(_) => {
                        return Err(ExchangeError::Timeout {
                            step,
                            peer,
                            code,
                            timeout: wait,
                        })
                    }
                    Ok(Err(e)) => {
                        return Err(ExchangeError::ExpectFailed {
                            step,
                            peer,
                            code,
                            reason: e.to_string(),
                        })
                    }
                    Ok(Ok(frame)) => frame,
                };

                let msg: Value = serde_json::from_slice(&frame.payload)
                    .unwrap_or_else(|_| Value::String(frame.payload_text()));
                match pending
                    .iter()
                    .position(|e| e.code == frame.code && e.msg == msg)
                {
                    Some(idx) => {
                        pending.swap_remove(idx);
                    }
                    None => {
                        let expected: Vec<String> = pending.iter().map(|e| e.describe()).collect();
                        return Err(ExchangeError::UnexpectedMessage {
                            step,
                            peer,
                            code: frame.code,
                            payload: msg.to_string(),
                            expected: expected.join(" | "),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Wait until every given peer has been admitted by the protocol.
    ///
    /// Admissions seen earlier, including ones read while waiting for other
    /// peers, count. Any disconnect observed while waiting fails the run.
    pub async fn expect_admitted(&mut self, ids: &[PeerIdentity]) -> Result<(), ExchangeError> {
        let mut pending: HashSet<PeerIdentity> = ids
            .iter()
            .filter(|id| !self.admitted.contains(*id))
            .copied()
            .collect();
        while !pending.is_empty() {
            let admitted_rx = &mut self.admitted_rx;
            let events_rx = &mut self.events_rx;
            let next = timeout(self.timeout, async {
                tokio::select! {
                    admitted = admitted_rx.recv() => admitted.map(Ok),
                    event = events_rx.recv() => event.map(Err),
                }
            })
            .await;
            match next {
                Ok(Some(Ok(id))) => {
                    self.admitted.insert(id);
                    pending.remove(&id);
                }
                Ok(Some(Err(disconnect))) => {
                    self.conns.remove(&disconnect.peer);
                    return Err(ExchangeError::UnexpectedDisconnect {
                        peer: disconnect.peer,
                        reason: disconnect.error.to_string(),
                    });
                }
                Ok(None) | Err(_) => {
                    return Err(ExchangeError::EventTimeout {
                        waiting: "admission",
                        peers: describe(pending.iter()),
                        timeout: self.timeout,
                    })
                }
            }
        }
        Ok(())
    }

    /// Assert exactly the given disconnects happen, with their exact reasons
    pub async fn expect_disconnects(
        &mut self,
        expected: &[ExpectedDisconnect],
    ) -> Result<(), ExchangeError> {
        let mut pending: Vec<&ExpectedDisconnect> = expected.iter().collect();
        while !pending.is_empty() {
            let event = match timeout(self.timeout, self.events_rx.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) | Err(_) => {
                    return Err(ExchangeError::EventTimeout {
                        waiting: "disconnect",
                        peers: describe(pending.iter().map(|d| &d.peer)),
                        timeout: self.timeout,
                    })
                }
            };
            self.conns.remove(&event.peer);

            let actual = event.error.to_string();
            let idx = pending
                .iter()
                .position(|d| d.peer == event.peer)
                .ok_or_else(|| ExchangeError::UnexpectedDisconnect {
                    peer: event.peer,
                    reason: actual.clone(),
                })?;
            if pending[idx].error != actual {
                return Err(ExchangeError::DisconnectMismatch {
                    peer: event.peer,
                    expected: pending[idx].error.clone(),
                    actual,
                });
            }
            pending.swap_remove(idx);
        }

        if let Ok(extra) = self.events_rx.try_recv() {
            return Err(ExchangeError::UnexpectedDisconnect {
                peer: extra.peer,
                reason: extra.error.to_string(),
            });
        }
        Ok(())
    }

    /// Force-disconnect every remaining peer and wait for all sessions to
    /// finish, including their disconnect hooks.
    ///
    /// Returns the disconnects not yet asserted.
    pub async fn shutdown(mut self) -> Vec<Disconnect> {
        self.conns.clear();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                log::warn!("Session task failed: {}", e);
            }
        }

        let mut remaining = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            remaining.push(event);
        }
        remaining
    }
}

fn describe<'a>(ids: impl Iterator<Item = &'a PeerIdentity>) -> String {
    let ids: Vec<String> = ids.map(|id| id.to_string()).collect();
    format!("[{}]", ids.join(", "))
}
