//! Exchange scripts
//!
//! A script is plain data: an ordered list of [`Exchange`] steps, each holding
//! the messages the harness sends to the protocol under test (triggers) and
//! the messages it must receive back (expects).

use crate::network::message::{HandshakeMessage, PeerIdentity, HANDSHAKE_CODE};
use crate::network::CodeMapError;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Harness failures. Every variant names where the run went wrong.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("unknown peer {0}")]
    UnknownPeer(PeerIdentity),
    #[error("peer {0} is already connected")]
    AlreadyConnected(PeerIdentity),
    #[error("peer {0} is not connected")]
    NotConnected(PeerIdentity),
    #[error("cannot encode message: {0}")]
    Encode(String),
    #[error("exchange {step}: {source}")]
    Script {
        step: usize,
        #[source]
        source: CodeMapError,
    },
    #[error("exchange {step}: trigger code {code} to {peer} failed: {reason}")]
    TriggerFailed {
        step: usize,
        peer: PeerIdentity,
        code: u64,
        reason: String,
    },
    #[error("exchange {step}: timed out after {timeout:?} waiting for code {code} from {peer}")]
    Timeout {
        step: usize,
        peer: PeerIdentity,
        code: u64,
        timeout: Duration,
    },
    #[error("exchange {step}: pipe to {peer} failed while expecting code {code}: {reason}")]
    ExpectFailed {
        step: usize,
        peer: PeerIdentity,
        code: u64,
        reason: String,
    },
    #[error(
        "exchange {step}: unexpected message from {peer}: code {code} {payload} (expected {expected})"
    )]
    UnexpectedMessage {
        step: usize,
        peer: PeerIdentity,
        code: u64,
        payload: String,
        expected: String,
    },
    #[error("timed out after {timeout:?} waiting for {waiting} of {peers}")]
    EventTimeout {
        waiting: &'static str,
        peers: String,
        timeout: Duration,
    },
    #[error("disconnect of {peer}: expected error {expected:?}, got {actual:?}")]
    DisconnectMismatch {
        peer: PeerIdentity,
        expected: String,
        actual: String,
    },
    #[error("unexpected disconnect of {peer}: {reason}")]
    UnexpectedDisconnect { peer: PeerIdentity, reason: String },
}

/// A message the protocol under test must send to `peer`
#[derive(Debug, Clone, PartialEq)]
pub struct Expect {
    pub code: u64,
    pub msg: Value,
    pub peer: PeerIdentity,
}

impl Expect {
    pub fn new<T: Serialize>(code: u64, msg: &T, peer: PeerIdentity) -> Result<Self, ExchangeError> {
        Ok(Self {
            code,
            msg: to_value(msg)?,
            peer,
        })
    }

    pub(crate) fn describe(&self) -> String {
        format!("code {} {}", self.code, self.msg)
    }
}

/// A message the harness sends from `peer` to the protocol under test
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub code: u64,
    pub msg: Value,
    pub peer: PeerIdentity,
}

impl Trigger {
    pub fn new<T: Serialize>(code: u64, msg: &T, peer: PeerIdentity) -> Result<Self, ExchangeError> {
        Ok(Self {
            code,
            msg: to_value(msg)?,
            peer,
        })
    }
}

/// One step of a script.
///
/// Entries within a step are unordered with respect to each other. Triggers
/// are sent before the expects are awaited.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Exchange {
    pub triggers: Vec<Trigger>,
    pub expects: Vec<Expect>,
}

impl Exchange {
    pub fn expect(expects: Vec<Expect>) -> Self {
        Self {
            triggers: Vec::new(),
            expects,
        }
    }

    pub fn trigger(triggers: Vec<Trigger>) -> Self {
        Self {
            triggers,
            expects: Vec::new(),
        }
    }
}

/// A disconnect the harness must observe, with its exact reason text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedDisconnect {
    pub peer: PeerIdentity,
    pub error: String,
}

impl ExpectedDisconnect {
    pub fn new(peer: PeerIdentity, error: impl Into<String>) -> Self {
        Self {
            peer,
            error: error.into(),
        }
    }
}

/// The two-step handshake script: the protocol under test sends `local`
/// to `peer`, then `peer` answers with `remote`.
pub fn handshake_exchange(
    local: &HandshakeMessage,
    remote: &HandshakeMessage,
    peer: PeerIdentity,
) -> Result<Vec<Exchange>, ExchangeError> {
    Ok(vec![
        Exchange::expect(vec![Expect::new(HANDSHAKE_CODE, local, peer)?]),
        Exchange::trigger(vec![Trigger::new(HANDSHAKE_CODE, remote, peer)?]),
    ])
}

fn to_value<T: Serialize>(msg: &T) -> Result<Value, ExchangeError> {
    serde_json::to_value(msg).map_err(|e| ExchangeError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::OverlayAddress;

    #[test]
    fn test_handshake_exchange_shape() {
        let peer = PeerIdentity::derive(b"sim-peer-0");
        let local = HandshakeMessage::standard(OverlayAddress::random());
        let remote = HandshakeMessage::standard(OverlayAddress::from_identity(&peer));

        let script = handshake_exchange(&local, &remote, peer).unwrap();
        assert_eq!(script.len(), 2);
        assert_eq!(script[0].expects.len(), 1);
        assert!(script[0].triggers.is_empty());
        assert_eq!(script[0].expects[0].msg["network_id"], 322);
        assert_eq!(script[1].triggers[0].peer, peer);
        assert_eq!(script[1].triggers[0].code, HANDSHAKE_CODE);
    }

    #[test]
    fn test_error_names_step() {
        let err = ExchangeError::Timeout {
            step: 3,
            peer: PeerIdentity::derive(b"x"),
            code: 0,
            timeout: Duration::from_secs(2),
        };
        assert!(err.to_string().starts_with("exchange 3: timed out after 2s"));
    }
}
