//! Message code registry
//!
//! Maps message types to stable wire codes and back. A map is built once,
//! then shared read-only (usually behind an `Arc`) by every session.

use crate::network::message::{Frame, HandshakeMessage, ProtocolMessage, HANDSHAKE_CODE};
use std::any::TypeId;
use std::collections::HashMap;
use thiserror::Error;

/// Code map errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodeMapError {
    #[error("unregistered type {0}")]
    UnregisteredType(&'static str),
    #[error("unregistered code {0}")]
    UnregisteredCode(u64),
    #[error("code {code} carries {actual}, not {expected}")]
    UnexpectedCode {
        code: u64,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("code {code} is reserved for {expected}, found {found}")]
    ReservedCode {
        code: u64,
        expected: &'static str,
        found: &'static str,
    },
    #[error("invalid payload: {0}")]
    Payload(String),
}

/// A registered message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageType {
    pub name: &'static str,
    type_id: TypeId,
}

impl MessageType {
    fn of<T: ProtocolMessage>() -> Self {
        Self {
            name: T::NAME,
            type_id: TypeId::of::<T>(),
        }
    }

    /// Whether this entry describes `T`
    pub fn is<T: ProtocolMessage>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

/// Bidirectional registry between message types and wire codes
#[derive(Debug, Clone, Default)]
pub struct CodeMap {
    codes: HashMap<TypeId, u64>,
    types: Vec<MessageType>,
}

impl CodeMap {
    /// Create an empty code map
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard map with the handshake at code 0
    pub fn standard() -> Self {
        Self::new().with::<HandshakeMessage>()
    }

    /// Register `T` and return the map, for chained construction
    pub fn with<T: ProtocolMessage>(mut self) -> Self {
        self.register::<T>();
        self
    }

    /// Register a message type and return its code.
    ///
    /// Codes are handed out sequentially from 0. Registering a type twice
    /// returns the code it already has.
    pub fn register<T: ProtocolMessage>(&mut self) -> u64 {
        let entry = MessageType::of::<T>();
        if let Some(code) = self.codes.get(&entry.type_id) {
            return *code;
        }

        let code = self.types.len() as u64;
        self.codes.insert(entry.type_id, code);
        self.types.push(entry);
        code
    }

    /// Code assigned to `T`
    pub fn code_of<T: ProtocolMessage>(&self) -> Result<u64, CodeMapError> {
        self.codes
            .get(&TypeId::of::<T>())
            .copied()
            .ok_or(CodeMapError::UnregisteredType(T::NAME))
    }

    /// Message type registered under `code`
    pub fn type_of(&self, code: u64) -> Result<MessageType, CodeMapError> {
        usize::try_from(code)
            .ok()
            .and_then(|idx| self.types.get(idx))
            .copied()
            .ok_or(CodeMapError::UnregisteredCode(code))
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Check that the handshake owns its reserved code
    pub fn ensure_handshake_reserved(&self) -> Result<(), CodeMapError> {
        let entry = self.type_of(HANDSHAKE_CODE).map_err(|_| {
            CodeMapError::UnregisteredType(<HandshakeMessage as ProtocolMessage>::NAME)
        })?;
        if entry.is::<HandshakeMessage>() {
            Ok(())
        } else {
            Err(CodeMapError::ReservedCode {
                code: HANDSHAKE_CODE,
                expected: <HandshakeMessage as ProtocolMessage>::NAME,
                found: entry.name,
            })
        }
    }

    /// Encode a message into a frame
    pub fn encode<T: ProtocolMessage>(&self, msg: &T) -> Result<Frame, CodeMapError> {
        let code = self.code_of::<T>()?;
        let payload =
            serde_json::to_vec(msg).map_err(|e| CodeMapError::Payload(e.to_string()))?;
        Ok(Frame::new(code, payload))
    }

    /// Decode a frame that must carry a `T`
    pub fn decode<T: ProtocolMessage>(&self, frame: &Frame) -> Result<T, CodeMapError> {
        let entry = self.type_of(frame.code)?;
        if !entry.is::<T>() {
            return Err(CodeMapError::UnexpectedCode {
                code: frame.code,
                expected: T::NAME,
                actual: entry.name,
            });
        }
        serde_json::from_slice(&frame.payload).map_err(|e| CodeMapError::Payload(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::OverlayAddress;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping(u64);

    impl ProtocolMessage for Ping {
        const NAME: &'static str = "Ping";
    }

    #[test]
    fn test_standard_map() {
        let map = CodeMap::standard();
        assert_eq!(map.code_of::<HandshakeMessage>(), Ok(0));
        assert!(map.type_of(0).unwrap().is::<HandshakeMessage>());
        assert!(map.ensure_handshake_reserved().is_ok());
    }

    #[test]
    fn test_register_is_stable() {
        let mut map = CodeMap::standard();
        let code = map.register::<Ping>();
        assert_eq!(code, 1);
        assert_eq!(map.register::<Ping>(), 1);
        assert_eq!(map.len(), 2);
        assert_eq!(map.type_of(1).unwrap().name, "Ping");
    }

    #[test]
    fn test_unregistered_lookups() {
        let map = CodeMap::standard();
        let err = map.code_of::<Ping>().unwrap_err();
        assert_eq!(err, CodeMapError::UnregisteredType("Ping"));
        assert_eq!(err.to_string(), "unregistered type Ping");
        assert_eq!(
            map.type_of(9).unwrap_err().to_string(),
            "unregistered code 9"
        );
    }

    #[test]
    fn test_reserved_code_violation() {
        let map = CodeMap::new().with::<Ping>().with::<HandshakeMessage>();
        assert_eq!(
            map.ensure_handshake_reserved().unwrap_err().to_string(),
            "code 0 is reserved for HandshakeMessage, found Ping"
        );
        assert!(CodeMap::new().ensure_handshake_reserved().is_err());
    }

    #[test]
    fn test_encode_decode() {
        let map = CodeMap::standard().with::<Ping>();
        let handshake = HandshakeMessage::standard(OverlayAddress::random());

        let frame = map.encode(&handshake).unwrap();
        assert_eq!(frame.code, 0);
        assert_eq!(map.decode::<HandshakeMessage>(&frame).unwrap(), handshake);

        let err = map.decode::<Ping>(&frame).unwrap_err();
        assert!(matches!(err, CodeMapError::UnexpectedCode { code: 0, .. }));
    }

    #[test]
    fn test_decode_malformed_payload() {
        let map = CodeMap::standard();
        let frame = Frame::new(0, b"not json".to_vec());
        assert!(matches!(
            map.decode::<HandshakeMessage>(&frame),
            Err(CodeMapError::Payload(_))
        ));
    }
}
