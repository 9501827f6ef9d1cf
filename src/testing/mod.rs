//! Exchange test harness
//!
//! Drives a [`Protocol`](crate::network::Protocol) through scripted message
//! exchanges with simulated peers and asserts connection outcomes, including
//! the exact disconnect reasons.
//!
//! # Example
//!
//! ```rust
//! use overlay_admission::network::{CodeMap, HandshakeMessage, OverlayAddress, Protocol};
//! use overlay_admission::testing::{handshake_exchange, ExchangeSession, ExpectedDisconnect};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let local = HandshakeMessage::standard(OverlayAddress::random());
//! let protocol = Protocol::new(local.clone(), Arc::new(CodeMap::standard()))?;
//! let mut session = ExchangeSession::new(protocol, 1);
//! let id = session.ids()[0];
//!
//! let mut remote = HandshakeMessage::standard(OverlayAddress::from_identity(&id));
//! remote.network_id = 321;
//!
//! session.connect(&[id])?;
//! session.run_exchanges(&handshake_exchange(&local, &remote, id)?).await?;
//! session
//!     .expect_disconnects(&[ExpectedDisconnect::new(id, "network id mismatch 321 (!= 322)")])
//!     .await?;
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod exchange;
pub mod tester;

pub use exchange::{
    handshake_exchange, Exchange, ExchangeError, Expect, ExpectedDisconnect, Trigger,
};
pub use tester::{ExchangeSession, EXCHANGE_TIMEOUT};
