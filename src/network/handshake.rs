//! Handshake protocol
//!
//! Both sides send exactly one [`HandshakeMessage`] before any other traffic.
//! The remote one is accepted only if it speaks our protocol version on our
//! network; the version check takes precedence.

use crate::network::codemap::CodeMap;
use crate::network::message::{HandshakeMessage, HANDSHAKE_CODE};
use crate::network::peer::PeerError;
use crate::network::session::{recv_frame, send_frame, Connection};
use std::time::Duration;
use tokio::time::timeout;

/// Check an incoming handshake against our own
pub fn validate(local: &HandshakeMessage, incoming: &HandshakeMessage) -> Result<(), PeerError> {
    if incoming.version != local.version {
        return Err(PeerError::VersionMismatch {
            incoming: incoming.version,
            local: local.version,
        });
    }
    if incoming.network_id != local.network_id {
        return Err(PeerError::NetworkIdMismatch {
            incoming: incoming.network_id,
            local: local.network_id,
        });
    }
    Ok(())
}

/// Exchange handshakes over a fresh connection.
///
/// Sending ours and receiving theirs happen concurrently; both must complete
/// before the remote handshake is validated. Returns the accepted remote
/// handshake.
pub async fn perform_handshake(
    conn: &mut Connection,
    codemap: &CodeMap,
    local: &HandshakeMessage,
    recv_timeout: Duration,
) -> Result<HandshakeMessage, PeerError> {
    let ours = codemap.encode(local)?;
    let Connection { tx, rx } = conn;

    let send = send_frame(tx, ours);
    let receive = async {
        match timeout(recv_timeout, recv_frame(rx)).await {
            Ok(delivery) => delivery,
            Err(_) => Err(PeerError::HandshakeTimeout),
        }
    };
    let ((), frame) = tokio::try_join!(send, receive)?;

    if frame.code != HANDSHAKE_CODE {
        return Err(PeerError::UnexpectedMessage(frame.code));
    }
    let remote: HandshakeMessage = codemap.decode(&frame)?;
    log::debug!(
        "Received handshake: version={}, network={}",
        remote.version,
        remote.network_id
    );

    validate(local, &remote)?;
    Ok(remote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::{Frame, OverlayAddress, NETWORK_ID, PROTOCOL_VERSION};
    use crate::network::session::pipe;

    fn handshake(version: u32, network_id: u64) -> HandshakeMessage {
        HandshakeMessage::new(version, network_id, OverlayAddress::random())
    }

    #[test]
    fn test_validate_accepts_matching() {
        let local = handshake(0, 322);
        assert!(validate(&local, &handshake(0, 322)).is_ok());
    }

    #[test]
    fn test_validate_version_first() {
        let local = handshake(0, 322);
        let err = validate(&local, &handshake(1, 321)).unwrap_err();
        assert_eq!(err.to_string(), "version mismatch 1 (!= 0)");
    }

    #[test]
    fn test_validate_network_id() {
        let local = handshake(PROTOCOL_VERSION, NETWORK_ID);
        let err = validate(&local, &handshake(PROTOCOL_VERSION, 321)).unwrap_err();
        assert_eq!(err.to_string(), "network id mismatch 321 (!= 322)");
    }

    #[tokio::test]
    async fn test_perform_handshake_both_sides() {
        let codemap = CodeMap::standard();
        let (mut a, mut b) = pipe();
        let ours = handshake(0, 322);
        let theirs = handshake(0, 322);

        let (left, right) = tokio::join!(
            perform_handshake(&mut a, &codemap, &ours, Duration::from_secs(1)),
            perform_handshake(&mut b, &codemap, &theirs, Duration::from_secs(1)),
        );
        assert_eq!(left.unwrap().addr, theirs.addr);
        assert_eq!(right.unwrap().addr, ours.addr);
    }

    #[tokio::test]
    async fn test_perform_handshake_rejects_other_code() {
        let codemap = CodeMap::standard();
        let (mut a, b) = pipe();
        b.send(Frame::new(3, b"{}".to_vec())).await.unwrap();

        let result =
            perform_handshake(&mut a, &codemap, &handshake(0, 322), Duration::from_secs(1)).await;
        assert_eq!(result, Err(PeerError::UnexpectedMessage(3)));
    }

    #[tokio::test]
    async fn test_perform_handshake_closed_pipe() {
        let codemap = CodeMap::standard();
        let (mut a, b) = pipe();
        drop(b);

        let result =
            perform_handshake(&mut a, &codemap, &handshake(0, 322), Duration::from_secs(1)).await;
        assert_eq!(result, Err(PeerError::ClosedPipe));
    }
}
