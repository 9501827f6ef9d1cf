//! TCP server and connection handling
//!
//! Accepts incoming peer connections and bridges TCP streams onto the frame
//! pipes the session runtime works with.

use crate::network::message::Frame;
use crate::network::peer::PeerError;
use crate::network::session::Connection;
use bytes::{Buf, BufMut, BytesMut};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, Framed};

/// Magic bytes for message framing
pub const MAGIC: [u8; 4] = [0x4F, 0x56, 0x4C, 0x59]; // "OVLY"

/// Largest payload accepted from the wire
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Magic (4) + code (8) + length (4)
const HEADER_LEN: usize = 16;

/// Frames buffered per direction of a TCP connection
const CHANNEL_CAPACITY: usize = 100;

/// Frame codec for length-prefixed framing
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Frame too large",
            ));
        }

        dst.reserve(HEADER_LEN + item.payload.len());
        dst.put_slice(&MAGIC);
        dst.put_u64(item.code);
        dst.put_u32(item.payload.len() as u32);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least header
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        if src[..4] != MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Invalid magic bytes",
            ));
        }

        let mut header = &src[4..HEADER_LEN];
        let code = header.get_u64();
        let len = header.get_u32() as usize;

        if len > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Frame too large",
            ));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();

        Ok(Some(Frame { code, payload }))
    }
}

/// TCP server for accepting peer connections
pub struct Server {
    listener: TcpListener,
    port: u16,
}

impl Server {
    /// Bind to a port and create the server
    pub async fn bind(port: u16) -> Result<Self, std::io::Error> {
        let addr = format!("0.0.0.0:{}", port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        log::info!("Server listening on 0.0.0.0:{}", port);

        Ok(Self { listener, port })
    }

    /// Get the listening port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept incoming connections
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), std::io::Error> {
        self.listener.accept().await
    }
}

/// Connect to a peer
pub async fn connect_to_peer(addr: &str) -> Result<(TcpStream, SocketAddr), PeerError> {
    let stream = TcpStream::connect(addr).await?;
    let peer_addr = stream.peer_addr()?;
    Ok((stream, peer_addr))
}

/// Bridge a TCP stream onto a frame pipe.
///
/// A reader and a writer task pump frames between the socket and the
/// returned connection. Read failures are delivered as the pipe's final
/// item so the session sees the transport's own error text.
pub fn attach(stream: TcpStream, addr: SocketAddr) -> Connection {
    let (mut writer, mut reader) = Framed::new(stream, FrameCodec).split();
    let (out_tx, mut out_rx) = mpsc::channel::<Result<Frame, PeerError>>(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        while let Some(Ok(frame)) = out_rx.recv().await {
            if let Err(e) = writer.send(frame).await {
                log::warn!("Error writing to {}: {}", addr, e);
                break;
            }
        }
        // Shut down our half so the remote sees the pipe close
        let _ = writer.close().await;
    });

    tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                _ = in_tx.closed() => break,
                item = reader.next() => item,
            };
            match item {
                Some(Ok(frame)) => {
                    if in_tx.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    log::warn!("Error reading from {}: {}", addr, e);
                    let _ = in_tx.send(Err(PeerError::from(e))).await;
                    break;
                }
                None => {
                    log::info!("Peer {} closed the connection", addr);
                    break;
                }
            }
        }
    });

    Connection::from_parts(out_tx, in_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_codec() {
        let mut codec = FrameCodec;
        let frame = Frame::new(7, b"{\"nonce\":12345}".to_vec());

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN + frame.payload.len());

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(Frame::new(1, b"abcdef".to_vec()), &mut buf).unwrap();

        let mut partial = buf.split_to(HEADER_LEN + 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_invalid_magic() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&[0u8; HEADER_LEN][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_attach_over_tcp() {
        let server = Server::bind(0).await.unwrap();
        let port = server.port();

        let dial = tokio::spawn(async move {
            connect_to_peer(&format!("127.0.0.1:{}", port)).await.unwrap()
        });
        let (inbound, inbound_addr) = server.accept().await.unwrap();
        let (outbound, outbound_addr) = dial.await.unwrap();

        let a = attach(inbound, inbound_addr);
        let mut b = attach(outbound, outbound_addr);

        a.send(Frame::new(0, b"{}".to_vec())).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Frame::new(0, b"{}".to_vec()));

        drop(a);
        assert!(b.recv().await.is_err());
    }
}
