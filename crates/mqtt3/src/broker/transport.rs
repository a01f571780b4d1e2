//! Byte-stream transport used by a client connection
//!
//! Wraps any `AsyncRead + AsyncWrite` stream (plain TCP, or a stream handed
//! over by an external TLS acceptor) with the frame decoder.

use crate::protocol::{decode_packet, encode_packet, Decoded, Packet};
use crate::{MqttError, Result};
use bytes::BytesMut;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub struct BrokerTransport {
    stream: Box<dyn AsyncStream>,
    read_buffer: BytesMut,
    write_buffer: BytesMut,
    max_packet_size: usize,
}

impl fmt::Debug for BrokerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerTransport")
            .field("buffered", &self.read_buffer.len())
            .field("max_packet_size", &self.max_packet_size)
            .finish_non_exhaustive()
    }
}

impl BrokerTransport {
    pub fn new(stream: impl AsyncStream + 'static, max_packet_size: usize) -> Self {
        Self {
            stream: Box::new(stream),
            read_buffer: BytesMut::with_capacity(4096),
            write_buffer: BytesMut::with_capacity(4096),
            max_packet_size,
        }
    }

    /// Reads the next complete packet.
    ///
    /// Cancel-safe: bytes already read stay buffered for the next call.
    ///
    /// # Errors
    /// `ConnectionClosedByPeer` on EOF; decode errors are fatal and discard
    /// whatever was buffered.
    pub async fn read_packet(&mut self) -> Result<Packet> {
        loop {
            match decode_packet(&self.read_buffer, self.max_packet_size) {
                Ok(Decoded::Complete { packet, consumed }) => {
                    let _ = self.read_buffer.split_to(consumed);
                    trace!("Read {:?} ({} bytes)", packet.packet_type(), consumed);
                    return Ok(packet);
                }
                Ok(Decoded::NeedMoreData) => {}
                Err(e) => {
                    self.read_buffer.clear();
                    return Err(e);
                }
            }

            let read = self.stream.read_buf(&mut self.read_buffer).await?;
            if read == 0 {
                if !self.read_buffer.is_empty() {
                    trace!(
                        "Discarding {} bytes of a partial frame on close",
                        self.read_buffer.len()
                    );
                    self.read_buffer.clear();
                }
                return Err(MqttError::ConnectionClosedByPeer);
            }
        }
    }

    /// # Errors
    /// Returns an error if encoding or the write fails.
    pub async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        self.write_buffer.clear();
        encode_packet(packet, &mut self.write_buffer)?;
        trace!(
            "Writing {:?} ({} bytes)",
            packet.packet_type(),
            self.write_buffer.len()
        );
        self.stream.write_all(&self.write_buffer).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Closes the write half; errors are ignored since the peer may be gone.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PublishPacket, PubAckPacket};
    use crate::QoS;
    use tokio::io::duplex;

    fn encoded(packet: &Packet) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_packet(packet, &mut buf).unwrap();
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_reads_frames_split_across_writes() {
        let (client, server) = duplex(1024);
        let mut transport = BrokerTransport::new(server, 1024 * 1024);
        let mut client = client;

        let publish = Packet::Publish(
            PublishPacket::new("a/b", &b"hello"[..], QoS::AtLeastOnce).with_packet_id(7),
        );
        let mut bytes = encoded(&publish);
        bytes.extend(encoded(&Packet::PingReq));

        let (first, rest) = bytes.split_at(3);
        client.write_all(first).await.unwrap();
        let reader = tokio::spawn(async move {
            let a = transport.read_packet().await.unwrap();
            let b = transport.read_packet().await.unwrap();
            (a, b)
        });
        tokio::task::yield_now().await;
        client.write_all(rest).await.unwrap();

        let (a, b) = reader.await.unwrap();
        assert_eq!(a, publish);
        assert_eq!(b, Packet::PingReq);
    }

    #[tokio::test]
    async fn test_eof_is_peer_close() {
        let (client, server) = duplex(64);
        let mut transport = BrokerTransport::new(server, 1024);
        drop(client);
        let err = transport.read_packet().await.unwrap_err();
        assert!(matches!(err, MqttError::ConnectionClosedByPeer));
    }

    #[tokio::test]
    async fn test_malformed_frame_discards_buffer() {
        let (mut client, server) = duplex(64);
        let mut transport = BrokerTransport::new(server, 1024);
        // Reserved packet type 0.
        client.write_all(&[0x00, 0x00, 0xC0, 0x00]).await.unwrap();

        assert!(transport.read_packet().await.is_err());
        assert!(transport.read_buffer.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, server) = duplex(64);
        let mut transport = BrokerTransport::new(server, 16);
        // PUBLISH declaring 100 bytes of body.
        client.write_all(&[0x30, 100]).await.unwrap();

        let err = transport.read_packet().await.unwrap_err();
        assert!(matches!(err, MqttError::PacketTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_write_packet() {
        let (client, server) = duplex(64);
        let mut transport = BrokerTransport::new(server, 1024);
        let mut peer = BrokerTransport::new(client, 1024);

        let ack = Packet::PubAck(PubAckPacket::new(9));
        transport.write_packet(&ack).await.unwrap();
        assert_eq!(peer.read_packet().await.unwrap(), ack);
    }
}
