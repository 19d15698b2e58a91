//! The codec / transport boundary (spec §1, §6): `bgp_rx`, `bgp_tx`, and the
//! message constructors are opaque collaborators as far as this crate's
//! FSM is concerned. Message encoding, decoding, and attribute translation
//! live in the `bgp-rs` crate (itself the external "packet codec module");
//! this module only frames `bgp-rs` messages on a byte stream, exactly as
//! the teacher's `session/codec.rs` did, and exposes the result behind a
//! [`BgpTransport`] trait so the FSM can be driven against a fake in tests.

use std::io::{Error, ErrorKind, Read};
use std::net::IpAddr;

use async_trait::async_trait;
use bgp_rs::{Capabilities, Message, Reader};
use byteorder::{NetworkEndian, ReadBytesExt};
use bytes::{Buf, BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, Framed};
use twoway::find_bytes;

/// What a [`crate::connection::Connection`] needs from the wire. Production
/// code gets a [`WireTransport`]; tests get a [`MockTransport`].
#[async_trait]
pub trait BgpTransport: Send {
    async fn send(&mut self, message: Message) -> Result<(), Error>;

    /// `Ok(None)` means the stream ended cleanly (remote closed).
    async fn recv(&mut self) -> Result<Option<Message>, Error>;

    fn peer_addr(&self) -> IpAddr;
}

#[derive(Debug, Default)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn new() -> Self {
        Self
    }

    fn get_reader<T: Read>(&self, stream: T) -> Reader<T, Capabilities> {
        Reader::<T, Capabilities>::new(stream)
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Error> {
        if let Ok(range) = find_msg_range(buf) {
            let mut reader = self.get_reader(&buf[range.start..range.stop]);
            let (_header, message) = reader.read()?;
            buf.advance(range.stop);
            Ok(Some(message))
        } else {
            Ok(None)
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, message: Message, buf: &mut BytesMut) -> Result<(), Error> {
        message.encode(&mut buf.writer())
    }
}

#[derive(Debug)]
struct MsgRange {
    start: usize,
    stop: usize,
}

/// Given a stream of bytes, find the start and end of a BGP message by its
/// 16-byte all-ones marker and the two-byte length that follows it.
fn find_msg_range(data: &[u8]) -> Result<MsgRange, String> {
    if let Some(start) = find_bytes(data, &[255; 16]) {
        let buf = &mut (*data).split_at(start).1;
        let mut _marker: [u8; 16] = [0; 16];
        let _ = buf.read_exact(&mut _marker);
        let length = buf
            .read_u16::<NetworkEndian>()
            .map_err(|e| e.to_string())?;
        Ok(MsgRange {
            start,
            stop: start + (length as usize),
        })
    } else {
        Err("no BGP message marker found".to_string())
    }
}

/// Production transport: a BGP message stream framed over a live TCP socket.
pub struct WireTransport {
    framed: Framed<TcpStream, MessageCodec>,
    peer_addr: IpAddr,
}

impl WireTransport {
    pub fn new(stream: TcpStream) -> Result<Self, Error> {
        let peer_addr = stream.peer_addr()?.ip();
        Ok(Self {
            framed: Framed::new(stream, MessageCodec::new()),
            peer_addr,
        })
    }
}

#[async_trait]
impl BgpTransport for WireTransport {
    async fn send(&mut self, message: Message) -> Result<(), Error> {
        self.framed.send(message).await
    }

    async fn recv(&mut self) -> Result<Option<Message>, Error> {
        match self.framed.next().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    fn peer_addr(&self) -> IpAddr {
        self.peer_addr
    }
}

/// Channel-backed transport for driving the FSM in tests without a real
/// socket: `inbound` feeds messages as if received from the peer, `outbound`
/// captures what the engine sends.
pub struct MockTransport {
    peer_addr: IpAddr,
    inbound: mpsc::UnboundedReceiver<Message>,
    outbound: mpsc::UnboundedSender<Message>,
}

impl MockTransport {
    /// Builds a connected pair: `(engine side, test-harness handle)`.
    #[allow(clippy::type_complexity)]
    pub fn pair(
        peer_addr: IpAddr,
    ) -> (
        Self,
        mpsc::UnboundedSender<Message>,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                peer_addr,
                inbound: inbound_rx,
                outbound: outbound_tx,
            },
            inbound_tx,
            outbound_rx,
        )
    }
}

#[async_trait]
impl BgpTransport for MockTransport {
    async fn send(&mut self, message: Message) -> Result<(), Error> {
        self.outbound
            .send(message)
            .map_err(|_| Error::new(ErrorKind::BrokenPipe, "test harness dropped the receiver"))
    }

    async fn recv(&mut self) -> Result<Option<Message>, Error> {
        Ok(self.inbound.recv().await)
    }

    fn peer_addr(&self) -> IpAddr {
        self.peer_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_msg_range_locates_marker_and_length() {
        let mut data = vec![255u8; 16];
        data.extend_from_slice(&45u16.to_be_bytes());
        data.extend(std::iter::repeat(0u8).take(64));
        let range = find_msg_range(&data).unwrap();
        assert_eq!(range.start, 0);
        assert_eq!(range.stop, 45);
    }

    #[test]
    fn find_msg_range_errs_without_marker() {
        let data = vec![0u8; 32];
        assert!(find_msg_range(&data).is_err());
    }

    #[tokio::test]
    async fn mock_transport_round_trips_messages() {
        let addr: IpAddr = "10.0.0.2".parse().unwrap();
        let (mut transport, harness_tx, mut harness_rx) = MockTransport::pair(addr);

        harness_tx.send(Message::KeepAlive).unwrap();
        let received = transport.recv().await.unwrap();
        assert!(matches!(received, Some(Message::KeepAlive)));

        transport.send(Message::KeepAlive).await.unwrap();
        assert!(matches!(harness_rx.recv().await, Some(Message::KeepAlive)));

        assert_eq!(transport.peer_addr(), addr);
    }
}
