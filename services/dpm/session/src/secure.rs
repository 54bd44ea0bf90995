//! Handshake seam and record transports.
//!
//! A [`HandshakeEngine`] drives a [`SecureContext`] from fresh to established over a
//! [`RecordTransport`]. Sessions pick the engine through the secure-setup callback;
//! [`PskEngine`] is the built-in one.

use async_trait::async_trait;
use dpm_secure::record::{DTLS_HEADER_LEN, MAX_RECORD_BODY_LEN, TLS_HEADER_LEN};
use dpm_secure::{Endpoint, PskHandshake, SecureContext, SecureError};
use rand::rngs::OsRng;
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::debug;

/// Moves whole records between the handshake and the socket
#[async_trait]
pub trait RecordTransport: Send {
    /// Send one framed record
    async fn send_record(&mut self, record: &[u8]) -> Result<(), SecureError>;
    /// Receive one framed record
    async fn recv_record(&mut self) -> Result<Vec<u8>, SecureError>;
}

/// Runs a handshake and installs the negotiated state into the context
#[async_trait]
pub trait HandshakeEngine: Send + Sync {
    /// Drive `ctx` to the established state
    async fn handshake(
        &self,
        ctx: &mut SecureContext,
        io: &mut dyn RecordTransport,
    ) -> Result<(), SecureError>;
}

/// Addressing and timing of a secure connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecureInfo {
    /// Local address
    pub local: String,
    /// Peer address
    pub peer: String,
    /// Sub-session index for servers
    pub sub_index: Option<usize>,
    /// Per-read timeout in milliseconds
    pub timeout_ms: u64,
    /// Retention blob holding the snapshot
    pub snapshot: String,
}

fn timed_out(what: &str) -> SecureError {
    SecureError::Io(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{} timed out", what),
    ))
}

/// TLS records over a byte stream
pub struct StreamTransport<'a, S> {
    stream: &'a mut S,
    timeout: Duration,
}

impl<'a, S> StreamTransport<'a, S> {
    /// Wrap `stream`; every read is bounded by `timeout`
    pub fn new(stream: &'a mut S, timeout: Duration) -> Self {
        Self { stream, timeout }
    }
}

#[async_trait]
impl<S> RecordTransport for StreamTransport<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_record(&mut self, record: &[u8]) -> Result<(), SecureError> {
        self.stream.write_all(record).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn recv_record(&mut self) -> Result<Vec<u8>, SecureError> {
        let read = async {
            let mut record = vec![0u8; TLS_HEADER_LEN];
            self.stream.read_exact(&mut record).await?;
            let len = u16::from_be_bytes([record[3], record[4]]) as usize;
            if len > MAX_RECORD_BODY_LEN {
                return Err(SecureError::BadInputData("record too long"));
            }
            record.resize(TLS_HEADER_LEN + len, 0);
            self.stream.read_exact(&mut record[TLS_HEADER_LEN..]).await?;
            Ok(record)
        };
        tokio::time::timeout(self.timeout, read)
            .await
            .map_err(|_| timed_out("record read"))?
    }
}

/// DTLS records over a connected UDP socket, one record per datagram
pub struct DatagramTransport<'a> {
    socket: &'a UdpSocket,
    timeout: Duration,
}

impl<'a> DatagramTransport<'a> {
    /// Wrap a connected socket
    pub fn new(socket: &'a UdpSocket, timeout: Duration) -> Self {
        Self { socket, timeout }
    }
}

#[async_trait]
impl RecordTransport for DatagramTransport<'_> {
    async fn send_record(&mut self, record: &[u8]) -> Result<(), SecureError> {
        self.socket.send(record).await?;
        Ok(())
    }

    async fn recv_record(&mut self) -> Result<Vec<u8>, SecureError> {
        let mut buf = vec![0u8; DTLS_HEADER_LEN + MAX_RECORD_BODY_LEN];
        let n = tokio::time::timeout(self.timeout, self.socket.recv(&mut buf))
            .await
            .map_err(|_| timed_out("datagram read"))??;
        buf.truncate(n);
        Ok(buf)
    }
}

/// DTLS records of one peer of a shared server socket.
///
/// Inbound datagrams arrive through `inbox` from the task that owns the socket.
pub struct ChannelTransport<'a> {
    socket: &'a UdpSocket,
    peer: SocketAddr,
    inbox: &'a mut mpsc::Receiver<Vec<u8>>,
    timeout: Duration,
}

impl<'a> ChannelTransport<'a> {
    /// Records to and from `peer`
    pub fn new(
        socket: &'a UdpSocket,
        peer: SocketAddr,
        inbox: &'a mut mpsc::Receiver<Vec<u8>>,
        timeout: Duration,
    ) -> Self {
        Self {
            socket,
            peer,
            inbox,
            timeout,
        }
    }
}

#[async_trait]
impl RecordTransport for ChannelTransport<'_> {
    async fn send_record(&mut self, record: &[u8]) -> Result<(), SecureError> {
        self.socket.send_to(record, self.peer).await?;
        Ok(())
    }

    async fn recv_record(&mut self) -> Result<Vec<u8>, SecureError> {
        match tokio::time::timeout(self.timeout, self.inbox.recv()).await {
            Ok(Some(datagram)) => Ok(datagram),
            Ok(None) => Err(SecureError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "server socket closed",
            ))),
            Err(_) => Err(timed_out("peer datagram")),
        }
    }
}

/// Handshake engine for peers sharing a pre-shared key
#[derive(Debug, Clone)]
pub struct PskEngine {
    psk: PskHandshake,
}

impl PskEngine {
    /// Engine running `psk`
    pub fn new(psk: PskHandshake) -> Self {
        Self { psk }
    }
}

#[async_trait]
impl HandshakeEngine for PskEngine {
    async fn handshake(
        &self,
        ctx: &mut SecureContext,
        io: &mut dyn RecordTransport,
    ) -> Result<(), SecureError> {
        match ctx.config().endpoint {
            Endpoint::Client => {
                let hello = self.psk.client_hello(ctx, &mut OsRng)?;
                io.send_record(&hello).await?;
                let reply = io.recv_record().await?;
                let finished = self.psk.client_finish(ctx, &reply, &mut OsRng)?;
                io.send_record(&finished).await?;
                let server_finished = io.recv_record().await?;
                self.psk.client_verify(ctx, &server_finished)?;
            }
            Endpoint::Server => {
                let hello = io.recv_record().await?;
                let reply = self.psk.server_respond(ctx, &hello, &mut OsRng)?;
                io.send_record(&reply).await?;
                let finished = io.recv_record().await?;
                let server_finished = self.psk.server_finish(ctx, &finished, &mut OsRng)?;
                io.send_record(&server_finished).await?;
            }
        }
        debug!("PSK handshake done as {:?}", ctx.config().endpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpm_secure::{ContentType, SecureConfig, Transport};

    fn engine() -> PskEngine {
        PskEngine::new(PskHandshake::new("node-7", b"shared secret", 0xCCAB).unwrap())
    }

    fn context(endpoint: Endpoint, transport: Transport) -> SecureContext {
        SecureContext::new(SecureConfig {
            endpoint,
            transport,
        })
    }

    #[tokio::test]
    async fn test_psk_over_stream() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let engine = engine();
        let mut client = context(Endpoint::Client, Transport::Stream);
        let mut server = context(Endpoint::Server, Transport::Stream);

        let mut client_io = StreamTransport::new(&mut a, Duration::from_secs(2));
        let mut server_io = StreamTransport::new(&mut b, Duration::from_secs(2));
        let (c, s) = tokio::join!(
            engine.handshake(&mut client, &mut client_io),
            engine.handshake(&mut server, &mut server_io)
        );
        c.unwrap();
        s.unwrap();

        let wire = client
            .write_record(ContentType::ApplicationData, b"hello", &mut OsRng)
            .unwrap();
        assert_eq!(server.read_record(&wire).unwrap().payload, b"hello");
    }

    #[tokio::test]
    async fn test_psk_over_udp() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(b.local_addr().unwrap()).await.unwrap();
        b.connect(a.local_addr().unwrap()).await.unwrap();

        let engine = engine();
        let mut client = context(Endpoint::Client, Transport::Datagram);
        let mut server = context(Endpoint::Server, Transport::Datagram);
        let mut client_io = DatagramTransport::new(&a, Duration::from_secs(2));
        let mut server_io = DatagramTransport::new(&b, Duration::from_secs(2));
        let (c, s) = tokio::join!(
            engine.handshake(&mut client, &mut client_io),
            engine.handshake(&mut server, &mut server_io)
        );
        c.unwrap();
        s.unwrap();
        assert!(client.is_established());
        assert_eq!(server.out_counter(), (1u64 << 48) + 1);
    }

    #[tokio::test]
    async fn test_channel_transport() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let mut io = ChannelTransport::new(
            &socket,
            peer.local_addr().unwrap(),
            &mut rx,
            Duration::from_millis(100),
        );

        tx.send(b"datagram".to_vec()).await.unwrap();
        assert_eq!(io.recv_record().await.unwrap(), b"datagram");
        assert!(matches!(io.recv_record().await, Err(SecureError::Io(_))));

        io.send_record(b"out").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"out");
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (_a, mut b) = tokio::io::duplex(64);
        let mut server = context(Endpoint::Server, Transport::Stream);
        let mut io = StreamTransport::new(&mut b, Duration::from_millis(50));
        let err = engine().handshake(&mut server, &mut io).await.unwrap_err();
        assert!(matches!(err, SecureError::Io(e) if e.kind() == io::ErrorKind::TimedOut));
    }
}
