//! Send side and record protection of one live connection.
//!
//! The task that owns a connection keeps its read half; everything else (API sends,
//! keep-alive probes, snapshots) goes through the [`Link`]. Records are protected
//! under the writer lock so their sequence numbers reach the wire in order.

use bytes::BytesMut;
use dpm_secure::{ContentType, SaveOutcome, SecureContext, SecureError, SessionCodec, MAX_PLAINTEXT_LEN};
use rand::rngs::OsRng;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::secure::SecureInfo;
use crate::state::lock;
use crate::DpmError;

enum Writer {
    Tcp(OwnedWriteHalf),
    Udp {
        socket: Arc<UdpSocket>,
        connected: bool,
    },
}

impl Writer {
    async fn write(&mut self, peer: SocketAddr, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Writer::Tcp(half) => half.write_all(bytes).await,
            Writer::Udp {
                socket,
                connected: true,
            } => socket.send(bytes).await.map(|_| ()),
            Writer::Udp {
                socket,
                connected: false,
            } => socket.send_to(bytes, peer).await.map(|_| ()),
        }
    }
}

struct SecureLink {
    ctx: Mutex<SecureContext>,
    info: SecureInfo,
}

/// One live connection to a peer
pub struct Link {
    peer: SocketAddr,
    writer: tokio::sync::Mutex<Writer>,
    secure: Option<SecureLink>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("peer", &self.peer)
            .field("secure", &self.secure.as_ref().map(|s| &s.info))
            .finish()
    }
}

impl Link {
    pub(crate) fn tcp(
        peer: SocketAddr,
        writer: OwnedWriteHalf,
        secure: Option<(SecureContext, SecureInfo)>,
    ) -> Self {
        Self::build(peer, Writer::Tcp(writer), secure)
    }

    /// `connected` sockets send with `send`, shared server sockets with `send_to(peer)`
    pub(crate) fn udp(
        peer: SocketAddr,
        socket: Arc<UdpSocket>,
        connected: bool,
        secure: Option<(SecureContext, SecureInfo)>,
    ) -> Self {
        Self::build(peer, Writer::Udp { socket, connected }, secure)
    }

    fn build(peer: SocketAddr, writer: Writer, secure: Option<(SecureContext, SecureInfo)>) -> Self {
        Self {
            peer,
            writer: tokio::sync::Mutex::new(writer),
            secure: secure.map(|(ctx, info)| SecureLink {
                ctx: Mutex::new(ctx),
                info,
            }),
        }
    }

    /// Peer address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether records are protected
    pub fn is_secure(&self) -> bool {
        self.secure.is_some()
    }

    /// Addressing of the secure session
    pub fn secure_info(&self) -> Option<&SecureInfo> {
        self.secure.as_ref().map(|s| &s.info)
    }

    /// Send application data, split into records when secure
    pub(crate) async fn send(&self, data: &[u8]) -> Result<usize, DpmError> {
        let mut writer = self.writer.lock().await;
        match &self.secure {
            None => writer
                .write(self.peer, data)
                .await
                .map_err(DpmError::SendFail)?,
            Some(secure) => {
                let records = {
                    let mut ctx = lock(&secure.ctx);
                    data.chunks(MAX_PLAINTEXT_LEN)
                        .map(|chunk| {
                            ctx.write_record(ContentType::ApplicationData, chunk, &mut OsRng)
                        })
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(DpmError::SecureWriteFail)?
                };
                for record in records {
                    writer
                        .write(self.peer, &record)
                        .await
                        .map_err(DpmError::SendFail)?;
                }
            }
        }
        debug!("Sent {} bytes to {}", data.len(), self.peer);
        Ok(data.len())
    }

    /// Keep-alive probe: an empty record when secure, an empty datagram or write otherwise
    pub(crate) async fn keepalive(&self) -> Result<(), DpmError> {
        let mut writer = self.writer.lock().await;
        let probe = match &self.secure {
            Some(secure) => lock(&secure.ctx)
                .write_record(ContentType::ApplicationData, &[], &mut OsRng)
                .map_err(DpmError::SecureWriteFail)?,
            None => Vec::new(),
        };
        let sent = match &mut *writer {
            Writer::Tcp(half) if probe.is_empty() => half.flush().await,
            other => other.write(self.peer, &probe).await,
        };
        sent.map_err(DpmError::SendFail)?;
        debug!("Keep-alive sent to {}", self.peer);
        Ok(())
    }

    /// Take every complete record out of `buf` and return the application data.
    ///
    /// Plain links hand back the whole buffer.
    pub(crate) fn open_stream(&self, buf: &mut BytesMut) -> Result<Vec<Vec<u8>>, DpmError> {
        let secure = match &self.secure {
            Some(secure) => secure,
            None => {
                let data = buf.split().to_vec();
                return Ok(vec![data]);
            }
        };

        let mut ctx = lock(&secure.ctx);
        let mut out = Vec::new();
        while let Some(len) = ctx.pending_record_len(&buf[..]) {
            if buf.len() < len {
                break;
            }
            let wire = buf.split_to(len);
            let record = ctx.read_record(&wire).map_err(DpmError::SecureReadFail)?;
            if let Some(data) = self.classify(record.content_type, record.payload)? {
                out.push(data);
            }
        }
        Ok(out)
    }

    /// Application data of one datagram.
    ///
    /// Records failing authentication and empty keep-alive probes yield `None`.
    pub(crate) fn open_datagram(&self, datagram: &[u8]) -> Result<Option<Vec<u8>>, DpmError> {
        let secure = match &self.secure {
            Some(secure) => secure,
            None => return Ok((!datagram.is_empty()).then(|| datagram.to_vec())),
        };

        let record = lock(&secure.ctx).read_record(datagram);
        match record {
            Ok(record) => self.classify(record.content_type, record.payload),
            Err(e) => {
                warn!("Dropping datagram from {}: {}", self.peer, e);
                Ok(None)
            }
        }
    }

    fn classify(
        &self,
        content_type: ContentType,
        payload: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, DpmError> {
        match content_type {
            ContentType::ApplicationData if payload.is_empty() => Ok(None),
            ContentType::ApplicationData => Ok(Some(payload)),
            ContentType::Alert => Err(DpmError::PeerClosed(self.peer)),
            other => {
                debug!("Ignoring {:?} record from {}", other, self.peer);
                Ok(None)
            }
        }
    }

    /// Save the secure snapshot; plain links and disabled snapshots do nothing
    pub(crate) fn save_snapshot(&self, codec: &SessionCodec) -> Result<Option<SaveOutcome>, SecureError> {
        match &self.secure {
            Some(secure) if codec.is_enabled() => {
                let ctx = lock(&secure.ctx);
                codec.save(&secure.info.snapshot, &ctx).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Close the send side
    pub(crate) async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Writer::Tcp(half) = &mut *writer {
            if let Err(e) = half.shutdown().await {
                debug!("Shutdown of link to {}: {}", self.peer, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpm_retention::MemoryRetention;
    use dpm_secure::{Endpoint, ProtocolVersion, SecureConfig, SecureSession, Transport, KEY_BLOCK_LEN};
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    fn established(endpoint: Endpoint, transport: Transport) -> SecureContext {
        let mut ctx = SecureContext::new(SecureConfig {
            endpoint,
            transport,
        });
        let (own, peer) = match endpoint {
            Endpoint::Client => ([1; 12], [2; 12]),
            Endpoint::Server => ([2; 12], [1; 12]),
        };
        ctx.establish(
            ProtocolVersion::TLS1_2,
            SecureSession::new(0xCCA8, [9; 48]),
            &[0x42; KEY_BLOCK_LEN],
            own,
            peer,
        )
        .unwrap();
        ctx
    }

    fn info(snapshot: &str) -> SecureInfo {
        SecureInfo {
            local: "127.0.0.1:0".into(),
            peer: "127.0.0.1:0".into(),
            sub_index: None,
            timeout_ms: 1000,
            snapshot: snapshot.into(),
        }
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_plain_tcp_send() {
        let (client, mut server) = tcp_pair().await;
        let peer = client.peer_addr().unwrap();
        let (_read, write) = client.into_split();
        let link = Link::tcp(peer, write, None);
        assert_eq!(link.send(b"hello").await.unwrap(), 5);

        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_secure_tcp_round_trip() {
        let (client, server) = tcp_pair().await;
        let client_peer = client.peer_addr().unwrap();
        let server_peer = server.peer_addr().unwrap();
        let (_r, cw) = client.into_split();
        let (mut sr, sw) = server.into_split();

        let sender = Link::tcp(
            client_peer,
            cw,
            Some((established(Endpoint::Client, Transport::Stream), info("tcp_cnt_tls1"))),
        );
        let receiver = Link::tcp(
            server_peer,
            sw,
            Some((established(Endpoint::Server, Transport::Stream), info("tcp_srv_tls1_1"))),
        );

        sender.send(b"first").await.unwrap();
        sender.keepalive().await.unwrap();
        sender.send(b"second").await.unwrap();

        let mut buf = BytesMut::new();
        let mut received = Vec::new();
        while received.len() < 2 {
            sr.read_buf(&mut buf).await.unwrap();
            received.extend(receiver.open_stream(&mut buf).unwrap());
        }
        // The empty keep-alive record is consumed but not delivered
        assert_eq!(received, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[tokio::test]
    async fn test_snapshot_only_for_secure_links() {
        let codec = SessionCodec::new(Arc::new(MemoryRetention::new(4096)), true);
        let (client, _server) = tcp_pair().await;
        let peer = client.peer_addr().unwrap();
        let (_r, w) = client.into_split();
        let plain = Link::tcp(peer, w, None);
        assert!(plain.save_snapshot(&codec).unwrap().is_none());

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let secure = Link::udp(
            peer,
            socket,
            false,
            Some((established(Endpoint::Server, Transport::Datagram), info("udp_svr_tls1_1"))),
        );
        assert_eq!(
            secure.save_snapshot(&codec).unwrap(),
            Some(SaveOutcome::Written)
        );
        assert_eq!(
            secure.save_snapshot(&codec).unwrap(),
            Some(SaveOutcome::Unchanged)
        );
        assert!(codec.exists("udp_svr_tls1_1"));
    }

    #[tokio::test]
    async fn test_datagram_drops_bad_records() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer = socket.local_addr().unwrap();
        let link = Link::udp(
            peer,
            socket,
            false,
            Some((established(Endpoint::Server, Transport::Datagram), info("udp_svr_tls1_1"))),
        );
        assert_eq!(link.open_datagram(b"garbage").unwrap(), None);

        let mut client = established(Endpoint::Client, Transport::Datagram);
        let wire = client
            .write_record(ContentType::ApplicationData, b"ok", &mut OsRng)
            .unwrap();
        assert_eq!(link.open_datagram(&wire).unwrap(), Some(b"ok".to_vec()));
        // Replays are dropped
        assert_eq!(link.open_datagram(&wire).unwrap(), None);
    }
}
