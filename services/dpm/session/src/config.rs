//! Session configuration and the fixed limits of the session layer.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::DpmError;

/// Number of logical sessions
pub const MAX_SESSION_CNT: usize = 4;
/// Number of user timers
pub const MAX_TIMER_CNT: usize = 4;
/// Sub-sessions per TCP server
pub const TCP_SERVER_MAX_SUB: usize = 2;
/// Sub-sessions per secure UDP server
pub const UDP_SERVER_MAX_SUB: usize = 2;
/// Receive buffer size
pub const RX_BUFFER_SIZE: usize = 1500;
/// Default window size
pub const DEFAULT_WINDOW_SIZE: usize = 4096;
/// Local bind attempts before giving up
pub const BIND_RETRY_COUNT: u32 = 5;
/// Handshake attempts after the first one
pub const HANDSHAKE_RETRY_COUNT: u32 = 2;

/// TCP client receive timeout
pub const TCP_CLIENT_RX_TIMEOUT: Duration = Duration::from_millis(100);
/// TCP client receive timeout with a secure session
pub const TCP_CLIENT_RX_SECURE_TIMEOUT: Duration = Duration::from_millis(1000);
/// TCP server receive timeout
pub const TCP_SERVER_RX_TIMEOUT: Duration = Duration::from_millis(100);
/// TCP server receive timeout with a secure session
pub const TCP_SERVER_RX_SECURE_TIMEOUT: Duration = Duration::from_millis(2000);
/// UDP receive timeout
pub const UDP_RX_TIMEOUT: Duration = Duration::from_millis(300);
/// Accept poll interval of a TCP server
pub const ACCEPT_POLL: Duration = Duration::from_millis(100);
/// Wait between bind attempts
pub const BIND_WAIT: Duration = Duration::from_secs(1);
/// Wait before reconnecting after the peer closed
pub const RECONNECT_WAIT: Duration = Duration::from_secs(5);
/// Per-record read timeout of a DTLS handshake
pub const DTLS_HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_millis(1000);
/// Datagrams buffered per secure UDP sub-session
pub const SUB_INBOX_DEPTH: usize = 8;
/// Bound on one handshake attempt
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Polls spent waiting for an evicted sub-session to release its slot
pub const EVICT_POLL_COUNT: u32 = 25;
/// Interval between eviction polls
pub const EVICT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Transport and role of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Outbound TCP connection
    TcpClient,
    /// Listening TCP socket with per-peer sub-sessions
    TcpServer,
    /// Connected UDP socket
    UdpClient,
    /// Bound UDP socket
    UdpServer,
}

impl SessionKind {
    /// Whether the session listens for peers
    pub fn is_server(self) -> bool {
        matches!(self, SessionKind::TcpServer | SessionKind::UdpServer)
    }

    /// Whether the session runs over TCP
    pub fn is_tcp(self) -> bool {
        matches!(self, SessionKind::TcpClient | SessionKind::TcpServer)
    }

    fn task_prefix(self) -> &'static str {
        match self {
            SessionKind::TcpClient => "tcp_cnt",
            SessionKind::TcpServer => "tcp_srv",
            SessionKind::UdpClient => "udp_cnt",
            SessionKind::UdpServer => "udp_svr",
        }
    }

    /// Receive timeout of the session's I/O loop
    pub fn rx_timeout(self, secure: bool) -> Duration {
        match (self, secure) {
            (SessionKind::TcpClient, false) => TCP_CLIENT_RX_TIMEOUT,
            (SessionKind::TcpClient, true) => TCP_CLIENT_RX_SECURE_TIMEOUT,
            (SessionKind::TcpServer, false) => TCP_SERVER_RX_TIMEOUT,
            (SessionKind::TcpServer, true) => TCP_SERVER_RX_SECURE_TIMEOUT,
            (SessionKind::UdpClient, _) | (SessionKind::UdpServer, _) => UDP_RX_TIMEOUT,
        }
    }

    /// Sub-session pool capacity
    pub fn max_sub(self) -> usize {
        match self {
            SessionKind::TcpServer => TCP_SERVER_MAX_SUB,
            SessionKind::UdpServer => UDP_SERVER_MAX_SUB,
            _ => 0,
        }
    }
}

/// Task and sleep-gate module name, e.g. `tcp_cnt1`
pub fn task_name(kind: SessionKind, id: u8) -> String {
    format!("{}{}", kind.task_prefix(), id)
}

/// Sleep-gate module name of a sub-session, e.g. `tcp_srv1_2`
pub fn sub_task_name(kind: SessionKind, id: u8, sub: usize) -> String {
    format!("{}{}_{}", kind.task_prefix(), id, sub + 1)
}

/// Retention blob name of a secure snapshot
pub fn snapshot_name(kind: SessionKind, id: u8, sub: Option<usize>) -> String {
    match sub {
        Some(sub) => format!("{}_tls{}_{}", kind.task_prefix(), id, sub + 1),
        None => format!("{}_tls{}", kind.task_prefix(), id),
    }
}

/// Validate a session id and return its slot index
pub fn slot_index(id: u8) -> Result<usize, DpmError> {
    if id == 0 || id as usize > MAX_SESSION_CNT {
        return Err(DpmError::OutOfRange(id));
    }
    Ok(id as usize - 1)
}

/// Persistent configuration of one logical session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session id (1..=4)
    pub id: u8,
    /// Session kind; unconfigured sessions cannot start
    pub kind: Option<SessionKind>,
    /// Local port (listening port for servers, 0 for any)
    pub local_port: u16,
    /// Peer address of a client session
    pub peer_addr: Option<IpAddr>,
    /// Peer port of a client session
    pub peer_port: u16,
    /// Keep-alive interval in milliseconds, 0 disables keep-alive
    pub keepalive_ms: u64,
    /// TLS/DTLS protected session
    pub secure: bool,
    /// Receive window size
    pub window_size: usize,
    /// Connect attempts of a client before giving up
    pub conn_retry_count: u32,
    /// Wait between connect attempts in milliseconds
    pub conn_wait_ms: u64,
    /// Reconnect after the peer closes the connection
    pub auto_reconnect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            id: 0,
            kind: None,
            local_port: 0,
            peer_addr: None,
            peer_port: 0,
            keepalive_ms: 0,
            secure: false,
            window_size: DEFAULT_WINDOW_SIZE,
            conn_retry_count: 3,
            conn_wait_ms: 1000,
            auto_reconnect: false,
        }
    }
}

impl SessionConfig {
    /// Empty configuration for session `id`
    pub fn new(id: u8) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Peer socket address of a client session
    pub fn peer(&self) -> Option<SocketAddr> {
        match (self.peer_addr, self.peer_port) {
            (Some(ip), port) if port != 0 => Some(SocketAddr::new(ip, port)),
            _ => None,
        }
    }

    /// Wait between connect attempts
    pub fn conn_wait(&self) -> Duration {
        Duration::from_millis(self.conn_wait_ms)
    }

    /// Check that the configuration can be started
    pub fn validate(&self) -> Result<SessionKind, DpmError> {
        slot_index(self.id)?;
        let kind = self.kind.ok_or(DpmError::InvalidSessionType(self.id))?;
        if !kind.is_server() && self.peer().is_none() {
            return Err(DpmError::Parameter("client session without peer address"));
        }
        if kind.is_server() && self.local_port == 0 {
            return Err(DpmError::Parameter("server session without port"));
        }
        if self.window_size == 0 {
            return Err(DpmError::Parameter("zero window size"));
        }
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(task_name(SessionKind::TcpClient, 1), "tcp_cnt1");
        assert_eq!(sub_task_name(SessionKind::TcpServer, 2, 0), "tcp_srv2_1");
        assert_eq!(snapshot_name(SessionKind::UdpClient, 3, None), "udp_cnt_tls3");
        assert_eq!(snapshot_name(SessionKind::UdpServer, 4, Some(1)), "udp_svr_tls4_2");
    }

    #[test]
    fn test_slot_index() {
        assert!(matches!(slot_index(0), Err(DpmError::OutOfRange(0))));
        assert_eq!(slot_index(1).unwrap(), 0);
        assert_eq!(slot_index(4).unwrap(), 3);
        assert!(matches!(slot_index(5), Err(DpmError::OutOfRange(5))));
    }

    #[test]
    fn test_validate() {
        let mut config = SessionConfig::new(1);
        assert!(matches!(
            config.validate(),
            Err(DpmError::InvalidSessionType(1))
        ));

        config.kind = Some(SessionKind::TcpClient);
        assert!(matches!(config.validate(), Err(DpmError::Parameter(_))));

        config.peer_addr = Some("10.0.0.5".parse().unwrap());
        config.peer_port = 8080;
        assert_eq!(config.validate().unwrap(), SessionKind::TcpClient);
        assert_eq!(config.peer().unwrap().to_string(), "10.0.0.5:8080");

        let mut server = SessionConfig::new(2);
        server.kind = Some(SessionKind::UdpServer);
        assert!(server.validate().is_err());
        server.local_port = 5000;
        assert!(server.validate().is_ok());
    }

    #[test]
    fn test_rx_timeouts() {
        assert_eq!(SessionKind::TcpClient.rx_timeout(true), Duration::from_secs(1));
        assert_eq!(SessionKind::TcpServer.rx_timeout(true), Duration::from_secs(2));
        assert_eq!(SessionKind::UdpServer.rx_timeout(true), UDP_RX_TIMEOUT);
        assert_eq!(SessionKind::UdpClient.max_sub(), 0);
    }

    #[test]
    fn test_yaml_shape() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"id": 2, "kind": "tcp_server", "local_port": 9000}"#).unwrap();
        assert_eq!(config.kind, Some(SessionKind::TcpServer));
        assert_eq!(config.window_size, DEFAULT_WINDOW_SIZE);
    }
}
