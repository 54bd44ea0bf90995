//! Session layer error types and the numeric codes reported to the error callback.

use dpm_power::TimerError;
use dpm_retention::RetentionError;
use dpm_secure::SecureError;
use std::net::SocketAddr;
use thiserror::Error;

use crate::config::SessionKind;

/// Session layer errors
#[derive(Error, Debug)]
pub enum DpmError {
    /// Cold boot without a boot-init callback
    #[error("no boot init callback registered")]
    NoBootInitCallback,

    /// Wake without a wake-init callback
    #[error("no wakeup init callback registered")]
    NoWakeupInitCallback,

    /// Boot or wake init callback failed
    #[error("init callback failed: {0}")]
    InitialCallbackFail(String),

    /// Retention blob could not be allocated
    #[error("retention allocation failed: {0}")]
    RetentionAllocFail(#[source] RetentionError),

    /// Retention blob could not be read
    #[error("retention read of {0} failed")]
    RetentionGetFail(String),

    /// User timer id outside 1..=4
    #[error("invalid timer id {0}")]
    TimerType(u8),

    /// Session has no kind configured
    #[error("session {0} has no session type")]
    InvalidSessionType(u8),

    /// Socket could not be created
    #[error("socket create failed: {0}")]
    SocketCreate(#[source] std::io::Error),

    /// Local bind failed after retries
    #[error("bind to port {port} failed: {source}")]
    SocketBind {
        /// Local port
        port: u16,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Listen failed
    #[error("listen failed: {0}")]
    SocketListen(#[source] std::io::Error),

    /// Accept failed
    #[error("accept failed: {0}")]
    SocketAccept(#[source] std::io::Error),

    /// No sub-session for the peer
    #[error("no sub-session for peer {peer}")]
    NotFoundSubSession {
        /// Peer address
        peer: SocketAddr,
    },

    /// Connect failed after retries
    #[error("connect to {peer} failed: {source}")]
    SocketConnectFail {
        /// Peer address
        peer: SocketAddr,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Secure setup callback missing or failed
    #[error("secure init failed: {0}")]
    SecureInitFail(String),

    /// Handshake failed after retries
    #[error("handshake failed: {0}")]
    HandshakeFail(#[source] SecureError),

    /// Record protection failed on send
    #[error("secure write failed: {0}")]
    SecureWriteFail(#[source] SecureError),

    /// Record unprotection failed on receive
    #[error("secure read failed: {0}")]
    SecureReadFail(#[source] SecureError),

    /// Snapshot save failed
    #[error("secure session save failed: {0}")]
    SaveSslFail(#[source] SecureError),

    /// Snapshot restore failed
    #[error("secure session restore failed: {0}")]
    RestoreSslFail(#[source] SecureError),

    /// Client session not connected
    #[error("session {0} is not connected")]
    SocketNotConnect(u8),

    /// Socket send failed
    #[error("send failed: {0}")]
    SendFail(#[source] std::io::Error),

    /// Socket receive failed
    #[error("receive failed: {0}")]
    ReceiveFail(#[source] std::io::Error),

    /// Peer closed the connection
    #[error("peer {0} closed the connection")]
    PeerClosed(SocketAddr),

    /// Session did not reach a running state in time
    #[error("session {0} did not start")]
    NotEnabled(u8),

    /// Session was never started
    #[error("session {0} was never created")]
    NotCreated(u8),

    /// Timer registration failed
    #[error("timer create failed: {0}")]
    TimerCreate(#[source] TimerError),

    /// Session id outside 1..=4
    #[error("session id {0} out of range")]
    OutOfRange(u8),

    /// Session did not acknowledge a request in time
    #[error("session {0} did not acknowledge the request")]
    WaitError(u8),

    /// Session stopped and did not come back for a send
    #[error("session {0} is stopped")]
    SessionStartFail(u8),

    /// Invalid argument
    #[error("invalid parameter: {0}")]
    Parameter(&'static str),

    /// Operation does not apply to this session kind
    #[error("{op} does not apply to {kind:?} sessions")]
    SessionTypeMismatch {
        /// Operation name
        op: &'static str,
        /// Configured kind
        kind: SessionKind,
    },

    /// Session was stopped by the application
    #[error("session {0} was force-stopped")]
    ForceStopped(u8),
}

impl DpmError {
    /// Numeric code delivered to the error callback
    pub fn code(&self) -> u32 {
        match self {
            DpmError::NoBootInitCallback => 0x01,
            DpmError::NoWakeupInitCallback => 0x02,
            DpmError::InitialCallbackFail(_) => 0x03,
            DpmError::RetentionAllocFail(_) => 0x04,
            DpmError::RetentionGetFail(_) => 0x05,
            DpmError::TimerType(_) => 0x06,
            DpmError::InvalidSessionType(_) => 0x07,
            DpmError::SocketCreate(_) => 0x10,
            DpmError::SocketBind { .. } => 0x11,
            DpmError::SocketListen(_) => 0x12,
            DpmError::SocketAccept(_) => 0x13,
            DpmError::NotFoundSubSession { .. } => 0x14,
            DpmError::SocketConnectFail { .. } => 0x15,
            DpmError::SecureInitFail(_) => 0x16,
            DpmError::HandshakeFail(_) => 0x17,
            DpmError::SecureWriteFail(_) => 0x18,
            DpmError::SecureReadFail(_) => 0x19,
            DpmError::RestoreSslFail(_) => 0x1B,
            DpmError::SocketNotConnect(_) => 0x20,
            DpmError::SendFail(_) => 0x21,
            DpmError::ReceiveFail(_) => 0x22,
            DpmError::PeerClosed(_) => 0x23,
            DpmError::NotEnabled(_) => 0x24,
            DpmError::NotCreated(_) => 0x25,
            DpmError::TimerCreate(_) => 0x26,
            DpmError::OutOfRange(_) => 0x27,
            DpmError::SaveSslFail(_) => 0x28,
            DpmError::WaitError(_) => 0x29,
            DpmError::SessionStartFail(_) => 0x2A,
            DpmError::Parameter(_) => 0x2B,
            DpmError::SessionTypeMismatch { .. } => 0x2C,
            DpmError::ForceStopped(_) => 0x30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(DpmError::NoBootInitCallback.code(), 0x01);
        assert_eq!(DpmError::OutOfRange(9).code(), 0x27);
        assert_eq!(DpmError::SaveSslFail(SecureError::NotSuccessful).code(), 0x28);
        assert_eq!(DpmError::RestoreSslFail(SecureError::NotFresh).code(), 0x1B);
        assert_eq!(DpmError::ForceStopped(1).code(), 0x30);
        assert_eq!(
            DpmError::SessionTypeMismatch {
                op: "set_server_port",
                kind: SessionKind::TcpClient
            }
            .code(),
            0x2C
        );
    }

    #[test]
    fn test_messages_name_the_session() {
        let err = DpmError::SocketNotConnect(1);
        assert_eq!(err.to_string(), "session 1 is not connected");

        let peer: SocketAddr = "10.0.0.5:8080".parse().unwrap();
        let err = DpmError::NotFoundSubSession { peer };
        assert!(err.to_string().contains("10.0.0.5:8080"));
    }
}
