//! Secure layer error types.

use dpm_retention::RetentionError;
use thiserror::Error;

/// Secure session errors
#[derive(Error, Debug)]
pub enum SecureError {
    /// Operation requires an established session
    #[error("secure session is not established")]
    NotSuccessful,

    /// No snapshot stored under the name
    #[error("no snapshot named {0}")]
    NotFound(String),

    /// Restore target already carries state
    #[error("context is not freshly initialized")]
    NotFresh,

    /// Snapshot does not fit the computed size
    #[error("buffer too small: need {needed} bytes, {available} available")]
    BufferTooSmall {
        /// Bytes required
        needed: usize,
        /// Bytes available
        available: usize,
    },

    /// Malformed or inconsistent input
    #[error("bad input data: {0}")]
    BadInputData(&'static str),

    /// Cipher suite not compiled into this build
    #[error("unknown cipher suite 0x{0:04x}")]
    UnknownCipherSuite(u16),

    /// Protocol version outside what the record layer supports
    #[error("unsupported protocol version {major}.{minor}")]
    UnsupportedVersion {
        /// Major version
        major: u8,
        /// Minor version
        minor: u8,
    },

    /// Peer certificate failed to parse
    #[error("certificate parse error: {0}")]
    CertParse(String),

    /// Record authentication or padding check failed
    #[error("record authentication failed")]
    BadMac,

    /// Record already seen or outside the replay window
    #[error("record replayed (sequence {0})")]
    Replay(u64),

    /// Primitive setup or operation failed
    #[error("crypto operation failed")]
    Crypto,

    /// Snapshots require deep-sleep mode
    #[error("secure session snapshots are not supported without DPM")]
    NotSupported,

    /// Handshake with the peer failed
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Transport I/O during a handshake
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Retention store failure
    #[error("retention: {0}")]
    Retention(#[from] RetentionError),
}
