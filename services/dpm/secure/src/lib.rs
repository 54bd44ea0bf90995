//! Secure session state for DPM.
//!
//! Holds the record-layer state of an established TLS 1.2 / DTLS 1.2 session, protects and
//! unprotects records with it, and snapshots it into retention memory so the session can
//! continue after deep power-down without a new handshake.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cert;
pub mod codec;
pub mod context;
pub mod error;
pub mod prf;
pub mod psk;
pub mod record;
pub mod suite;
pub mod transform;

pub use cert::PeerCertificate;
pub use codec::{size_of_snapshot, SaveOutcome, SessionCodec};
pub use context::{
    HandshakeScratch, HandshakeState, Record, SecureConfig, SecureContext, SecureSession,
    MASTER_SECRET_LEN, VERIFY_DATA_LEN,
};
pub use error::SecureError;
pub use prf::tls12_prf;
pub use psk::PskHandshake;
pub use record::{ContentType, ProtocolVersion, Transport, MAX_PLAINTEXT_LEN};
pub use suite::{CipherSuite, MacAlg};
pub use transform::{Endpoint, Transform, TransformFlags, KEY_BLOCK_LEN};
