//! Live secure-session state: handshake progress, negotiated session and record layer.

use crate::cert::PeerCertificate;
use crate::record::{
    ContentType, HeaderRegion, ProtocolVersion, RecordHeader, ReplayWindow, Transport,
    MAX_PLAINTEXT_LEN,
};
use crate::transform::{Endpoint, Transform, TransformFlags};
use crate::SecureError;
use bytes::BytesMut;
use rand::{CryptoRng, RngCore};
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Length of the master secret
pub const MASTER_SECRET_LEN: usize = 48;
/// Longest session id
pub const MAX_SESSION_ID_LEN: usize = 32;
/// Finished verify-data length
pub const VERIFY_DATA_LEN: usize = 12;

const DTLS_SEQ_MAX: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Handshake progress
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Newly set up, nothing negotiated
    Fresh = 0,
    /// Handshake running
    InProgress = 1,
    /// Keys installed, application data may flow
    Established = 16,
    /// Failed restore or fatal error; no I/O allowed
    Invalid = 0xFF,
}

impl HandshakeState {
    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(HandshakeState::Fresh),
            1 => Some(HandshakeState::InProgress),
            16 => Some(HandshakeState::Established),
            0xFF => Some(HandshakeState::Invalid),
            _ => None,
        }
    }
}

/// Static configuration of a secure context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecureConfig {
    /// Local role
    pub endpoint: Endpoint,
    /// TLS or DTLS
    pub transport: Transport,
}

/// Handshake working state, dropped once the session is established
#[derive(Debug, Clone, Default)]
pub struct HandshakeScratch {
    /// ClientHello random
    pub client_random: [u8; 32],
    /// ServerHello random
    pub server_random: [u8; 32],
    /// Handshake messages seen so far
    pub transcript: Vec<u8>,
}

/// Negotiated session parameters
#[derive(Debug, Clone)]
pub struct SecureSession {
    /// Cipher suite id
    pub ciphersuite: u16,
    /// Session id (at most 32 bytes)
    pub id: Vec<u8>,
    /// Master secret
    pub master: Zeroizing<[u8; MASTER_SECRET_LEN]>,
    /// Unix time the session started
    pub start_time: i64,
    /// Compression method
    pub compression: u8,
    /// Certificate verification result flags
    pub verify_result: u32,
    /// Negotiated record extensions
    pub flags: TransformFlags,
    /// Peer certificate, when the peer sent one
    pub peer_cert: Option<PeerCertificate>,
    /// Session ticket, when one was issued
    pub ticket: Option<Vec<u8>>,
    /// Ticket lifetime hint in seconds
    pub ticket_lifetime: u32,
}

impl SecureSession {
    /// New session for `ciphersuite` with the given master secret
    pub fn new(ciphersuite: u16, master: [u8; MASTER_SECRET_LEN]) -> Self {
        Self {
            ciphersuite,
            id: Vec::new(),
            master: Zeroizing::new(master),
            start_time: 0,
            compression: 0,
            verify_result: 0,
            flags: TransformFlags::default(),
            peer_cert: None,
            ticket: None,
            ticket_lifetime: 0,
        }
    }
}

/// One decrypted record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Content type
    pub content_type: ContentType,
    /// Plaintext
    pub payload: Vec<u8>,
    /// Bytes of input consumed
    pub consumed: usize,
}

/// Secure context for one connection
pub struct SecureContext {
    pub(crate) config: SecureConfig,
    pub(crate) state: HandshakeState,
    pub(crate) version: ProtocolVersion,
    pub(crate) renego_status: u8,
    pub(crate) secure_renegotiation: bool,
    pub(crate) verify_data_len: u8,
    pub(crate) own_verify_data: [u8; VERIFY_DATA_LEN],
    pub(crate) peer_verify_data: [u8; VERIFY_DATA_LEN],
    pub(crate) in_region: HeaderRegion,
    pub(crate) out_region: HeaderRegion,
    pub(crate) in_epoch: u16,
    pub(crate) replay: ReplayWindow,
    pub(crate) badmac_seen: u32,
    pub(crate) nb_zero: u32,
    pub(crate) client_auth: bool,
    pub(crate) cli_id: Option<Vec<u8>>,
    pub(crate) handshake: Option<Box<HandshakeScratch>>,
    pub(crate) session: Option<SecureSession>,
    pub(crate) transform: Option<Transform>,
    pub(crate) in_msg_offset: usize,
    pub(crate) out_msg_offset: usize,
}

impl std::fmt::Debug for SecureContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureContext")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("version", &self.version)
            .field("transform", &self.transform)
            .finish_non_exhaustive()
    }
}

impl SecureContext {
    /// Set up a fresh context with handshake scratch allocated
    pub fn new(config: SecureConfig) -> Self {
        let header_len = config.transport.header_len();
        Self {
            config,
            state: HandshakeState::Fresh,
            version: ProtocolVersion::TLS1_2,
            renego_status: 0,
            secure_renegotiation: false,
            verify_data_len: 0,
            own_verify_data: [0; VERIFY_DATA_LEN],
            peer_verify_data: [0; VERIFY_DATA_LEN],
            in_region: HeaderRegion::default(),
            out_region: HeaderRegion::default(),
            in_epoch: 0,
            replay: ReplayWindow::default(),
            badmac_seen: 0,
            nb_zero: 0,
            client_auth: false,
            cli_id: None,
            handshake: Some(Box::default()),
            session: None,
            transform: None,
            in_msg_offset: header_len,
            out_msg_offset: header_len,
        }
    }

    /// Static configuration
    pub fn config(&self) -> SecureConfig {
        self.config
    }

    /// Handshake progress
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Negotiated protocol version
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Whether application data may flow
    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    /// Whether nothing has been negotiated or sent yet
    pub fn is_fresh(&self) -> bool {
        self.state == HandshakeState::Fresh
            && self.session.is_none()
            && self.transform.is_none()
            && self.in_region == HeaderRegion::default()
            && self.out_region == HeaderRegion::default()
    }

    /// Negotiated session
    pub fn session(&self) -> Option<&SecureSession> {
        self.session.as_ref()
    }

    /// Record protection
    pub fn transform(&self) -> Option<&Transform> {
        self.transform.as_ref()
    }

    /// Handshake scratch, while a handshake may still run
    pub fn handshake_mut(&mut self) -> Option<&mut HandshakeScratch> {
        self.handshake.as_deref_mut()
    }

    /// DTLS client id used for cookie verification
    pub fn client_id(&self) -> Option<&[u8]> {
        self.cli_id.as_deref()
    }

    /// Set the DTLS client id (servers only)
    pub fn set_client_id(&mut self, id: &[u8]) -> Result<(), SecureError> {
        if self.config.endpoint != Endpoint::Server {
            return Err(SecureError::BadInputData("client id on a client context"));
        }
        self.cli_id = Some(id.to_vec());
        Ok(())
    }

    /// Mark the handshake as running
    pub fn begin_handshake(&mut self) -> &mut HandshakeScratch {
        self.state = HandshakeState::InProgress;
        self.handshake.get_or_insert_with(Box::default)
    }

    /// Install negotiated state; the record counters restart at zero
    pub fn establish(
        &mut self,
        version: ProtocolVersion,
        session: SecureSession,
        key_block: &[u8],
        own_verify_data: [u8; VERIFY_DATA_LEN],
        peer_verify_data: [u8; VERIFY_DATA_LEN],
    ) -> Result<(), SecureError> {
        if !version.is_supported() {
            return Err(SecureError::UnsupportedVersion {
                major: version.major,
                minor: version.minor,
            });
        }
        let transform = Transform::new(
            session.ciphersuite,
            self.config.endpoint,
            version.minor,
            session.flags,
            key_block,
        )?;

        self.version = version;
        self.session = Some(session);
        self.transform = Some(transform);
        self.own_verify_data = own_verify_data;
        self.peer_verify_data = peer_verify_data;
        self.verify_data_len = VERIFY_DATA_LEN as u8;
        self.secure_renegotiation = true;
        self.handshake = None;

        let transport = self.config.transport;
        self.in_region = HeaderRegion::default();
        self.out_region = HeaderRegion::default();
        self.replay = ReplayWindow::default();
        self.badmac_seen = 0;
        self.nb_zero = 0;
        if transport == Transport::Datagram {
            self.in_epoch = 1;
            self.out_region.set_counter(transport, 1u64 << 48);
            self.in_region.set_counter(transport, 1u64 << 48);
        }

        self.update_offsets();
        self.state = HandshakeState::Established;
        debug!(
            "Secure session established version={}.{} suite=0x{:04x}",
            version.major,
            version.minor,
            self.session.as_ref().map(|s| s.ciphersuite).unwrap_or_default()
        );
        Ok(())
    }

    /// Drop all negotiated state; only a fresh context can be used afterwards
    pub fn invalidate(&mut self) {
        self.state = HandshakeState::Invalid;
        self.transform = None;
        self.session = None;
        self.handshake = None;
    }

    /// Record header length
    pub fn header_len(&self) -> usize {
        self.config.transport.header_len()
    }

    /// Offsets of the message body within inbound and outbound records
    pub fn message_offsets(&self) -> (usize, usize) {
        (self.in_msg_offset, self.out_msg_offset)
    }

    pub(crate) fn update_offsets(&mut self) {
        let mut offset = self.header_len();
        if let Some(transform) = &self.transform {
            if self.version.minor >= 2 {
                offset += transform.params().explicit_ivlen();
            }
        }
        self.in_msg_offset = offset;
        self.out_msg_offset = offset;
    }

    /// Next outbound record counter
    pub fn out_counter(&self) -> u64 {
        self.out_region.counter(self.config.transport)
    }

    /// Next expected inbound record counter
    pub fn in_counter(&self) -> u64 {
        self.in_region.counter(self.config.transport)
    }

    /// Saved header regions (outbound, inbound)
    pub fn header_regions(&self) -> (&HeaderRegion, &HeaderRegion) {
        (&self.out_region, &self.in_region)
    }

    /// Records that failed authentication so far
    pub fn bad_mac_count(&self) -> u32 {
        self.badmac_seen
    }

    /// Length of the next complete record in `buffered`, if its header has arrived
    pub fn pending_record_len(&self, buffered: &[u8]) -> Option<usize> {
        let header = RecordHeader::decode(self.config.transport, buffered).ok()?;
        Some(self.header_len() + header.length as usize)
    }

    fn next_out_counter(&self) -> Result<u64, SecureError> {
        let counter = self.out_counter();
        let exhausted = match self.config.transport {
            Transport::Stream => counter == u64::MAX,
            Transport::Datagram => counter & DTLS_SEQ_MAX == DTLS_SEQ_MAX,
        };
        if exhausted {
            return Err(SecureError::BadInputData("record counter exhausted"));
        }
        Ok(counter)
    }

    fn emit(&mut self, content_type: ContentType, counter: u64, body: &[u8]) -> Vec<u8> {
        let transport = self.config.transport;
        let header = RecordHeader {
            content_type: content_type as u8,
            version: self.version.to_wire(transport),
            counter: if transport == Transport::Datagram {
                counter
            } else {
                0
            },
            length: body.len() as u16,
        };
        let mut out = BytesMut::with_capacity(self.header_len() + body.len());
        header.encode(transport, &mut out);
        out.extend_from_slice(body);

        self.out_region.set_header(transport, &header);
        self.out_region.set_counter(transport, counter + 1);
        out.to_vec()
    }

    /// Protect and frame one record
    pub fn write_record<R: RngCore + CryptoRng>(
        &mut self,
        content_type: ContentType,
        plaintext: &[u8],
        rng: &mut R,
    ) -> Result<Vec<u8>, SecureError> {
        if self.state != HandshakeState::Established {
            return Err(SecureError::NotSuccessful);
        }
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(SecureError::BadInputData("record too large"));
        }
        let transform = self.transform.as_ref().ok_or(SecureError::NotSuccessful)?;
        let counter = self.next_out_counter()?;
        let wire_version = self.version.to_wire(self.config.transport);
        let body = transform.encrypt(counter, content_type as u8, wire_version, plaintext, rng)?;
        Ok(self.emit(content_type, counter, &body))
    }

    /// Frame one unprotected record (handshake phase only)
    pub fn write_plain(
        &mut self,
        content_type: ContentType,
        payload: &[u8],
    ) -> Result<Vec<u8>, SecureError> {
        if matches!(
            self.state,
            HandshakeState::Established | HandshakeState::Invalid
        ) {
            return Err(SecureError::BadInputData("plaintext record after handshake"));
        }
        if payload.len() > MAX_PLAINTEXT_LEN {
            return Err(SecureError::BadInputData("record too large"));
        }
        let counter = self.next_out_counter()?;
        Ok(self.emit(content_type, counter, payload))
    }

    /// Parse, verify and unprotect the record at the start of `data`
    pub fn read_record(&mut self, data: &[u8]) -> Result<Record, SecureError> {
        if self.state == HandshakeState::Invalid {
            return Err(SecureError::NotSuccessful);
        }
        let transport = self.config.transport;
        let header = RecordHeader::decode(transport, data)?;
        let content_type = ContentType::try_from(header.content_type)?;
        let version = ProtocolVersion::from_wire(header.version, transport)?;
        if self.is_established() && version != self.version {
            return Err(SecureError::BadInputData("record version mismatch"));
        }

        let start = self.header_len();
        let end = start + header.length as usize;
        if data.len() < end {
            return Err(SecureError::BadInputData("incomplete record"));
        }
        let body = &data[start..end];

        let counter = match transport {
            Transport::Stream => self.in_counter(),
            Transport::Datagram => {
                if header.epoch() != self.in_epoch {
                    debug!(
                        "Dropping record from epoch {} (expected {})",
                        header.epoch(),
                        self.in_epoch
                    );
                    return Err(SecureError::BadInputData("unexpected epoch"));
                }
                self.replay.check(header.sequence())?;
                header.counter
            }
        };

        let payload = match (&self.transform, self.state) {
            (Some(transform), HandshakeState::Established) => {
                match transform.decrypt(counter, header.content_type, header.version, body) {
                    Ok(payload) => payload,
                    Err(e) => {
                        self.badmac_seen = self.badmac_seen.saturating_add(1);
                        warn!("Record rejected: {} (bad records: {})", e, self.badmac_seen);
                        return Err(e);
                    }
                }
            }
            _ => body.to_vec(),
        };

        if transport == Transport::Datagram {
            self.replay.update(header.sequence());
        }
        self.in_region.set_header(transport, &header);
        let next = match transport {
            Transport::Stream => counter.wrapping_add(1),
            Transport::Datagram => self.in_counter().max(counter.wrapping_add(1)),
        };
        self.in_region.set_counter(transport, next);

        if content_type == ContentType::ApplicationData && payload.is_empty() {
            self.nb_zero = self.nb_zero.saturating_add(1);
        } else {
            self.nb_zero = 0;
        }

        Ok(Record {
            content_type,
            payload,
            consumed: end,
        })
    }
}
