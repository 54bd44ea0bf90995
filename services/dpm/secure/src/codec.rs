//! Secure session snapshots in retention memory.
//!
//! A snapshot is a versioned, big-endian encoding owned by this crate:
//!
//! ```text
//! header     magic "DPMS" | schema u16 | flags u16
//! context    fixed block (state, version, renegotiation, verify data, epoch,
//!            replay window, counters as two 13-byte header regions) | client id
//! session    fixed block (suite, id, master secret, ...) | cert DER | ticket
//! transform  suite u16 | key block
//! trailer    CRC32 of everything above
//! ```
//!
//! Only plain values are stored. Cipher and MAC instances are rebuilt from the key block on
//! restore, and the peer certificate is parsed again from its DER bytes.

use crate::cert::PeerCertificate;
use crate::context::{
    HandshakeState, SecureContext, SecureSession, MASTER_SECRET_LEN, MAX_SESSION_ID_LEN,
    VERIFY_DATA_LEN,
};
use crate::record::{HeaderRegion, ProtocolVersion, ReplayWindow, Transport, HEADER_REGION_LEN};
use crate::transform::{Endpoint, Transform, TransformFlags, KEY_BLOCK_LEN};
use crate::SecureError;
use bytes::{Buf, BufMut};
use dpm_retention::{validate_name, RetentionStore};
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Snapshot magic ("DPMS")
pub const SNAPSHOT_MAGIC: u32 = 0x4450_4D53;
/// Snapshot schema version
pub const SNAPSHOT_SCHEMA: u16 = 1;

const HEADER_LEN: usize = 8;
const CONTEXT_FIXED_LEN: usize = 87;
const SESSION_FIXED_LEN: usize = 101;
const TRANSFORM_LEN: usize = 2 + KEY_BLOCK_LEN;
const TRAILER_LEN: usize = 4;

/// Offset of the two header regions inside a snapshot
pub const REGION_OFFSET: usize = HEADER_LEN + 59;
const REGIONS_LEN: usize = 2 * HEADER_REGION_LEN;

const FLAG_CLI_ID: u16 = 0x0001;
const FLAG_CERT: u16 = 0x0002;
const FLAG_TICKET: u16 = 0x0004;

const SESSION_ETM: u8 = 0x01;
const SESSION_TRUNC_HMAC: u8 = 0x02;

/// Result of a save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Snapshot written to retention memory
    Written,
    /// Stored snapshot already matches the session; nothing written
    Unchanged,
}

struct BoundedWriter {
    buf: Vec<u8>,
    limit: usize,
}

impl BoundedWriter {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit),
            limit,
        }
    }

    fn reserve(&mut self, n: usize) -> Result<&mut Vec<u8>, SecureError> {
        if self.buf.len() + n > self.limit {
            return Err(SecureError::BufferTooSmall {
                needed: self.buf.len() + n,
                available: self.limit,
            });
        }
        Ok(&mut self.buf)
    }

    fn put_u8(&mut self, v: u8) -> Result<(), SecureError> {
        self.reserve(1)?.put_u8(v);
        Ok(())
    }

    fn put_u16(&mut self, v: u16) -> Result<(), SecureError> {
        self.reserve(2)?.put_u16(v);
        Ok(())
    }

    fn put_u32(&mut self, v: u32) -> Result<(), SecureError> {
        self.reserve(4)?.put_u32(v);
        Ok(())
    }

    fn put_u64(&mut self, v: u64) -> Result<(), SecureError> {
        self.reserve(8)?.put_u64(v);
        Ok(())
    }

    fn put_slice(&mut self, v: &[u8]) -> Result<(), SecureError> {
        self.reserve(v.len())?.put_slice(v);
        Ok(())
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

fn need(buf: &&[u8], n: usize) -> Result<(), SecureError> {
    if buf.remaining() < n {
        return Err(SecureError::BadInputData("snapshot truncated"));
    }
    Ok(())
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], SecureError> {
    need(buf, n)?;
    let slice: &'a [u8] = *buf;
    let (head, tail) = slice.split_at(n);
    *buf = tail;
    Ok(head)
}

fn take_array<const N: usize>(buf: &mut &[u8]) -> Result<[u8; N], SecureError> {
    let mut out = [0u8; N];
    out.copy_from_slice(take(buf, N)?);
    Ok(out)
}

/// Decoded snapshot, validated but not yet applied
struct Snapshot {
    state: HandshakeState,
    endpoint: Endpoint,
    transport: Transport,
    version: ProtocolVersion,
    renego_status: u8,
    secure_renegotiation: bool,
    verify_data_len: u8,
    own_verify_data: [u8; VERIFY_DATA_LEN],
    peer_verify_data: [u8; VERIFY_DATA_LEN],
    in_epoch: u16,
    replay: ReplayWindow,
    badmac_seen: u32,
    nb_zero: u32,
    client_auth: bool,
    out_region: HeaderRegion,
    in_region: HeaderRegion,
    cli_id: Option<Vec<u8>>,
    ciphersuite: u16,
    compression: u8,
    session_id: Vec<u8>,
    master: Zeroizing<[u8; MASTER_SECRET_LEN]>,
    start_time: i64,
    verify_result: u32,
    session_flags: TransformFlags,
    ticket_lifetime: u32,
    cert_der: Option<Vec<u8>>,
    ticket: Option<Vec<u8>>,
    transform_suite: u16,
    key_block: Zeroizing<Vec<u8>>,
}

fn endpoint_byte(endpoint: Endpoint) -> u8 {
    match endpoint {
        Endpoint::Client => 0,
        Endpoint::Server => 1,
    }
}

fn transport_byte(transport: Transport) -> u8 {
    match transport {
        Transport::Stream => 0,
        Transport::Datagram => 1,
    }
}

/// Exact snapshot size for an established context
pub fn size_of_snapshot(ctx: &SecureContext) -> Result<usize, SecureError> {
    let session = ctx.session.as_ref().ok_or(SecureError::NotSuccessful)?;
    let cli_id = ctx.cli_id.as_ref().map_or(0, Vec::len);
    let cert = session.peer_cert.as_ref().map_or(0, |c| c.der().len());
    let ticket = session.ticket.as_ref().map_or(0, Vec::len);

    Ok(HEADER_LEN
        + CONTEXT_FIXED_LEN
        + cli_id
        + SESSION_FIXED_LEN
        + 4
        + cert
        + 4
        + ticket
        + TRANSFORM_LEN
        + TRAILER_LEN)
}

fn encode(ctx: &SecureContext, size: usize) -> Result<Vec<u8>, SecureError> {
    let session = ctx.session.as_ref().ok_or(SecureError::NotSuccessful)?;
    let transform = ctx.transform.as_ref().ok_or(SecureError::NotSuccessful)?;
    if session.id.len() > MAX_SESSION_ID_LEN {
        return Err(SecureError::BadInputData("session id too long"));
    }
    let cli_id = ctx.cli_id.as_deref().unwrap_or_default();
    if cli_id.len() > u16::MAX as usize {
        return Err(SecureError::BadInputData("client id too long"));
    }

    let mut flags = 0u16;
    if ctx.cli_id.is_some() {
        flags |= FLAG_CLI_ID;
    }
    if session.peer_cert.is_some() {
        flags |= FLAG_CERT;
    }
    if session.ticket.is_some() {
        flags |= FLAG_TICKET;
    }

    let mut w = BoundedWriter::new(size);

    w.put_u32(SNAPSHOT_MAGIC)?;
    w.put_u16(SNAPSHOT_SCHEMA)?;
    w.put_u16(flags)?;

    // Context
    w.put_u8(ctx.state as u8)?;
    w.put_u8(endpoint_byte(ctx.config.endpoint))?;
    w.put_u8(transport_byte(ctx.config.transport))?;
    w.put_u8(ctx.version.major)?;
    w.put_u8(ctx.version.minor)?;
    w.put_u8(ctx.renego_status)?;
    w.put_u8(ctx.secure_renegotiation as u8)?;
    w.put_u8(ctx.verify_data_len)?;
    w.put_slice(&ctx.own_verify_data)?;
    w.put_slice(&ctx.peer_verify_data)?;
    w.put_u16(ctx.in_epoch)?;
    w.put_u64(ctx.replay.top)?;
    w.put_u64(ctx.replay.bits)?;
    w.put_u32(ctx.badmac_seen)?;
    w.put_u32(ctx.nb_zero)?;
    w.put_u8(ctx.client_auth as u8)?;
    w.put_slice(ctx.out_region.as_bytes())?;
    w.put_slice(ctx.in_region.as_bytes())?;
    w.put_u16(cli_id.len() as u16)?;
    w.put_slice(cli_id)?;

    // Session
    let mut id = [0u8; MAX_SESSION_ID_LEN];
    id[..session.id.len()].copy_from_slice(&session.id);
    let mut session_flags = 0u8;
    if session.flags.encrypt_then_mac {
        session_flags |= SESSION_ETM;
    }
    if session.flags.truncated_hmac {
        session_flags |= SESSION_TRUNC_HMAC;
    }
    w.put_u16(session.ciphersuite)?;
    w.put_u8(session.compression)?;
    w.put_u8(session.id.len() as u8)?;
    w.put_slice(&id)?;
    w.put_slice(&session.master[..])?;
    w.put_u64(session.start_time as u64)?;
    w.put_u32(session.verify_result)?;
    w.put_u8(session_flags)?;
    w.put_u32(session.ticket_lifetime)?;

    let cert = session.peer_cert.as_ref().map(|c| c.der()).unwrap_or_default();
    w.put_u32(cert.len() as u32)?;
    w.put_slice(cert)?;
    let ticket = session.ticket.as_deref().unwrap_or_default();
    w.put_u32(ticket.len() as u32)?;
    w.put_slice(ticket)?;

    // Transform
    w.put_u16(transform.suite().id)?;
    w.put_slice(transform.key_block())?;

    let crc = crc32fast::hash(&w.buf);
    w.put_u32(crc)?;

    let bytes = w.finish();
    if bytes.len() != size {
        return Err(SecureError::BadInputData("snapshot size mismatch"));
    }
    Ok(bytes)
}

fn decode(bytes: &[u8]) -> Result<Snapshot, SecureError> {
    if bytes.len() < HEADER_LEN + CONTEXT_FIXED_LEN + TRAILER_LEN {
        return Err(SecureError::BadInputData("snapshot truncated"));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - TRAILER_LEN);
    let stored_crc = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if crc32fast::hash(body) != stored_crc {
        return Err(SecureError::BadInputData("snapshot checksum mismatch"));
    }

    let mut buf = body;
    need(&buf, HEADER_LEN)?;
    if buf.get_u32() != SNAPSHOT_MAGIC {
        return Err(SecureError::BadInputData("snapshot magic"));
    }
    if buf.get_u16() != SNAPSHOT_SCHEMA {
        return Err(SecureError::BadInputData("snapshot schema"));
    }
    let flags = buf.get_u16();

    need(&buf, CONTEXT_FIXED_LEN)?;
    let state = HandshakeState::from_u8(buf.get_u8())
        .ok_or(SecureError::BadInputData("handshake state"))?;
    let endpoint = match buf.get_u8() {
        0 => Endpoint::Client,
        1 => Endpoint::Server,
        _ => return Err(SecureError::BadInputData("endpoint")),
    };
    let transport = match buf.get_u8() {
        0 => Transport::Stream,
        1 => Transport::Datagram,
        _ => return Err(SecureError::BadInputData("transport")),
    };
    let version = ProtocolVersion {
        major: buf.get_u8(),
        minor: buf.get_u8(),
    };
    let renego_status = buf.get_u8();
    let secure_renegotiation = buf.get_u8() != 0;
    let verify_data_len = buf.get_u8();
    let own_verify_data = take_array::<VERIFY_DATA_LEN>(&mut buf)?;
    let peer_verify_data = take_array::<VERIFY_DATA_LEN>(&mut buf)?;
    let in_epoch = buf.get_u16();
    let replay = ReplayWindow {
        top: buf.get_u64(),
        bits: buf.get_u64(),
    };
    let badmac_seen = buf.get_u32();
    let nb_zero = buf.get_u32();
    let client_auth = buf.get_u8() != 0;
    let out_region = HeaderRegion(take_array::<HEADER_REGION_LEN>(&mut buf)?);
    let in_region = HeaderRegion(take_array::<HEADER_REGION_LEN>(&mut buf)?);
    let cli_id_len = buf.get_u16() as usize;
    let cli_id = take(&mut buf, cli_id_len)?.to_vec();
    let cli_id = (flags & FLAG_CLI_ID != 0).then_some(cli_id);

    if state != HandshakeState::Established {
        return Err(SecureError::BadInputData("snapshot of unestablished session"));
    }
    if !version.is_supported() {
        return Err(SecureError::UnsupportedVersion {
            major: version.major,
            minor: version.minor,
        });
    }
    if verify_data_len as usize > VERIFY_DATA_LEN {
        return Err(SecureError::BadInputData("verify data length"));
    }

    need(&buf, SESSION_FIXED_LEN)?;
    let ciphersuite = buf.get_u16();
    let compression = buf.get_u8();
    let id_len = buf.get_u8() as usize;
    let id = take_array::<MAX_SESSION_ID_LEN>(&mut buf)?;
    if id_len > MAX_SESSION_ID_LEN {
        return Err(SecureError::BadInputData("session id length"));
    }
    let master = Zeroizing::new(take_array::<MASTER_SECRET_LEN>(&mut buf)?);
    let start_time = buf.get_u64() as i64;
    let verify_result = buf.get_u32();
    let session_bits = buf.get_u8();
    let ticket_lifetime = buf.get_u32();

    need(&buf, 4)?;
    let cert_len = buf.get_u32() as usize;
    let cert_der = take(&mut buf, cert_len)?.to_vec();
    need(&buf, 4)?;
    let ticket_len = buf.get_u32() as usize;
    let ticket = take(&mut buf, ticket_len)?.to_vec();

    need(&buf, TRANSFORM_LEN)?;
    let transform_suite = buf.get_u16();
    let key_block = Zeroizing::new(take(&mut buf, KEY_BLOCK_LEN)?.to_vec());
    if buf.has_remaining() {
        return Err(SecureError::BadInputData("trailing bytes in snapshot"));
    }
    if transform_suite != ciphersuite {
        return Err(SecureError::BadInputData("transform and session suites differ"));
    }

    Ok(Snapshot {
        state,
        endpoint,
        transport,
        version,
        renego_status,
        secure_renegotiation,
        verify_data_len,
        own_verify_data,
        peer_verify_data,
        in_epoch,
        replay,
        badmac_seen,
        nb_zero,
        client_auth,
        out_region,
        in_region,
        cli_id,
        ciphersuite,
        compression,
        session_id: id[..id_len].to_vec(),
        master,
        start_time,
        verify_result,
        session_flags: TransformFlags {
            encrypt_then_mac: session_bits & SESSION_ETM != 0,
            truncated_hmac: session_bits & SESSION_TRUNC_HMAC != 0,
        },
        ticket_lifetime,
        cert_der: (flags & FLAG_CERT != 0).then_some(cert_der),
        ticket: (flags & FLAG_TICKET != 0).then_some(ticket),
        transform_suite,
        key_block,
    })
}

fn apply(snapshot: Snapshot, ctx: &mut SecureContext) -> Result<(), SecureError> {
    if snapshot.endpoint != ctx.config.endpoint || snapshot.transport != ctx.config.transport {
        return Err(SecureError::BadInputData("snapshot endpoint or transport differs"));
    }

    let peer_cert = snapshot
        .cert_der
        .as_deref()
        .map(PeerCertificate::from_der)
        .transpose()?;

    let transform = Transform::new(
        snapshot.transform_suite,
        snapshot.endpoint,
        snapshot.version.minor,
        snapshot.session_flags,
        &snapshot.key_block,
    )?;

    // Nothing below can fail
    ctx.handshake = None;
    ctx.version = snapshot.version;
    ctx.renego_status = snapshot.renego_status;
    ctx.secure_renegotiation = snapshot.secure_renegotiation;
    ctx.verify_data_len = snapshot.verify_data_len;
    ctx.own_verify_data = snapshot.own_verify_data;
    ctx.peer_verify_data = snapshot.peer_verify_data;
    ctx.in_epoch = snapshot.in_epoch;
    ctx.replay = snapshot.replay;
    ctx.badmac_seen = snapshot.badmac_seen;
    ctx.nb_zero = snapshot.nb_zero;
    ctx.client_auth = snapshot.client_auth;
    ctx.out_region = snapshot.out_region;
    ctx.in_region = snapshot.in_region;
    if snapshot.cli_id.is_some() {
        ctx.cli_id = snapshot.cli_id;
    }

    ctx.session = Some(SecureSession {
        ciphersuite: snapshot.ciphersuite,
        id: snapshot.session_id,
        master: snapshot.master,
        start_time: snapshot.start_time,
        compression: snapshot.compression,
        verify_result: snapshot.verify_result,
        flags: snapshot.session_flags,
        peer_cert,
        ticket: snapshot.ticket,
        ticket_lifetime: snapshot.ticket_lifetime,
    });
    ctx.transform = Some(transform);
    ctx.update_offsets();
    ctx.state = snapshot.state;
    Ok(())
}

/// Saves and restores secure contexts in a retention store
#[derive(Clone)]
pub struct SessionCodec {
    store: Arc<dyn RetentionStore>,
    enabled: bool,
}

impl std::fmt::Debug for SessionCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCodec")
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl SessionCodec {
    /// Create a codec; snapshots are refused when deep sleep is disabled
    pub fn new(store: Arc<dyn RetentionStore>, enabled: bool) -> Self {
        Self { store, enabled }
    }

    /// Whether snapshots are enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn RetentionStore> {
        &self.store
    }

    /// Whether a snapshot exists under `name`
    pub fn exists(&self, name: &str) -> bool {
        self.store.size_of(name).is_some()
    }

    /// Exact snapshot size for `ctx`
    pub fn size_of_snapshot(&self, ctx: &SecureContext) -> Result<usize, SecureError> {
        size_of_snapshot(ctx)
    }

    /// Save an established context under `name`
    pub fn save(&self, name: &str, ctx: &SecureContext) -> Result<SaveOutcome, SecureError> {
        if !self.enabled {
            return Err(SecureError::NotSupported);
        }
        validate_name(name)?;
        if ctx.state != HandshakeState::Established {
            return Err(SecureError::NotSuccessful);
        }

        let size = size_of_snapshot(ctx)?;
        let reused = match self.store.size_of(name) {
            Some(existing) if existing == size => true,
            Some(existing) => {
                debug!(
                    "Secure snapshot {} resized {} -> {} bytes",
                    name, existing, size
                );
                self.store.release(name)?;
                false
            }
            None => false,
        };
        if !reused {
            self.store.allocate(name, size)?;
        }

        // Encode against the blob actually handed out; an overflow drops it
        let blob_len = self.store.size_of(name).unwrap_or(0);
        let bytes = match encode(ctx, blob_len) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Secure snapshot {} does not fit its blob: {}", name, e);
                let _ = self.store.release(name);
                return Err(e);
            }
        };
        if reused && self.matches_stored(name, &bytes) {
            debug!("Secure snapshot {} unchanged", name);
            return Ok(SaveOutcome::Unchanged);
        }

        if let Err(e) = self.store.write(name, 0, &bytes) {
            warn!("Failed to write secure snapshot {}: {}", name, e);
            let _ = self.store.release(name);
            return Err(e.into());
        }

        debug!("Secure snapshot {} saved ({} bytes)", name, size);
        Ok(SaveOutcome::Written)
    }

    /// Compare header regions and checksum with the stored snapshot
    fn matches_stored(&self, name: &str, bytes: &[u8]) -> bool {
        let regions = &bytes[REGION_OFFSET..REGION_OFFSET + REGIONS_LEN];
        let crc = &bytes[bytes.len() - TRAILER_LEN..];
        let stored_regions = self.store.read(name, REGION_OFFSET, REGIONS_LEN);
        let stored_crc = self
            .store
            .read(name, bytes.len() - TRAILER_LEN, TRAILER_LEN);
        matches!((stored_regions, stored_crc), (Ok(r), Ok(c)) if r == regions && c == crc)
    }

    /// Restore the snapshot `name` into a freshly set-up context.
    ///
    /// A missing snapshot leaves `ctx` untouched. Any other failure leaves `ctx` invalid.
    pub fn restore(&self, name: &str, ctx: &mut SecureContext) -> Result<(), SecureError> {
        if !self.enabled {
            return Err(SecureError::NotSupported);
        }
        if !ctx.is_fresh() {
            return Err(SecureError::NotFresh);
        }
        let bytes = self
            .store
            .get(name)
            .ok_or_else(|| SecureError::NotFound(name.to_string()))?;

        match decode(&bytes).and_then(|snapshot| apply(snapshot, ctx)) {
            Ok(()) => {
                info!("Secure session restored from {}", name);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to restore secure session {}: {}", name, e);
                ctx.invalidate();
                Err(e)
            }
        }
    }

    /// Release the snapshot `name`; missing snapshots are fine
    pub fn clear(&self, name: &str) -> Result<(), SecureError> {
        if self.store.size_of(name).is_none() {
            return Ok(());
        }
        self.store.release(name)?;
        debug!("Secure snapshot {} cleared", name);
        Ok(())
    }
}
