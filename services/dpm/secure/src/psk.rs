//! Pre-shared-key handshake.
//!
//! A compact TLS 1.2 style PSK exchange that runs over the record layer of a
//! [`SecureContext`]:
//!
//! ```text
//! client                                   server
//!   ClientHello(suite, identity, random) -->
//!                                       <-- ServerHello(suite, random)
//!   Finished (protected)               -->
//!                                       <-- Finished (protected)
//! ```
//!
//! The master secret and key block come from the TLS 1.2 PRF over the
//! RFC 4279 premaster secret, so both sides install the same [`Transform`](crate::Transform)
//! without any certificate handling.

use crate::context::{SecureContext, SecureSession, MASTER_SECRET_LEN, VERIFY_DATA_LEN};
use crate::prf::tls12_prf;
use crate::record::{ContentType, ProtocolVersion};
use crate::suite::{self, MacAlg};
use crate::transform::{Endpoint, KEY_BLOCK_LEN};
use crate::SecureError;
use bytes::{Buf, BufMut, BytesMut};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256, Sha384};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use zeroize::Zeroizing;

const MSG_CLIENT_HELLO: u8 = 1;
const MSG_SERVER_HELLO: u8 = 2;
const MSG_FINISHED: u8 = 20;
const RANDOM_LEN: usize = 32;
const MSG_HEADER_LEN: usize = 3;

/// Longest PSK identity
pub const MAX_IDENTITY_LEN: usize = 255;

/// Keys derived from one exchange
struct Derived {
    master: [u8; MASTER_SECRET_LEN],
    key_block: Zeroizing<[u8; KEY_BLOCK_LEN]>,
    client_verify: [u8; VERIFY_DATA_LEN],
    server_verify: [u8; VERIFY_DATA_LEN],
}

/// PSK handshake parameters shared by both ends
#[derive(Clone)]
pub struct PskHandshake {
    identity: Vec<u8>,
    psk: Zeroizing<Vec<u8>>,
    suite: u16,
}

impl std::fmt::Debug for PskHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PskHandshake")
            .field("identity", &String::from_utf8_lossy(&self.identity))
            .field("suite", &format_args!("0x{:04x}", self.suite))
            .finish_non_exhaustive()
    }
}

impl PskHandshake {
    /// Handshake using `identity` and `psk` with cipher suite `suite`
    pub fn new(identity: impl Into<Vec<u8>>, psk: &[u8], suite: u16) -> Result<Self, SecureError> {
        let identity = identity.into();
        if identity.is_empty() || identity.len() > MAX_IDENTITY_LEN {
            return Err(SecureError::BadInputData("PSK identity length"));
        }
        if psk.is_empty() {
            return Err(SecureError::BadInputData("empty PSK"));
        }
        if suite::lookup(suite).is_none() {
            return Err(SecureError::UnknownCipherSuite(suite));
        }
        Ok(Self {
            identity,
            psk: Zeroizing::new(psk.to_vec()),
            suite,
        })
    }

    /// Cipher suite id
    pub fn suite(&self) -> u16 {
        self.suite
    }

    /// PSK identity
    pub fn identity(&self) -> &[u8] {
        &self.identity
    }

    /// Client: start the handshake and return the ClientHello record
    pub fn client_hello<R: RngCore + CryptoRng>(
        &self,
        ctx: &mut SecureContext,
        rng: &mut R,
    ) -> Result<Vec<u8>, SecureError> {
        require_endpoint(ctx, Endpoint::Client)?;

        let mut body = BytesMut::with_capacity(3 + self.identity.len() + RANDOM_LEN);
        body.put_u16(self.suite);
        body.put_u8(self.identity.len() as u8);
        body.put_slice(&self.identity);
        let scratch = ctx.begin_handshake();
        rng.fill_bytes(&mut scratch.client_random);
        body.put_slice(&scratch.client_random);

        let msg = frame(MSG_CLIENT_HELLO, &body);
        scratch.transcript.clear();
        scratch.transcript.extend_from_slice(&msg);
        ctx.write_plain(ContentType::Handshake, &msg)
    }

    /// Server: consume the ClientHello record, install keys and return the ServerHello record
    pub fn server_respond<R: RngCore + CryptoRng>(
        &self,
        ctx: &mut SecureContext,
        client_hello: &[u8],
        rng: &mut R,
    ) -> Result<Vec<u8>, SecureError> {
        require_endpoint(ctx, Endpoint::Server)?;
        ctx.begin_handshake();

        let msg = self.read_message(ctx, client_hello, MSG_CLIENT_HELLO)?;
        let mut body = &msg[MSG_HEADER_LEN..];
        if body.remaining() < 3 {
            return fail(ctx, "short ClientHello");
        }
        let offered = body.get_u16();
        let identity_len = body.get_u8() as usize;
        if body.remaining() != identity_len + RANDOM_LEN {
            return fail(ctx, "malformed ClientHello");
        }
        let identity = &body[..identity_len];
        if offered != self.suite {
            return fail(ctx, "cipher suite not offered");
        }
        if identity != self.identity.as_slice() {
            warn!(
                "Unknown PSK identity {}",
                String::from_utf8_lossy(identity)
            );
            return fail(ctx, "unknown PSK identity");
        }
        body.advance(identity_len);

        let mut client_random = [0u8; RANDOM_LEN];
        body.copy_to_slice(&mut client_random);
        let mut server_random = [0u8; RANDOM_LEN];
        rng.fill_bytes(&mut server_random);

        let mut hello = BytesMut::with_capacity(2 + RANDOM_LEN);
        hello.put_u16(self.suite);
        hello.put_slice(&server_random);
        let reply = frame(MSG_SERVER_HELLO, &hello);

        let mut transcript = msg.clone();
        transcript.extend_from_slice(&reply);
        if let Some(scratch) = ctx.handshake_mut() {
            scratch.client_random = client_random;
            scratch.server_random = server_random;
            scratch.transcript = transcript.clone();
        }

        let record = ctx.write_plain(ContentType::Handshake, &reply)?;
        let keys = self.derive(&client_random, &server_random, &transcript)?;
        let session = self.session(keys.master, &server_random);
        ctx.establish(
            ProtocolVersion::TLS1_2,
            session,
            keys.key_block.as_slice(),
            keys.server_verify,
            keys.client_verify,
        )?;
        Ok(record)
    }

    /// Client: consume the ServerHello record, install keys and return the protected Finished record
    pub fn client_finish<R: RngCore + CryptoRng>(
        &self,
        ctx: &mut SecureContext,
        server_hello: &[u8],
        rng: &mut R,
    ) -> Result<Vec<u8>, SecureError> {
        require_endpoint(ctx, Endpoint::Client)?;

        let msg = self.read_message(ctx, server_hello, MSG_SERVER_HELLO)?;
        let mut body = &msg[MSG_HEADER_LEN..];
        if body.remaining() != 2 + RANDOM_LEN {
            return fail(ctx, "malformed ServerHello");
        }
        if body.get_u16() != self.suite {
            return fail(ctx, "server chose another cipher suite");
        }
        let mut server_random = [0u8; RANDOM_LEN];
        body.copy_to_slice(&mut server_random);

        let (client_random, transcript) = match ctx.handshake_mut() {
            Some(scratch) => {
                scratch.server_random = server_random;
                scratch.transcript.extend_from_slice(&msg);
                (scratch.client_random, scratch.transcript.clone())
            }
            None => return fail(ctx, "ServerHello without ClientHello"),
        };

        let keys = self.derive(&client_random, &server_random, &transcript)?;
        let session = self.session(keys.master, &server_random);
        ctx.establish(
            ProtocolVersion::TLS1_2,
            session,
            keys.key_block.as_slice(),
            keys.client_verify,
            keys.server_verify,
        )?;

        let finished = frame(MSG_FINISHED, &keys.client_verify);
        ctx.write_record(ContentType::Handshake, &finished, rng)
    }

    /// Server: verify the client Finished record and return the server Finished record
    pub fn server_finish<R: RngCore + CryptoRng>(
        &self,
        ctx: &mut SecureContext,
        client_finished: &[u8],
        rng: &mut R,
    ) -> Result<Vec<u8>, SecureError> {
        require_endpoint(ctx, Endpoint::Server)?;
        self.verify_finished(ctx, client_finished)?;
        let finished = frame(MSG_FINISHED, &ctx.own_verify_data);
        ctx.write_record(ContentType::Handshake, &finished, rng)
    }

    /// Client: verify the server Finished record
    pub fn client_verify(
        &self,
        ctx: &mut SecureContext,
        server_finished: &[u8],
    ) -> Result<(), SecureError> {
        require_endpoint(ctx, Endpoint::Client)?;
        self.verify_finished(ctx, server_finished)?;
        debug!(
            "PSK handshake complete identity={}",
            String::from_utf8_lossy(&self.identity)
        );
        Ok(())
    }

    fn verify_finished(&self, ctx: &mut SecureContext, record: &[u8]) -> Result<(), SecureError> {
        if !ctx.is_established() {
            return Err(SecureError::NotSuccessful);
        }
        let msg = match self.read_message(ctx, record, MSG_FINISHED) {
            Ok(msg) => msg,
            Err(e) => {
                ctx.invalidate();
                return Err(e);
            }
        };
        let received = &msg[MSG_HEADER_LEN..];
        if !constant_time_eq(received, &ctx.peer_verify_data) {
            return fail(ctx, "Finished verify data mismatch");
        }
        Ok(())
    }

    fn read_message(
        &self,
        ctx: &mut SecureContext,
        record: &[u8],
        expected: u8,
    ) -> Result<Vec<u8>, SecureError> {
        let record = ctx.read_record(record)?;
        if record.content_type != ContentType::Handshake {
            return fail(ctx, "expected a handshake record");
        }
        let msg = record.payload;
        if msg.len() < MSG_HEADER_LEN || msg[0] != expected {
            return fail(ctx, "unexpected handshake message");
        }
        let len = u16::from_be_bytes([msg[1], msg[2]]) as usize;
        if msg.len() != MSG_HEADER_LEN + len {
            return fail(ctx, "handshake message length");
        }
        Ok(msg)
    }

    fn mac(&self) -> MacAlg {
        suite::lookup(self.suite)
            .map(|s| s.mac)
            .unwrap_or(MacAlg::Sha256)
    }

    fn derive(
        &self,
        client_random: &[u8; RANDOM_LEN],
        server_random: &[u8; RANDOM_LEN],
        transcript: &[u8],
    ) -> Result<Derived, SecureError> {
        let mac = self.mac();

        // RFC 4279: len(psk) | zeros | len(psk) | psk
        let mut premaster = Zeroizing::new(Vec::with_capacity(4 + 2 * self.psk.len()));
        premaster.put_u16(self.psk.len() as u16);
        premaster.put_bytes(0, self.psk.len());
        premaster.put_u16(self.psk.len() as u16);
        premaster.put_slice(&self.psk);

        let mut seed = [0u8; 2 * RANDOM_LEN];
        seed[..RANDOM_LEN].copy_from_slice(client_random);
        seed[RANDOM_LEN..].copy_from_slice(server_random);
        let mut master = [0u8; MASTER_SECRET_LEN];
        tls12_prf(mac, &premaster, b"master secret", &seed, &mut master)?;

        seed[..RANDOM_LEN].copy_from_slice(server_random);
        seed[RANDOM_LEN..].copy_from_slice(client_random);
        let mut key_block = Zeroizing::new([0u8; KEY_BLOCK_LEN]);
        tls12_prf(mac, &master, b"key expansion", &seed, key_block.as_mut_slice())?;

        let mut client_verify = [0u8; VERIFY_DATA_LEN];
        tls12_prf(
            mac,
            &master,
            b"client finished",
            &transcript_hash(mac, transcript),
            &mut client_verify,
        )?;

        let mut with_finished = transcript.to_vec();
        with_finished.extend_from_slice(&frame(MSG_FINISHED, &client_verify));
        let mut server_verify = [0u8; VERIFY_DATA_LEN];
        tls12_prf(
            mac,
            &master,
            b"server finished",
            &transcript_hash(mac, &with_finished),
            &mut server_verify,
        )?;

        Ok(Derived {
            master,
            key_block,
            client_verify,
            server_verify,
        })
    }

    fn session(&self, master: [u8; MASTER_SECRET_LEN], server_random: &[u8]) -> SecureSession {
        let mut session = SecureSession::new(self.suite, master);
        session.id = server_random.to_vec();
        session.start_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        session
    }
}

fn require_endpoint(ctx: &SecureContext, endpoint: Endpoint) -> Result<(), SecureError> {
    if ctx.config().endpoint != endpoint {
        return Err(SecureError::BadInputData("handshake step for the other endpoint"));
    }
    Ok(())
}

fn fail<T>(ctx: &mut SecureContext, reason: &str) -> Result<T, SecureError> {
    ctx.invalidate();
    Err(SecureError::Handshake(reason.to_string()))
}

fn frame(msg_type: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(MSG_HEADER_LEN + body.len());
    out.put_u8(msg_type);
    out.put_u16(body.len() as u16);
    out.put_slice(body);
    out
}

fn transcript_hash(mac: MacAlg, transcript: &[u8]) -> Vec<u8> {
    match mac {
        MacAlg::Sha256 => Sha256::digest(transcript).to_vec(),
        MacAlg::Sha384 => Sha384::digest(transcript).to_vec(),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{HandshakeState, SecureConfig};
    use crate::record::Transport;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn contexts(transport: Transport) -> (SecureContext, SecureContext) {
        (
            SecureContext::new(SecureConfig {
                endpoint: Endpoint::Client,
                transport,
            }),
            SecureContext::new(SecureConfig {
                endpoint: Endpoint::Server,
                transport,
            }),
        )
    }

    fn run(
        client_side: &PskHandshake,
        server_side: &PskHandshake,
        transport: Transport,
    ) -> Result<(SecureContext, SecureContext), SecureError> {
        let mut rng = StdRng::seed_from_u64(11);
        let (mut client, mut server) = contexts(transport);
        let hello = client_side.client_hello(&mut client, &mut rng)?;
        let reply = server_side.server_respond(&mut server, &hello, &mut rng)?;
        let fin = client_side.client_finish(&mut client, &reply, &mut rng)?;
        let sfin = server_side.server_finish(&mut server, &fin, &mut rng)?;
        client_side.client_verify(&mut client, &sfin)?;
        Ok((client, server))
    }

    #[test]
    fn test_handshake_tls_and_dtls() {
        for suite in [0x00AE, 0xCCAB, 0x00A9, 0x003D] {
            let psk = PskHandshake::new("device-1", b"0123456789abcdef", suite).unwrap();
            for transport in [Transport::Stream, Transport::Datagram] {
                let (mut client, mut server) = run(&psk, &psk, transport).unwrap();
                assert_eq!(client.state(), HandshakeState::Established);
                assert_eq!(server.state(), HandshakeState::Established);

                let mut rng = StdRng::seed_from_u64(12);
                let wire = client
                    .write_record(ContentType::ApplicationData, b"ping", &mut rng)
                    .unwrap();
                assert_eq!(server.read_record(&wire).unwrap().payload, b"ping");
                let wire = server
                    .write_record(ContentType::ApplicationData, b"pong", &mut rng)
                    .unwrap();
                assert_eq!(client.read_record(&wire).unwrap().payload, b"pong");
            }
        }
    }

    #[test]
    fn test_wrong_key_rejected() {
        let client = PskHandshake::new("device-1", b"right key", 0xCCAB).unwrap();
        let server = PskHandshake::new("device-1", b"wrong key", 0xCCAB).unwrap();
        let err = run(&client, &server, Transport::Stream).unwrap_err();
        assert!(matches!(err, SecureError::BadMac | SecureError::Handshake(_)));
    }

    #[test]
    fn test_unknown_identity_invalidates_server() {
        let mut rng = StdRng::seed_from_u64(13);
        let client_side = PskHandshake::new("device-2", b"key", 0xCCAB).unwrap();
        let server_side = PskHandshake::new("device-1", b"key", 0xCCAB).unwrap();
        let (mut client, mut server) = contexts(Transport::Stream);

        let hello = client_side.client_hello(&mut client, &mut rng).unwrap();
        assert!(matches!(
            server_side.server_respond(&mut server, &hello, &mut rng),
            Err(SecureError::Handshake(_))
        ));
        assert_eq!(server.state(), HandshakeState::Invalid);
    }

    #[test]
    fn test_steps_checked_against_role() {
        let mut rng = StdRng::seed_from_u64(14);
        let psk = PskHandshake::new("device-1", b"key", 0xCCAB).unwrap();
        let (mut client, mut server) = contexts(Transport::Stream);
        assert!(psk.client_hello(&mut server, &mut rng).is_err());
        assert!(psk.server_respond(&mut client, &[], &mut rng).is_err());
    }

    #[test]
    fn test_new_validates_inputs() {
        assert!(PskHandshake::new("", b"key", 0xCCAB).is_err());
        assert!(PskHandshake::new("id", b"", 0xCCAB).is_err());
        assert!(matches!(
            PskHandshake::new("id", b"key", 0x1234),
            Err(SecureError::UnknownCipherSuite(0x1234))
        ));
        let debug = format!("{:?}", PskHandshake::new("id", b"secret", 0xCCAB).unwrap());
        assert!(!debug.contains("secret"));
    }
}
