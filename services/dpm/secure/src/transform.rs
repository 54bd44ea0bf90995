//! Record protection state derived from a negotiated key block.
//!
//! A [`Transform`] is rebuilt from three inputs only: the cipher suite id, the endpoint role
//! and the raw key block. The key block is split into MAC keys, cipher keys and IVs following
//! the TLS 1.2 key expansion order; the client writes with the first half of each pair and
//! the server with the second, so the two roles mirror each other.

use crate::suite::{self, CipherAlg, CipherMode, CipherSuite, MacAlg};
use crate::SecureError;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockCipher, BlockDecryptMut, BlockEncryptMut, InnerIvInit, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use hmac::{Hmac, Mac};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha384};
use std::fmt;
use subtle::{Choice, ConditionallySelectable, ConstantTimeEq, ConstantTimeLess};
use zeroize::Zeroizing;

/// Length of the key block every transform is built from
pub const KEY_BLOCK_LEN: usize = 256;
/// MAC length when truncated HMAC is negotiated
pub const TRUNCATED_MAC_LEN: usize = 10;
/// GCM explicit nonce length
pub const GCM_EXPLICIT_IV_LEN: usize = 8;
/// AEAD tag length
pub const AEAD_TAG_LEN: usize = 16;

/// Role of the local side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endpoint {
    /// Connecting side
    Client,
    /// Accepting side
    Server,
}

/// Negotiated record-protection extensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransformFlags {
    /// Encrypt-then-MAC (RFC 7366)
    pub encrypt_then_mac: bool,
    /// Truncated HMAC (RFC 6066)
    pub truncated_hmac: bool,
}

/// Lengths derived from the suite, version and flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformParams {
    /// Cipher key length
    pub keylen: usize,
    /// MAC key length
    pub mac_keylen: usize,
    /// MAC output length (zero for AEAD)
    pub maclen: usize,
    /// IV length
    pub ivlen: usize,
    /// Implicit part of the IV taken from the key block
    pub fixed_ivlen: usize,
    /// Smallest valid protected record body
    pub minlen: usize,
}

impl TransformParams {
    /// Derive lengths for `suite` at protocol minor version `minor`
    pub fn derive(
        suite: &CipherSuite,
        minor: u8,
        flags: TransformFlags,
    ) -> Result<Self, SecureError> {
        if minor < 2 {
            return Err(SecureError::UnsupportedVersion { major: 3, minor });
        }

        let keylen = suite.key_len();
        let ivlen = suite.iv_len();

        let params = match suite.mode {
            CipherMode::Gcm => Self {
                keylen,
                mac_keylen: 0,
                maclen: 0,
                ivlen,
                fixed_ivlen: 4,
                minlen: GCM_EXPLICIT_IV_LEN + AEAD_TAG_LEN,
            },
            CipherMode::ChaChaPoly => Self {
                keylen,
                mac_keylen: 0,
                maclen: 0,
                ivlen,
                fixed_ivlen: 12,
                minlen: AEAD_TAG_LEN,
            },
            CipherMode::Stream | CipherMode::Cbc => {
                let mac_keylen = suite.mac.size();
                let maclen = if flags.truncated_hmac {
                    TRUNCATED_MAC_LEN
                } else {
                    mac_keylen
                };
                let minlen = if suite.mode == CipherMode::Stream {
                    maclen
                } else {
                    let block = suite.block_len();
                    let base = if flags.encrypt_then_mac {
                        maclen + block
                    } else {
                        maclen + block - maclen % block
                    };
                    // Explicit per-record IV
                    base + ivlen
                };
                Self {
                    keylen,
                    mac_keylen,
                    maclen,
                    ivlen,
                    fixed_ivlen: 0,
                    minlen,
                }
            }
        };

        if suite.mode == CipherMode::Gcm && minor != 3 {
            return Err(SecureError::UnsupportedVersion { major: 3, minor });
        }
        Ok(params)
    }

    /// Bytes of IV copied from the key block per direction
    pub fn iv_copy_len(&self) -> usize {
        if self.fixed_ivlen != 0 {
            self.fixed_ivlen
        } else {
            self.ivlen
        }
    }

    /// Explicit IV carried in each record
    pub fn explicit_ivlen(&self) -> usize {
        self.ivlen - self.fixed_ivlen
    }

    /// Bytes of the key block consumed
    pub fn key_material_len(&self) -> usize {
        2 * (self.mac_keylen + self.keylen + self.iv_copy_len())
    }
}

enum CipherInstance {
    Null,
    Aes128Cbc(aes::Aes128),
    Aes256Cbc(aes::Aes256),
    Aes128Gcm(Box<Aes128Gcm>),
    Aes256Gcm(Box<Aes256Gcm>),
    ChaChaPoly(Box<ChaCha20Poly1305>),
}

impl CipherInstance {
    fn new(suite: &CipherSuite, key: &[u8]) -> Result<Self, SecureError> {
        let instance = match (suite.cipher, suite.mode) {
            (CipherAlg::Null, CipherMode::Stream) => CipherInstance::Null,
            (CipherAlg::Aes128, CipherMode::Cbc) => CipherInstance::Aes128Cbc(
                aes::Aes128::new_from_slice(key).map_err(|_| SecureError::Crypto)?,
            ),
            (CipherAlg::Aes256, CipherMode::Cbc) => CipherInstance::Aes256Cbc(
                aes::Aes256::new_from_slice(key).map_err(|_| SecureError::Crypto)?,
            ),
            (CipherAlg::Aes128, CipherMode::Gcm) => CipherInstance::Aes128Gcm(Box::new(
                Aes128Gcm::new_from_slice(key).map_err(|_| SecureError::Crypto)?,
            )),
            (CipherAlg::Aes256, CipherMode::Gcm) => CipherInstance::Aes256Gcm(Box::new(
                Aes256Gcm::new_from_slice(key).map_err(|_| SecureError::Crypto)?,
            )),
            (CipherAlg::ChaCha20, CipherMode::ChaChaPoly) => CipherInstance::ChaChaPoly(
                Box::new(ChaCha20Poly1305::new_from_slice(key).map_err(|_| SecureError::Crypto)?),
            ),
            _ => return Err(SecureError::UnknownCipherSuite(suite.id)),
        };
        Ok(instance)
    }

    fn cbc_encrypt(&self, iv: &[u8], buf: &mut [u8]) -> Result<(), SecureError> {
        match self {
            CipherInstance::Aes128Cbc(c) => cbc_encrypt(c, iv, buf),
            CipherInstance::Aes256Cbc(c) => cbc_encrypt(c, iv, buf),
            _ => Err(SecureError::Crypto),
        }
    }

    fn cbc_decrypt(&self, iv: &[u8], buf: &mut [u8]) -> Result<(), SecureError> {
        match self {
            CipherInstance::Aes128Cbc(c) => cbc_decrypt(c, iv, buf),
            CipherInstance::Aes256Cbc(c) => cbc_decrypt(c, iv, buf),
            _ => Err(SecureError::Crypto),
        }
    }

    fn seal(&self, nonce: &[u8], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>, SecureError> {
        let nonce = GenericArray::from_slice(nonce);
        let payload = Payload { msg, aad };
        let sealed = match self {
            CipherInstance::Aes128Gcm(c) => c.encrypt(nonce, payload),
            CipherInstance::Aes256Gcm(c) => c.encrypt(nonce, payload),
            CipherInstance::ChaChaPoly(c) => c.encrypt(nonce, payload),
            _ => return Err(SecureError::Crypto),
        };
        sealed.map_err(|_| SecureError::Crypto)
    }

    fn open(&self, nonce: &[u8], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>, SecureError> {
        let nonce = GenericArray::from_slice(nonce);
        let payload = Payload { msg, aad };
        let opened = match self {
            CipherInstance::Aes128Gcm(c) => c.decrypt(nonce, payload),
            CipherInstance::Aes256Gcm(c) => c.decrypt(nonce, payload),
            CipherInstance::ChaChaPoly(c) => c.decrypt(nonce, payload),
            _ => return Err(SecureError::Crypto),
        };
        opened.map_err(|_| SecureError::BadMac)
    }
}

fn cbc_encrypt<C>(cipher: &C, iv: &[u8], buf: &mut [u8]) -> Result<(), SecureError>
where
    C: BlockEncryptMut + BlockCipher + Clone,
{
    let len = buf.len();
    cbc::Encryptor::<C>::inner_iv_slice_init(cipher.clone(), iv)
        .map_err(|_| SecureError::Crypto)?
        .encrypt_padded_mut::<NoPadding>(buf, len)
        .map_err(|_| SecureError::Crypto)?;
    Ok(())
}

fn cbc_decrypt<C>(cipher: &C, iv: &[u8], buf: &mut [u8]) -> Result<(), SecureError>
where
    C: BlockDecryptMut + BlockCipher + Clone,
{
    cbc::Decryptor::<C>::inner_iv_slice_init(cipher.clone(), iv)
        .map_err(|_| SecureError::Crypto)?
        .decrypt_padded_mut::<NoPadding>(buf)
        .map_err(|_| SecureError::BadMac)?;
    Ok(())
}

#[derive(Clone)]
enum MacInstance {
    Sha256(Hmac<Sha256>),
    Sha384(Hmac<Sha384>),
}

impl MacInstance {
    fn new(alg: MacAlg, key: &[u8]) -> Result<Self, SecureError> {
        Ok(match alg {
            MacAlg::Sha256 => MacInstance::Sha256(
                <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|_| SecureError::Crypto)?,
            ),
            MacAlg::Sha384 => MacInstance::Sha384(
                <Hmac<Sha384> as Mac>::new_from_slice(key).map_err(|_| SecureError::Crypto)?,
            ),
        })
    }

    fn compute(&self, parts: &[&[u8]], len: usize) -> Vec<u8> {
        let mut tag = match self.clone() {
            MacInstance::Sha256(mut m) => {
                parts.iter().for_each(|p| m.update(p));
                m.finalize().into_bytes().to_vec()
            }
            MacInstance::Sha384(mut m) => {
                parts.iter().for_each(|p| m.update(p));
                m.finalize().into_bytes().to_vec()
            }
        };
        tag.truncate(len);
        tag
    }

    fn verify(&self, parts: &[&[u8]], tag: &[u8]) -> Result<(), SecureError> {
        let result = match self.clone() {
            MacInstance::Sha256(mut m) => {
                parts.iter().for_each(|p| m.update(p));
                m.verify_truncated_left(tag)
            }
            MacInstance::Sha384(mut m) => {
                parts.iter().for_each(|p| m.update(p));
                m.verify_truncated_left(tag)
            }
        };
        result.map_err(|_| SecureError::BadMac)
    }
}

fn pseudo_header(seq: u64, content_type: u8, version: [u8; 2], len: usize) -> [u8; 13] {
    let mut header = [0u8; 13];
    header[..8].copy_from_slice(&seq.to_be_bytes());
    header[8] = content_type;
    header[9..11].copy_from_slice(&version);
    header[11..13].copy_from_slice(&(len as u16).to_be_bytes());
    header
}

/// Live record protection for one connection
pub struct Transform {
    suite: &'static CipherSuite,
    endpoint: Endpoint,
    minor: u8,
    flags: TransformFlags,
    params: TransformParams,
    key_block: Zeroizing<Vec<u8>>,
    iv_enc: Zeroizing<Vec<u8>>,
    iv_dec: Zeroizing<Vec<u8>>,
    cipher_enc: CipherInstance,
    cipher_dec: CipherInstance,
    mac_enc: Option<MacInstance>,
    mac_dec: Option<MacInstance>,
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transform")
            .field("suite", &self.suite.name)
            .field("endpoint", &self.endpoint)
            .field("minor", &self.minor)
            .field("flags", &self.flags)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl Transform {
    /// Build a transform from a suite id and a raw key block
    pub fn new(
        suite_id: u16,
        endpoint: Endpoint,
        minor: u8,
        flags: TransformFlags,
        key_block: &[u8],
    ) -> Result<Self, SecureError> {
        let suite = suite::lookup(suite_id).ok_or(SecureError::UnknownCipherSuite(suite_id))?;
        if key_block.len() != KEY_BLOCK_LEN {
            return Err(SecureError::BadInputData("key block length"));
        }

        let params = TransformParams::derive(suite, minor, flags)?;
        if params.key_material_len() > KEY_BLOCK_LEN {
            return Err(SecureError::BadInputData("key block too short for suite"));
        }

        let m = params.mac_keylen;
        let k = params.keylen;
        let v = params.iv_copy_len();

        let mac_a = &key_block[..m];
        let mac_b = &key_block[m..2 * m];
        let key_a = &key_block[2 * m..2 * m + k];
        let key_b = &key_block[2 * m + k..2 * m + 2 * k];
        let iv_a = &key_block[2 * m + 2 * k..2 * m + 2 * k + v];
        let iv_b = &key_block[2 * m + 2 * k + v..2 * m + 2 * k + 2 * v];

        let ((mac_enc, mac_dec), (key_enc, key_dec), (iv_enc, iv_dec)) = match endpoint {
            Endpoint::Client => ((mac_a, mac_b), (key_a, key_b), (iv_a, iv_b)),
            Endpoint::Server => ((mac_b, mac_a), (key_b, key_a), (iv_b, iv_a)),
        };

        let (mac_enc, mac_dec) = if params.maclen == 0 {
            (None, None)
        } else {
            (
                Some(MacInstance::new(suite.mac, mac_enc)?),
                Some(MacInstance::new(suite.mac, mac_dec)?),
            )
        };

        Ok(Self {
            suite,
            endpoint,
            minor,
            flags,
            params,
            key_block: Zeroizing::new(key_block.to_vec()),
            iv_enc: Zeroizing::new(iv_enc.to_vec()),
            iv_dec: Zeroizing::new(iv_dec.to_vec()),
            cipher_enc: CipherInstance::new(suite, key_enc)?,
            cipher_dec: CipherInstance::new(suite, key_dec)?,
            mac_enc,
            mac_dec,
        })
    }

    /// Negotiated suite
    pub fn suite(&self) -> &'static CipherSuite {
        self.suite
    }

    /// Local role
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Derived lengths
    pub fn params(&self) -> &TransformParams {
        &self.params
    }

    /// Negotiated extensions
    pub fn flags(&self) -> TransformFlags {
        self.flags
    }

    /// Raw key block the transform was built from
    pub fn key_block(&self) -> &[u8] {
        &self.key_block
    }

    /// Worst-case expansion of a record body
    pub fn max_overhead(&self) -> usize {
        match self.suite.mode {
            CipherMode::Gcm => GCM_EXPLICIT_IV_LEN + AEAD_TAG_LEN,
            CipherMode::ChaChaPoly => AEAD_TAG_LEN,
            CipherMode::Stream => self.params.maclen,
            CipherMode::Cbc => self.params.ivlen + self.params.maclen + self.suite.block_len(),
        }
    }

    /// Protect one record body
    pub fn encrypt<R: RngCore + CryptoRng>(
        &self,
        seq: u64,
        content_type: u8,
        version: [u8; 2],
        plaintext: &[u8],
        rng: &mut R,
    ) -> Result<Vec<u8>, SecureError> {
        match self.suite.mode {
            CipherMode::Stream => {
                let mac = self.mac_enc.as_ref().ok_or(SecureError::Crypto)?;
                let header = pseudo_header(seq, content_type, version, plaintext.len());
                let tag = mac.compute(&[&header, plaintext], self.params.maclen);
                let mut out = Vec::with_capacity(plaintext.len() + tag.len());
                out.extend_from_slice(plaintext);
                out.extend_from_slice(&tag);
                Ok(out)
            }
            CipherMode::Cbc => self.encrypt_cbc(seq, content_type, version, plaintext, rng),
            CipherMode::Gcm => {
                let explicit = seq.to_be_bytes();
                let mut nonce = [0u8; 12];
                nonce[..4].copy_from_slice(&self.iv_enc[..4]);
                nonce[4..].copy_from_slice(&explicit);
                let aad = pseudo_header(seq, content_type, version, plaintext.len());
                let sealed = self.cipher_enc.seal(&nonce, plaintext, &aad)?;
                let mut out = Vec::with_capacity(GCM_EXPLICIT_IV_LEN + sealed.len());
                out.extend_from_slice(&explicit);
                out.extend_from_slice(&sealed);
                Ok(out)
            }
            CipherMode::ChaChaPoly => {
                let nonce = Self::chacha_nonce(&self.iv_enc, seq);
                let aad = pseudo_header(seq, content_type, version, plaintext.len());
                self.cipher_enc.seal(&nonce, plaintext, &aad)
            }
        }
    }

    fn encrypt_cbc<R: RngCore + CryptoRng>(
        &self,
        seq: u64,
        content_type: u8,
        version: [u8; 2],
        plaintext: &[u8],
        rng: &mut R,
    ) -> Result<Vec<u8>, SecureError> {
        let mac = self.mac_enc.as_ref().ok_or(SecureError::Crypto)?;
        let block = self.suite.block_len();
        let ivlen = self.params.ivlen;

        let mut body = plaintext.to_vec();
        if !self.flags.encrypt_then_mac {
            let header = pseudo_header(seq, content_type, version, plaintext.len());
            body.extend_from_slice(&mac.compute(&[&header, plaintext], self.params.maclen));
        }

        let padlen = block - (body.len() + 1) % block;
        let padlen = if padlen == block { 0 } else { padlen };
        body.extend(std::iter::repeat(padlen as u8).take(padlen + 1));

        let mut iv = vec![0u8; ivlen];
        rng.fill_bytes(&mut iv);
        self.cipher_enc.cbc_encrypt(&iv, &mut body)?;

        let mut out = Vec::with_capacity(ivlen + body.len() + self.params.maclen);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&body);

        if self.flags.encrypt_then_mac {
            let header = pseudo_header(seq, content_type, version, out.len());
            let tag = mac.compute(&[&header, &out], self.params.maclen);
            out.extend_from_slice(&tag);
        }
        Ok(out)
    }

    /// Verify and unprotect one record body
    pub fn decrypt(
        &self,
        seq: u64,
        content_type: u8,
        version: [u8; 2],
        body: &[u8],
    ) -> Result<Vec<u8>, SecureError> {
        if body.len() < self.params.minlen {
            return Err(SecureError::BadMac);
        }
        match self.suite.mode {
            CipherMode::Stream => {
                let mac = self.mac_dec.as_ref().ok_or(SecureError::Crypto)?;
                let (plaintext, tag) = body.split_at(body.len() - self.params.maclen);
                let header = pseudo_header(seq, content_type, version, plaintext.len());
                mac.verify(&[&header, plaintext], tag)?;
                Ok(plaintext.to_vec())
            }
            CipherMode::Cbc => self.decrypt_cbc(seq, content_type, version, body),
            CipherMode::Gcm => {
                let (explicit, sealed) = body.split_at(GCM_EXPLICIT_IV_LEN);
                let mut nonce = [0u8; 12];
                nonce[..4].copy_from_slice(&self.iv_dec[..4]);
                nonce[4..].copy_from_slice(explicit);
                let aad =
                    pseudo_header(seq, content_type, version, sealed.len() - AEAD_TAG_LEN);
                self.cipher_dec.open(&nonce, sealed, &aad)
            }
            CipherMode::ChaChaPoly => {
                let nonce = Self::chacha_nonce(&self.iv_dec, seq);
                let aad = pseudo_header(seq, content_type, version, body.len() - AEAD_TAG_LEN);
                self.cipher_dec.open(&nonce, body, &aad)
            }
        }
    }

    fn decrypt_cbc(
        &self,
        seq: u64,
        content_type: u8,
        version: [u8; 2],
        body: &[u8],
    ) -> Result<Vec<u8>, SecureError> {
        let mac = self.mac_dec.as_ref().ok_or(SecureError::Crypto)?;
        let block = self.suite.block_len();
        let ivlen = self.params.ivlen;
        let maclen = self.params.maclen;

        let protected = if self.flags.encrypt_then_mac {
            let (protected, tag) = body.split_at(body.len() - maclen);
            let header = pseudo_header(seq, content_type, version, protected.len());
            mac.verify(&[&header, protected], tag)?;
            protected
        } else {
            body
        };

        let (iv, ciphertext) = protected.split_at(ivlen);
        if ciphertext.is_empty() || ciphertext.len() % block != 0 {
            return Err(SecureError::BadMac);
        }
        let mut data = ciphertext.to_vec();
        self.cipher_dec.cbc_decrypt(iv, &mut data)?;

        if !self.flags.encrypt_then_mac {
            return Self::open_mac_then_encrypt(mac, maclen, seq, content_type, version, data);
        }

        // Already authenticated, so padding errors leak nothing
        let padlen = data[data.len() - 1] as usize;
        if padlen + 1 > data.len() {
            return Err(SecureError::BadMac);
        }
        let pad_start = data.len() - padlen - 1;
        if data[pad_start..].iter().any(|&b| b as usize != padlen) {
            return Err(SecureError::BadMac);
        }
        data.truncate(pad_start);
        Ok(data)
    }

    /// Strip padding and MAC of a decrypted mac-then-encrypt record.
    ///
    /// The work does not depend on the pad length: the pad is checked over a fixed window
    /// and the digest always spans the longest possible content. A bad pad and a bad tag
    /// both end in [`SecureError::BadMac`].
    fn open_mac_then_encrypt(
        mac: &MacInstance,
        maclen: usize,
        seq: u64,
        content_type: u8,
        version: [u8; 2],
        mut data: Vec<u8>,
    ) -> Result<Vec<u8>, SecureError> {
        let len = data.len();
        if len < maclen + 1 {
            return Err(SecureError::BadMac);
        }

        let claimed = u64::from(data[len - 1]);
        let fits = (claimed + maclen as u64).ct_lt(&(len as u64));
        let padlen = u64::conditional_select(&0, &claimed, fits);
        let mut good = fits;
        for i in 0..len.min(256) {
            let in_pad = (i as u64).ct_lt(&(padlen + 1));
            let matches = u64::from(data[len - 1 - i]).ct_eq(&padlen);
            good &= !in_pad | matches;
        }

        let max_content = len - maclen - 1;
        let content_len = max_content - padlen as usize;
        let mut tag = vec![0u8; maclen];
        for offset in max_content.saturating_sub(255)..=max_content {
            let hit = (offset as u64).ct_eq(&(content_len as u64));
            for (j, byte) in tag.iter_mut().enumerate() {
                byte.conditional_assign(&data[offset + j], hit);
            }
        }

        let header = pseudo_header(seq, content_type, version, content_len);
        let expected = mac.compute(&[&header, &data[..content_len]], maclen);
        // Hash what the padding hid so the digest work does not depend on padlen
        std::hint::black_box(mac.compute(&[&data[content_len..max_content]], maclen));

        let good: Choice = good & expected.as_slice().ct_eq(tag.as_slice());
        if !bool::from(good) {
            return Err(SecureError::BadMac);
        }
        data.truncate(content_len);
        Ok(data)
    }

    fn chacha_nonce(iv: &[u8], seq: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&iv[..12]);
        for (n, s) in nonce[4..].iter_mut().zip(seq.to_be_bytes()) {
            *n ^= s;
        }
        nonce
    }
}
