//! Cipher suites known to this build.

use std::fmt;

/// Bulk cipher
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherAlg {
    /// No encryption
    Null,
    /// AES with a 128-bit key
    Aes128,
    /// AES with a 256-bit key
    Aes256,
    /// ChaCha20
    ChaCha20,
}

/// Record protection mode
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherMode {
    /// Stream cipher (only the null cipher here)
    Stream,
    /// Block cipher in CBC mode with HMAC
    Cbc,
    /// AES-GCM
    Gcm,
    /// ChaCha20-Poly1305
    ChaChaPoly,
}

/// Hash used for the record MAC and the PRF
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MacAlg {
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
}

impl MacAlg {
    /// Digest size in bytes
    pub fn size(self) -> usize {
        match self {
            MacAlg::Sha256 => 32,
            MacAlg::Sha384 => 48,
        }
    }
}

/// A TLS 1.2 cipher suite
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CipherSuite {
    /// IANA identifier
    pub id: u16,
    /// IANA name
    pub name: &'static str,
    /// Bulk cipher
    pub cipher: CipherAlg,
    /// Protection mode
    pub mode: CipherMode,
    /// MAC / PRF hash
    pub mac: MacAlg,
}

impl CipherSuite {
    /// Cipher key length in bytes
    pub fn key_len(&self) -> usize {
        match self.cipher {
            CipherAlg::Null => 0,
            CipherAlg::Aes128 => 16,
            CipherAlg::Aes256 | CipherAlg::ChaCha20 => 32,
        }
    }

    /// Cipher IV length in bytes
    pub fn iv_len(&self) -> usize {
        match self.mode {
            CipherMode::Stream => 0,
            CipherMode::Cbc => 16,
            CipherMode::Gcm | CipherMode::ChaChaPoly => 12,
        }
    }

    /// Cipher block length in bytes
    pub fn block_len(&self) -> usize {
        match self.mode {
            CipherMode::Cbc => 16,
            _ => 1,
        }
    }

    /// Authenticated encryption suites carry no separate MAC
    pub fn is_aead(&self) -> bool {
        matches!(self.mode, CipherMode::Gcm | CipherMode::ChaChaPoly)
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:04x})", self.name, self.id)
    }
}

const fn suite(
    id: u16,
    name: &'static str,
    cipher: CipherAlg,
    mode: CipherMode,
    mac: MacAlg,
) -> CipherSuite {
    CipherSuite {
        id,
        name,
        cipher,
        mode,
        mac,
    }
}

use CipherAlg::*;
use CipherMode::*;
use MacAlg::*;

static CIPHER_SUITES: &[CipherSuite] = &[
    suite(0x003B, "TLS-RSA-WITH-NULL-SHA256", Null, Stream, Sha256),
    suite(0x00B0, "TLS-PSK-WITH-NULL-SHA256", Null, Stream, Sha256),
    suite(0x003C, "TLS-RSA-WITH-AES-128-CBC-SHA256", Aes128, Cbc, Sha256),
    suite(0x003D, "TLS-RSA-WITH-AES-256-CBC-SHA256", Aes256, Cbc, Sha256),
    suite(0x00AE, "TLS-PSK-WITH-AES-128-CBC-SHA256", Aes128, Cbc, Sha256),
    suite(0xC023, "TLS-ECDHE-ECDSA-WITH-AES-128-CBC-SHA256", Aes128, Cbc, Sha256),
    suite(0xC024, "TLS-ECDHE-ECDSA-WITH-AES-256-CBC-SHA384", Aes256, Cbc, Sha384),
    suite(0xC027, "TLS-ECDHE-RSA-WITH-AES-128-CBC-SHA256", Aes128, Cbc, Sha256),
    suite(0xC028, "TLS-ECDHE-RSA-WITH-AES-256-CBC-SHA384", Aes256, Cbc, Sha384),
    suite(0x009C, "TLS-RSA-WITH-AES-128-GCM-SHA256", Aes128, Gcm, Sha256),
    suite(0x009D, "TLS-RSA-WITH-AES-256-GCM-SHA384", Aes256, Gcm, Sha384),
    suite(0x00A8, "TLS-PSK-WITH-AES-128-GCM-SHA256", Aes128, Gcm, Sha256),
    suite(0x00A9, "TLS-PSK-WITH-AES-256-GCM-SHA384", Aes256, Gcm, Sha384),
    suite(0xC02B, "TLS-ECDHE-ECDSA-WITH-AES-128-GCM-SHA256", Aes128, Gcm, Sha256),
    suite(0xC02C, "TLS-ECDHE-ECDSA-WITH-AES-256-GCM-SHA384", Aes256, Gcm, Sha384),
    suite(0xC02F, "TLS-ECDHE-RSA-WITH-AES-128-GCM-SHA256", Aes128, Gcm, Sha256),
    suite(0xC030, "TLS-ECDHE-RSA-WITH-AES-256-GCM-SHA384", Aes256, Gcm, Sha384),
    suite(0xCCA8, "TLS-ECDHE-RSA-WITH-CHACHA20-POLY1305-SHA256", ChaCha20, ChaChaPoly, Sha256),
    suite(0xCCA9, "TLS-ECDHE-ECDSA-WITH-CHACHA20-POLY1305-SHA256", ChaCha20, ChaChaPoly, Sha256),
    suite(0xCCAB, "TLS-PSK-WITH-CHACHA20-POLY1305-SHA256", ChaCha20, ChaChaPoly, Sha256),
];

/// Look up a suite by IANA id
pub fn lookup(id: u16) -> Option<&'static CipherSuite> {
    CIPHER_SUITES.iter().find(|suite| suite.id == id)
}

/// All suites, in preference order
pub fn all() -> &'static [CipherSuite] {
    CIPHER_SUITES
}
