//! Peer certificate kept with a session.

use crate::SecureError;
use x509_parser::prelude::*;

/// Parsed peer certificate together with its DER encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificate {
    der: Vec<u8>,
    subject: String,
    issuer: String,
    serial: String,
    not_after: i64,
}

impl PeerCertificate {
    /// Parse a DER certificate; trailing bytes are rejected
    pub fn from_der(der: &[u8]) -> Result<Self, SecureError> {
        let (rest, cert) =
            parse_x509_certificate(der).map_err(|e| SecureError::CertParse(e.to_string()))?;
        if !rest.is_empty() {
            return Err(SecureError::CertParse(format!(
                "{} trailing bytes after certificate",
                rest.len()
            )));
        }

        Ok(Self {
            der: der.to_vec(),
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            serial: cert.raw_serial_as_string(),
            not_after: cert.validity().not_after.timestamp(),
        })
    }

    /// DER bytes
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Subject distinguished name
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Issuer distinguished name
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Serial number as colon-separated hex
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Expiry as a Unix timestamp
    pub fn not_after(&self) -> i64 {
        self.not_after
    }
}
