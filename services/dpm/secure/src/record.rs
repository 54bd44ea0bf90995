//! Record-layer framing: content types, versions, headers and the DTLS replay window.

use crate::SecureError;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// TLS record header length
pub const TLS_HEADER_LEN: usize = 5;
/// DTLS record header length
pub const DTLS_HEADER_LEN: usize = 13;
/// Size of a saved header region (counter and header)
pub const HEADER_REGION_LEN: usize = 13;
/// Largest plaintext fragment
pub const MAX_PLAINTEXT_LEN: usize = 16384;
/// Largest protected record body
pub const MAX_RECORD_BODY_LEN: usize = MAX_PLAINTEXT_LEN + 2048;
/// DTLS replay window width in records
pub const REPLAY_WINDOW_BITS: u64 = 64;

const SEQ_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Record content type
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// ChangeCipherSpec
    ChangeCipherSpec = 20,
    /// Alert
    Alert = 21,
    /// Handshake
    Handshake = 22,
    /// Application data
    ApplicationData = 23,
}

impl TryFrom<u8> for ContentType {
    type Error = SecureError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            20 => Ok(ContentType::ChangeCipherSpec),
            21 => Ok(ContentType::Alert),
            22 => Ok(ContentType::Handshake),
            23 => Ok(ContentType::ApplicationData),
            _ => Err(SecureError::BadInputData("unknown record content type")),
        }
    }
}

/// Transport the record layer runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transport {
    /// TLS over TCP
    Stream,
    /// DTLS over UDP
    Datagram,
}

impl Transport {
    /// Record header length
    pub fn header_len(self) -> usize {
        match self {
            Transport::Stream => TLS_HEADER_LEN,
            Transport::Datagram => DTLS_HEADER_LEN,
        }
    }
}

/// Protocol version in TLS numbering (DTLS 1.2 is 3.3, DTLS 1.0 is 3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion {
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
}

impl ProtocolVersion {
    /// TLS 1.1 / DTLS 1.0
    pub const TLS1_1: Self = Self { major: 3, minor: 2 };
    /// TLS 1.2 / DTLS 1.2
    pub const TLS1_2: Self = Self { major: 3, minor: 3 };

    /// Versions the record layer accepts
    pub fn is_supported(self) -> bool {
        self.major == 3 && (2..=3).contains(&self.minor)
    }

    /// Bytes sent on the wire
    pub fn to_wire(self, transport: Transport) -> [u8; 2] {
        match transport {
            Transport::Stream => [self.major, self.minor],
            Transport::Datagram => {
                // DTLS 1.0 is carried as TLS 1.1 internally
                let minor = if self.minor == 2 { 1 } else { self.minor };
                [
                    255u8.wrapping_sub(self.major.wrapping_sub(2)),
                    255u8.wrapping_sub(minor.wrapping_sub(1)),
                ]
            }
        }
    }

    /// Parse wire bytes
    pub fn from_wire(bytes: [u8; 2], transport: Transport) -> Result<Self, SecureError> {
        let version = match transport {
            Transport::Stream => Self {
                major: bytes[0],
                minor: bytes[1],
            },
            Transport::Datagram => {
                let major = 255u8.wrapping_sub(bytes[0]).wrapping_add(2);
                let mut minor = 255u8.wrapping_sub(bytes[1]).wrapping_add(1);
                if minor == 1 {
                    minor = 2;
                }
                Self { major, minor }
            }
        };
        if !version.is_supported() {
            return Err(SecureError::UnsupportedVersion {
                major: version.major,
                minor: version.minor,
            });
        }
        Ok(version)
    }
}

/// Parsed record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Raw content type byte
    pub content_type: u8,
    /// Wire version bytes
    pub version: [u8; 2],
    /// DTLS epoch and 48-bit sequence; zero for TLS
    pub counter: u64,
    /// Body length
    pub length: u16,
}

impl RecordHeader {
    /// Append the header to `buf`
    pub fn encode(&self, transport: Transport, buf: &mut BytesMut) {
        buf.put_u8(self.content_type);
        buf.put_slice(&self.version);
        if transport == Transport::Datagram {
            buf.put_u64(self.counter);
        }
        buf.put_u16(self.length);
    }

    /// Parse a header from the first bytes of `data`
    pub fn decode(transport: Transport, data: &[u8]) -> Result<Self, SecureError> {
        if data.len() < transport.header_len() {
            return Err(SecureError::BadInputData("incomplete record header"));
        }
        let content_type = data[0];
        let version = [data[1], data[2]];
        let (counter, length) = match transport {
            Transport::Stream => (0, u16::from_be_bytes([data[3], data[4]])),
            Transport::Datagram => {
                let mut counter = [0u8; 8];
                counter.copy_from_slice(&data[3..11]);
                (
                    u64::from_be_bytes(counter),
                    u16::from_be_bytes([data[11], data[12]]),
                )
            }
        };
        if length as usize > MAX_RECORD_BODY_LEN {
            return Err(SecureError::BadInputData("record length exceeds limit"));
        }
        Ok(Self {
            content_type,
            version,
            counter,
            length,
        })
    }

    /// DTLS epoch
    pub fn epoch(&self) -> u16 {
        (self.counter >> 48) as u16
    }

    /// DTLS sequence number within the epoch
    pub fn sequence(&self) -> u64 {
        self.counter & SEQ_MASK
    }
}

/// Saved view of one direction of the record layer: the record counter together with the
/// last record header.
///
/// For TLS the region is `counter(8) | type | version(2) | length(2)`; for DTLS it is the
/// 13-byte record header, which embeds the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderRegion(pub [u8; HEADER_REGION_LEN]);

impl HeaderRegion {
    fn counter_range(transport: Transport) -> std::ops::Range<usize> {
        match transport {
            Transport::Stream => 0..8,
            Transport::Datagram => 3..11,
        }
    }

    /// Record counter
    pub fn counter(&self, transport: Transport) -> u64 {
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&self.0[Self::counter_range(transport)]);
        u64::from_be_bytes(counter)
    }

    /// Overwrite the record counter
    pub fn set_counter(&mut self, transport: Transport, counter: u64) {
        self.0[Self::counter_range(transport)].copy_from_slice(&counter.to_be_bytes());
    }

    /// Record the header of the last record
    pub fn set_header(&mut self, transport: Transport, header: &RecordHeader) {
        match transport {
            Transport::Stream => {
                self.0[8] = header.content_type;
                self.0[9..11].copy_from_slice(&header.version);
                self.0[11..13].copy_from_slice(&header.length.to_be_bytes());
            }
            Transport::Datagram => {
                self.0[0] = header.content_type;
                self.0[1..3].copy_from_slice(&header.version);
                self.0[3..11].copy_from_slice(&header.counter.to_be_bytes());
                self.0[11..13].copy_from_slice(&header.length.to_be_bytes());
            }
        }
    }

    /// Content type of the last record
    pub fn content_type(&self, transport: Transport) -> u8 {
        match transport {
            Transport::Stream => self.0[8],
            Transport::Datagram => self.0[0],
        }
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; HEADER_REGION_LEN] {
        &self.0
    }
}

/// DTLS anti-replay window over 48-bit sequence numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplayWindow {
    /// Highest sequence number accepted
    pub top: u64,
    /// Bit `n` set means `top - n` was accepted
    pub bits: u64,
}

impl ReplayWindow {
    /// Reject a sequence number already seen or too old
    pub fn check(&self, sequence: u64) -> Result<(), SecureError> {
        if sequence > self.top || self.bits == 0 {
            return Ok(());
        }
        let offset = self.top - sequence;
        if offset >= REPLAY_WINDOW_BITS || self.bits & (1u64 << offset) != 0 {
            return Err(SecureError::Replay(sequence));
        }
        Ok(())
    }

    /// Mark a sequence number as accepted
    pub fn update(&mut self, sequence: u64) {
        if sequence > self.top || self.bits == 0 {
            let shift = sequence.saturating_sub(self.top);
            self.bits = if shift >= REPLAY_WINDOW_BITS {
                1
            } else {
                (self.bits << shift) | 1
            };
            self.top = sequence;
        } else {
            let offset = self.top - sequence;
            if offset < REPLAY_WINDOW_BITS {
                self.bits |= 1u64 << offset;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtls_version_mapping() {
        assert_eq!(
            ProtocolVersion::TLS1_2.to_wire(Transport::Datagram),
            [0xFE, 0xFD]
        );
        assert_eq!(
            ProtocolVersion::TLS1_1.to_wire(Transport::Datagram),
            [0xFE, 0xFF]
        );
        assert_eq!(
            ProtocolVersion::from_wire([0xFE, 0xFD], Transport::Datagram).unwrap(),
            ProtocolVersion::TLS1_2
        );
        assert_eq!(
            ProtocolVersion::from_wire([0xFE, 0xFF], Transport::Datagram).unwrap(),
            ProtocolVersion::TLS1_1
        );
        assert!(ProtocolVersion::from_wire([3, 1], Transport::Stream).is_err());
    }

    #[test]
    fn test_dtls_header() {
        let header = RecordHeader {
            content_type: ContentType::ApplicationData as u8,
            version: [0xFE, 0xFD],
            counter: (1u64 << 48) | 7,
            length: 42,
        };
        let mut buf = BytesMut::new();
        header.encode(Transport::Datagram, &mut buf);
        assert_eq!(buf.len(), DTLS_HEADER_LEN);

        let parsed = RecordHeader::decode(Transport::Datagram, &buf).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.epoch(), 1);
        assert_eq!(parsed.sequence(), 7);
    }

    #[test]
    fn test_region_counter_placement() {
        let mut region = HeaderRegion::default();
        region.set_counter(Transport::Stream, 0x0102030405060708);
        assert_eq!(&region.0[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);

        let mut region = HeaderRegion::default();
        let header = RecordHeader {
            content_type: 23,
            version: [0xFE, 0xFD],
            counter: 0x0001_0000_0000_0009,
            length: 5,
        };
        region.set_header(Transport::Datagram, &header);
        assert_eq!(region.counter(Transport::Datagram), header.counter);
        assert_eq!(region.content_type(Transport::Datagram), 23);
    }

    #[test]
    fn test_replay_window() {
        let mut window = ReplayWindow::default();
        for seq in [1, 2, 5] {
            window.check(seq).unwrap();
            window.update(seq);
        }

        // Out of order but new
        window.check(4).unwrap();
        window.update(4);

        assert!(matches!(window.check(5), Err(SecureError::Replay(5))));
        assert!(matches!(window.check(2), Err(SecureError::Replay(2))));
        window.check(3).unwrap();

        // Far jump pushes old records out of the window
        window.update(200);
        assert!(window.check(100).is_err());
        window.check(199).unwrap();
    }
}
