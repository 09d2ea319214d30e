//! Record layer header.
//!
//! ```text
//! +------+---------+-------+-----------------+--------+
//! | type | version | epoch | sequence number | length |
//! |  1   |    2    |   2   |        6        |   2    |
//! +------+---------+-------+-----------------+--------+
//! ```

use crate::{Result, SessionError};

/// Size of an encoded record header.
pub const RECORD_HEADER_SIZE: usize = 13;

/// Largest sequence number representable in the 48-bit field.
pub const MAX_SEQUENCE_NUMBER: u64 = (1 << 48) - 1;

/// DTLS 1.2 on the wire (one's complement of 1.2).
pub const PROTOCOL_VERSION_1_2: ProtocolVersion = ProtocolVersion {
    major: 0xfe,
    minor: 0xfd,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

/// Record content types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    ChangeCipherSpec = 20,
    Alert = 21,
    Handshake = 22,
    ApplicationData = 23,
}

impl TryFrom<u8> for ContentType {
    type Error = SessionError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            20 => Ok(ContentType::ChangeCipherSpec),
            21 => Ok(ContentType::Alert),
            22 => Ok(ContentType::Handshake),
            23 => Ok(ContentType::ApplicationData),
            other => Err(SessionError::InvalidRecord(format!(
                "unknown content type {other}"
            ))),
        }
    }
}

/// Header preceding every protected record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub content_type: ContentType,
    pub version: ProtocolVersion,
    pub epoch: u16,
    pub sequence_number: u64,
}

impl RecordHeader {
    pub fn new(content_type: ContentType, epoch: u16, sequence_number: u64) -> Self {
        Self {
            content_type,
            version: PROTOCOL_VERSION_1_2,
            epoch,
            sequence_number,
        }
    }

    /// `epoch || sequence_number` as one 8-byte big-endian value.
    pub fn sequence_bytes(&self) -> [u8; 8] {
        let combined = ((self.epoch as u64) << 48) | (self.sequence_number & MAX_SEQUENCE_NUMBER);
        combined.to_be_bytes()
    }

    /// Encode the header with the given fragment length.
    pub fn marshal(&self, length: usize) -> Result<[u8; RECORD_HEADER_SIZE]> {
        if self.sequence_number > MAX_SEQUENCE_NUMBER {
            return Err(SessionError::InvalidRecord(format!(
                "sequence number {} exceeds 48 bits",
                self.sequence_number
            )));
        }
        let length = u16::try_from(length).map_err(|_| {
            SessionError::InvalidRecord(format!("record fragment too large: {length} bytes"))
        })?;

        let mut out = [0u8; RECORD_HEADER_SIZE];
        out[0] = self.content_type as u8;
        out[1] = self.version.major;
        out[2] = self.version.minor;
        out[3..11].copy_from_slice(&self.sequence_bytes());
        out[11..13].copy_from_slice(&length.to_be_bytes());
        Ok(out)
    }

    /// Decode a header, returning it together with the fragment length.
    pub fn unmarshal(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < RECORD_HEADER_SIZE {
            return Err(SessionError::InvalidRecord(format!(
                "record header too short: {} bytes",
                data.len()
            )));
        }
        let content_type = ContentType::try_from(data[0])?;
        let version = ProtocolVersion {
            major: data[1],
            minor: data[2],
        };
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&data[3..11]);
        let combined = u64::from_be_bytes(seq);
        let length = u16::from_be_bytes([data[11], data[12]]) as usize;

        Ok((
            Self {
                content_type,
                version,
                epoch: (combined >> 48) as u16,
                sequence_number: combined & MAX_SEQUENCE_NUMBER,
            },
            length,
        ))
    }

    /// Additional authenticated data for an AEAD record of `plaintext_len` bytes.
    pub fn additional_data(&self, plaintext_len: usize) -> [u8; RECORD_HEADER_SIZE] {
        let mut ad = [0u8; RECORD_HEADER_SIZE];
        ad[..8].copy_from_slice(&self.sequence_bytes());
        ad[8] = self.content_type as u8;
        ad[9] = self.version.major;
        ad[10] = self.version.minor;
        ad[11..13].copy_from_slice(&(plaintext_len as u16).to_be_bytes());
        ad
    }
}
