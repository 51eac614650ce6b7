//! Fixed-size binary envelope prefixed to every message.
//!
//! Layout (big-endian, 24 bytes total):
//!
//! | field         | size | meaning                                    |
//! |---------------|------|--------------------------------------------|
//! | magic         | 4    | protocol tag, constant per deployment      |
//! | version       | 1    | protocol version                           |
//! | message_type  | 1    | see [`MessageType`]                        |
//! | snapshot_id   | 4    | snapshot this message pertains to, or 0    |
//! | sequence      | 4    | monotonically increasing per sender        |
//! | timestamp_ms  | 8    | sender-local milliseconds since epoch      |
//! | payload_len   | 2    | bytes following the header                 |
//!
//! Decoding validates only the envelope (length and magic); the payload is
//! never inspected here.

use gridclash_grid::SnapshotId;
use thiserror::Error;

/// Protocol tag carried by every datagram.
pub const MAGIC: [u8; 4] = *b"GCLP";

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Encoded header size in bytes.
pub const HEADER_SIZE: usize = 24;

/// Errors produced by [`Header::decode`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    /// Buffer is shorter than [`HEADER_SIZE`].
    #[error("datagram too short for header: {len} bytes, need {HEADER_SIZE}")]
    Truncated { len: usize },

    /// Magic tag does not match [`MAGIC`].
    #[error("bad protocol magic: {found:02x?}")]
    BadMagic { found: [u8; 4] },
}

/// Message type codes.
///
/// One consistent numbering; historical protocol variants assigned other
/// codes and are not wire-compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Client connection request (empty payload).
    Init = 0,
    /// Client cell-acquire request ([`crate::IntentProto`] payload).
    Intent = 1,
    /// Server connection acknowledgment ([`crate::ConnectAckProto`] payload).
    ConnectAck = 2,
    /// Full snapshot of the entire grid ([`crate::CellPatchProto`] payload).
    Full = 3,
    /// Changed cells against an acknowledged base ([`crate::CellPatchProto`]).
    Delta = 4,
    /// Header-only liveness message; carries the new snapshot id.
    Heartbeat = 5,
    /// Client acknowledgment of an applied snapshot (header-only; the acked
    /// id rides the `snapshot_id` field).
    SnapshotAck = 6,
}

impl MessageType {
    /// Map a wire code back to a message type. Unknown codes yield `None`
    /// and are ignored by both sides.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Init),
            1 => Some(Self::Intent),
            2 => Some(Self::ConnectAck),
            3 => Some(Self::Full),
            4 => Some(Self::Delta),
            5 => Some(Self::Heartbeat),
            6 => Some(Self::SnapshotAck),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Decoded envelope fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: [u8; 4],
    pub version: u8,
    pub message_type: u8,
    pub snapshot_id: SnapshotId,
    pub sequence: u32,
    pub timestamp_ms: u64,
    pub payload_len: u16,
}

impl Header {
    /// Build a header with the deployment magic and current version.
    pub fn new(
        message_type: MessageType,
        snapshot_id: SnapshotId,
        sequence: u32,
        timestamp_ms: u64,
        payload_len: u16,
    ) -> Self {
        Self {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            message_type: message_type.code(),
            snapshot_id,
            sequence,
            timestamp_ms,
            payload_len,
        }
    }

    /// Encode to exactly [`HEADER_SIZE`] bytes. Never fails for well-formed
    /// inputs.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4] = self.version;
        buf[5] = self.message_type;
        buf[6..10].copy_from_slice(&self.snapshot_id.to_be_bytes());
        buf[10..14].copy_from_slice(&self.sequence.to_be_bytes());
        buf[14..22].copy_from_slice(&self.timestamp_ms.to_be_bytes());
        buf[22..24].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    /// Decode the envelope from the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() < HEADER_SIZE {
            return Err(HeaderError::Truncated { len: bytes.len() });
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        if magic != MAGIC {
            return Err(HeaderError::BadMagic { found: magic });
        }

        Ok(Self {
            magic,
            version: bytes[4],
            message_type: bytes[5],
            snapshot_id: be_u32(&bytes[6..10]),
            sequence: be_u32(&bytes[10..14]),
            timestamp_ms: be_u64(&bytes[14..22]),
            payload_len: be_u16(&bytes[22..24]),
        })
    }
}

fn be_u16(bytes: &[u8]) -> u16 {
    let mut buf = [0u8; 2];
    buf.copy_from_slice(bytes);
    u16::from_be_bytes(buf)
}

fn be_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_be_bytes(buf)
}

fn be_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// For all valid field combinations, decode(encode(h)) == h.
    #[test]
    fn test_header_roundtrip() {
        let cases = [
            Header::new(MessageType::Init, 0, 0, 0, 0),
            Header::new(MessageType::Intent, 7, 42, 1_700_000_000_123, 18),
            Header::new(MessageType::Full, u32::MAX, u32::MAX, u64::MAX, u16::MAX),
            Header::new(MessageType::Heartbeat, 2, 3, 4, 0),
            Header::new(MessageType::SnapshotAck, 99, 1, 5, 0),
        ];

        for header in cases {
            let bytes = header.encode();
            assert_eq!(bytes.len(), HEADER_SIZE);
            assert_eq!(Header::decode(&bytes), Ok(header));
        }
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        let header = Header::new(MessageType::Init, 0, 0, 0, 0);
        let bytes = header.encode();

        for len in 0..HEADER_SIZE {
            assert_eq!(
                Header::decode(&bytes[..len]),
                Err(HeaderError::Truncated { len })
            );
        }
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut bytes = Header::new(MessageType::Init, 0, 0, 0, 0).encode();
        bytes[0..4].copy_from_slice(b"XXXX");

        assert_eq!(
            Header::decode(&bytes),
            Err(HeaderError::BadMagic { found: *b"XXXX" })
        );
    }

    #[test]
    fn test_decode_ignores_payload_bytes() {
        // Decoding never inspects the payload: trailing garbage is fine.
        let header = Header::new(MessageType::Delta, 5, 6, 7, 3);
        let mut datagram = header.encode().to_vec();
        datagram.extend_from_slice(&[0xde, 0xad, 0xbe]);

        assert_eq!(Header::decode(&datagram), Ok(header));
    }

    #[test]
    fn test_message_type_codes() {
        for code in 0u8..=6 {
            let mt = MessageType::from_code(code).unwrap();
            assert_eq!(mt.code(), code);
        }
        assert_eq!(MessageType::from_code(7), None);
        assert_eq!(MessageType::from_code(255), None);
    }
}
