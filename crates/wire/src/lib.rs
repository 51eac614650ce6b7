//! GridClash Wire Protocol
//!
//! This crate defines the shared wire format used between client and server:
//! the fixed-size binary envelope ([`Header`]) and the Protobuf payload
//! bodies carried after it. Both client and server crates depend on this
//! crate so the two ends can never drift apart.
//!
//! # Message shapes
//!
//! - **INIT**: empty payload
//! - **INTENT**: [`IntentProto`]
//! - **CONNECT_ACK**: [`ConnectAckProto`]
//! - **FULL / DELTA**: [`CellPatchProto`]
//! - **HEARTBEAT / SNAPSHOT_ACK**: header only

#![deny(unsafe_code)]

pub mod header;

use std::collections::BTreeMap;

use gridclash_grid::{CellCoord, OwnerId, PatchMode, StatePatch};
use prost::Message;

pub use header::{HEADER_SIZE, Header, HeaderError, MAGIC, MessageType, PROTOCOL_VERSION};

// ============================================================================
// Payload Messages
// ============================================================================

/// Server connection acknowledgment: the actor id assigned to this client.
#[derive(Clone, PartialEq, Message)]
pub struct ConnectAckProto {
    #[prost(uint32, tag = "1")]
    pub actor_id: u32,
}

/// Client cell-acquire request.
///
/// Advisory: the server validates it and may silently reject; the next
/// snapshot is the client's only confirmation channel.
#[derive(Clone, PartialEq, Message)]
pub struct IntentProto {
    #[prost(uint32, tag = "1")]
    pub row: u32,

    #[prost(uint32, tag = "2")]
    pub col: u32,

    #[prost(uint32, tag = "3")]
    pub actor_id: u32,
}

/// One `(cell, owner)` pair inside a FULL or DELTA payload.
#[derive(Clone, PartialEq, Message)]
pub struct CellEntryProto {
    #[prost(uint32, tag = "1")]
    pub row: u32,

    #[prost(uint32, tag = "2")]
    pub col: u32,

    #[prost(uint32, tag = "3")]
    pub owner: u32,
}

/// FULL/DELTA payload body. Whether it replaces or merges is carried by the
/// envelope's message type, not by the payload.
#[derive(Clone, PartialEq, Message)]
pub struct CellPatchProto {
    #[prost(message, repeated, tag = "1")]
    pub cells: Vec<CellEntryProto>,
}

// ============================================================================
// Conversions
// ============================================================================

impl CellPatchProto {
    /// Build a payload from patch cells, in deterministic (row-major) order.
    pub fn from_cells(cells: &BTreeMap<CellCoord, OwnerId>) -> Self {
        Self {
            cells: cells
                .iter()
                .map(|(&cell, &owner)| CellEntryProto {
                    row: u32::from(cell.row),
                    col: u32::from(cell.col),
                    owner,
                })
                .collect(),
        }
    }

    /// Convert back into patch cells, dropping entries whose coordinates do
    /// not fit the grid coordinate space.
    pub fn into_cells(self) -> BTreeMap<CellCoord, OwnerId> {
        self.cells
            .into_iter()
            .filter_map(|entry| {
                let row = u16::try_from(entry.row).ok()?;
                let col = u16::try_from(entry.col).ok()?;
                Some((CellCoord::new(row, col), entry.owner))
            })
            .collect()
    }
}

impl From<&StatePatch> for CellPatchProto {
    fn from(patch: &StatePatch) -> Self {
        Self::from_cells(&patch.cells)
    }
}

/// Decode a FULL or DELTA payload into a [`StatePatch`].
///
/// A payload that fails to decode degrades to an empty patch rather than an
/// error: the protocol loop treats it as an empty state update.
pub fn decode_patch(mode: PatchMode, payload: &[u8]) -> StatePatch {
    let cells = CellPatchProto::decode(payload)
        .map(CellPatchProto::into_cells)
        .unwrap_or_default();
    match mode {
        PatchMode::Full => StatePatch::full(cells),
        PatchMode::Delta => StatePatch::delta(cells),
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Assemble a datagram: encoded header followed by the payload bytes.
///
/// `header.payload_len` is trusted to match `payload.len()`; use
/// [`frame_message`] to have it filled in.
pub fn frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(HEADER_SIZE + payload.len());
    datagram.extend_from_slice(&header.encode());
    datagram.extend_from_slice(payload);
    datagram
}

/// Build a complete datagram from envelope fields and a payload.
///
/// Returns `None` when the payload cannot be described by the envelope's
/// 16-bit length field; truncating the length would make the receiver
/// decode a partial body as a valid (and wrong) message, so the sender
/// must drop the message instead.
pub fn frame_message(
    message_type: MessageType,
    snapshot_id: u32,
    sequence: u32,
    timestamp_ms: u64,
    payload: &[u8],
) -> Option<Vec<u8>> {
    let payload_len = u16::try_from(payload.len()).ok()?;
    let header = Header::new(message_type, snapshot_id, sequence, timestamp_ms, payload_len);
    Some(frame(&header, payload))
}

/// Build a header-only datagram (INIT, HEARTBEAT, SNAPSHOT_ACK).
pub fn frame_header_only(
    message_type: MessageType,
    snapshot_id: u32,
    sequence: u32,
    timestamp_ms: u64,
) -> Vec<u8> {
    let header = Header::new(message_type, snapshot_id, sequence, timestamp_ms, 0);
    frame(&header, &[])
}

/// Split an inbound datagram into its decoded header and payload slice.
///
/// The payload is bounded by the header's `payload_len` but never past the
/// end of the datagram; a short payload is handed through as-is and left to
/// payload decoding (which degrades to empty, per the error model).
pub fn split(datagram: &[u8]) -> Result<(Header, &[u8]), HeaderError> {
    let header = Header::decode(datagram)?;
    let end = HEADER_SIZE
        .saturating_add(usize::from(header.payload_len))
        .min(datagram.len());
    Ok((header, &datagram[HEADER_SIZE..end]))
}

// ============================================================================
// Tests
// ============================================================================
