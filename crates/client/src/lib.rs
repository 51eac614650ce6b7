//! GridClash Client Sync
//!
//! Client-side counterpart of the server edge: connection handshake,
//! ordering/duplicate filtering for snapshot-bearing messages, patch
//! application to the local grid representation, and acknowledgment
//! emission.
//!
//! # Architecture
//!
//! [`ClientSync`] is a pure state machine: datagrams in, events and
//! datagrams out, with the wall clock passed in as a parameter. The socket
//! and the receive thread live in [`runtime`]; decoded events are queued
//! there for the presentation loop to drain at its own poll interval, so
//! slow presentation work never stalls the receive path and the
//! presentation layer never observes a half-applied grid.

#![deny(unsafe_code)]

pub mod runtime;

use gridclash_grid::{CellCoord, GridState, OwnerId, PatchMode, SnapshotId, StatePatch};
use gridclash_wire::{
    ConnectAckProto, IntentProto, MessageType, decode_patch, frame_header_only, frame_message,
    split,
};
use prost::Message;

// ============================================================================
// Configuration
// ============================================================================

/// Client configuration: the local grid dimensions, which must match the
/// server's deployment.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub grid_rows: u16,
    pub grid_cols: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            grid_rows: 10,
            grid_cols: 10,
        }
    }
}

// ============================================================================
// State Machine
// ============================================================================

/// Connection lifecycle. `Synced` is terminal until process exit; there is
/// no disconnecting state, shutdown is abrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Disconnected,
    /// INIT sent, awaiting the connection ack.
    Connecting,
    Synced,
}

/// A validated event produced by the state machine, consumed by the
/// presentation loop.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Handshake completed; this is the actor id the server assigned.
    Connected { actor_id: OwnerId },
    /// A snapshot or delta was applied to the local grid.
    Patched {
        snapshot_id: SnapshotId,
        patch: StatePatch,
    },
    /// Liveness message; snapshot id advanced with no state change.
    Heartbeat { snapshot_id: SnapshotId },
}

/// Result of feeding one inbound datagram to the state machine.
///
/// `ack` is a datagram the transport must send back (the snapshot ack);
/// both fields are empty for dropped or ignored input.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Handled {
    pub event: Option<SyncEvent>,
    pub ack: Option<Vec<u8>>,
}

impl Handled {
    fn none() -> Self {
        Self::default()
    }
}

/// The client sync state machine.
pub struct ClientSync {
    state: SyncState,
    actor_id: Option<OwnerId>,
    grid: GridState,
    /// Id of the most recently applied snapshot; never decreases.
    current_applied: SnapshotId,
    /// Outgoing sequence counter.
    sequence: u32,
}

impl ClientSync {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            state: SyncState::Disconnected,
            actor_id: None,
            grid: GridState::new(config.grid_rows, config.grid_cols),
            current_applied: 0,
            sequence: 0,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn actor_id(&self) -> Option<OwnerId> {
        self.actor_id
    }

    /// The local grid representation, updated only by applied patches.
    pub fn grid(&self) -> &GridState {
        &self.grid
    }

    pub fn current_applied(&self) -> SnapshotId {
        self.current_applied
    }

    /// Begin (or restart) the handshake. Returns the INIT datagram to send.
    pub fn connect(&mut self, now_ms: u64) -> Vec<u8> {
        self.state = SyncState::Connecting;
        let sequence = self.next_sequence();
        frame_header_only(MessageType::Init, 0, sequence, now_ms)
    }

    /// Build a fire-and-forget acquire request for `cell`.
    ///
    /// Returns `None` unless the handshake has completed: an intent needs
    /// the assigned actor id. The header piggybacks the last applied
    /// snapshot id as an ack. There is no retry and no blocking wait; the
    /// next snapshot is the sole confirmation channel.
    pub fn intent(&mut self, cell: CellCoord, now_ms: u64) -> Option<Vec<u8>> {
        if self.state != SyncState::Synced {
            return None;
        }
        let actor_id = self.actor_id?;

        let payload = IntentProto {
            row: u32::from(cell.row),
            col: u32::from(cell.col),
            actor_id,
        }
        .encode_to_vec();
        let sequence = self.next_sequence();
        frame_message(
            MessageType::Intent,
            self.current_applied,
            sequence,
            now_ms,
            &payload,
        )
    }

    /// Feed one inbound datagram to the state machine.
    ///
    /// Malformed headers, unknown message types, out-of-order snapshots and
    /// messages not meaningful in the current state are all dropped
    /// silently; none of these are errors under an unordered transport.
    pub fn handle_datagram(&mut self, datagram: &[u8], now_ms: u64) -> Handled {
        let (header, payload) = match split(datagram) {
            Ok(parts) => parts,
            Err(err) => {
                log::debug!("dropping malformed datagram: {err}");
                return Handled::none();
            }
        };

        let Some(message_type) = MessageType::from_code(header.message_type) else {
            log::debug!("ignoring unknown message type {}", header.message_type);
            return Handled::none();
        };

        match message_type {
            MessageType::ConnectAck => self.handle_connect_ack(payload),
            MessageType::Full => {
                self.handle_snapshot(header.snapshot_id, Some(PatchMode::Full), payload, now_ms)
            }
            MessageType::Delta => {
                self.handle_snapshot(header.snapshot_id, Some(PatchMode::Delta), payload, now_ms)
            }
            MessageType::Heartbeat => {
                self.handle_snapshot(header.snapshot_id, None, payload, now_ms)
            }
            // Client-bound protocol carries nothing else.
            MessageType::Init | MessageType::Intent | MessageType::SnapshotAck => Handled::none(),
        }
    }

    fn handle_connect_ack(&mut self, payload: &[u8]) -> Handled {
        if self.state == SyncState::Synced {
            // Duplicate ack after a repeated INIT; nothing to do.
            return Handled::none();
        }
        let Ok(ack) = ConnectAckProto::decode(payload) else {
            log::debug!("undecodable connection ack payload");
            return Handled::none();
        };

        self.state = SyncState::Synced;
        self.actor_id = Some(ack.actor_id);
        log::info!("connected as actor {}", ack.actor_id);

        Handled {
            event: Some(SyncEvent::Connected {
                actor_id: ack.actor_id,
            }),
            ack: None,
        }
    }

    /// Common path for FULL / DELTA / HEARTBEAT. `mode` is `None` for a
    /// heartbeat, which applies no change.
    fn handle_snapshot(
        &mut self,
        snapshot_id: SnapshotId,
        mode: Option<PatchMode>,
        payload: &[u8],
        now_ms: u64,
    ) -> Handled {
        if self.state != SyncState::Synced {
            // Snapshot raced ahead of the connection ack; the server will
            // resync us since no ack gets recorded.
            return Handled::none();
        }

        // Out-of-order or duplicate arrival, expected under an unordered
        // transport.
        if snapshot_id < self.current_applied {
            log::debug!(
                "discarding outdated snapshot {snapshot_id} (applied {})",
                self.current_applied
            );
            return Handled::none();
        }

        let event = match mode {
            Some(mode) => {
                let patch = decode_patch(mode, payload);
                self.grid.apply(&patch);
                SyncEvent::Patched { snapshot_id, patch }
            }
            None => SyncEvent::Heartbeat { snapshot_id },
        };
        self.current_applied = snapshot_id;

        let sequence = self.next_sequence();
        let ack = frame_header_only(MessageType::SnapshotAck, snapshot_id, sequence, now_ms);

        Handled {
            event: Some(event),
            ack: Some(ack),
        }
    }

    fn next_sequence(&mut self) -> u32 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }
}

// ============================================================================
// Tests
// ============================================================================
