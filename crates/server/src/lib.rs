//! GridClash Server Edge
//!
//! The server edge owns the authoritative grid and mediates all client
//! traffic:
//! - Session tracking (one record per endpoint, no eviction)
//! - Intent validation against the grid's acquire rule
//! - Snapshot capture and delta/heartbeat/resync scheduling per client
//!
//! # Architecture
//!
//! [`Server`] is a pure protocol core: datagrams in, datagrams out, with
//! the wall clock passed in as a parameter. All I/O and threading live in
//! [`runtime`], which drives the core from one receive thread and one
//! broadcast thread behind a single mutex.

#![deny(unsafe_code)]

pub mod runtime;
pub mod session;

use std::net::SocketAddr;
use std::time::Duration;

use gridclash_grid::{
    CellCoord, DEFAULT_HISTORY_CAPACITY, GridState, PatchMode, SnapshotHistory, Tick,
};
use gridclash_wire::{
    CellPatchProto, ConnectAckProto, IntentProto, MessageType, frame_header_only, frame_message,
    split,
};
use prost::Message;
use session::SessionTracker;

// ============================================================================
// Defaults (from the deployed GridClash configuration)
// ============================================================================

/// Default grid dimensions.
pub const DEFAULT_GRID_ROWS: u16 = 10;
pub const DEFAULT_GRID_COLS: u16 = 10;

/// Default broadcast frequency in Hz.
pub const DEFAULT_BROADCAST_HZ: u32 = 20;

/// Default number of distinct actor ids handed out before cycling.
pub const DEFAULT_MAX_ACTORS: u32 = 4;

// ============================================================================
// Configuration
// ============================================================================

/// Server configuration. Process-level and fixed for the server lifetime.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub grid_rows: u16,
    pub grid_cols: u16,
    pub broadcast_hz: u32,
    pub history_capacity: usize,
    pub max_actors: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grid_rows: DEFAULT_GRID_ROWS,
            grid_cols: DEFAULT_GRID_COLS,
            broadcast_hz: DEFAULT_BROADCAST_HZ,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            max_actors: DEFAULT_MAX_ACTORS,
        }
    }
}

// ============================================================================
// Server Core
// ============================================================================

/// A datagram addressed for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: SocketAddr,
    pub datagram: Vec<u8>,
}

/// The authoritative server state: grid, snapshot history, and sessions.
///
/// Performs no I/O; [`Server::handle_datagram`] and
/// [`Server::broadcast_tick`] return the datagrams to transmit.
pub struct Server {
    config: ServerConfig,
    grid: GridState,
    history: SnapshotHistory,
    sessions: SessionTracker,
    tick: Tick,
    /// Set when an intent mutates the grid; cleared at each capture.
    dirty: bool,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        assert!(config.broadcast_hz > 0, "broadcast_hz must be positive");

        Self {
            grid: GridState::new(config.grid_rows, config.grid_cols),
            history: SnapshotHistory::new(config.history_capacity),
            sessions: SessionTracker::new(config.max_actors),
            tick: 0,
            dirty: false,
            config,
        }
    }

    /// Broadcast tick period derived from the configured frequency.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.config.broadcast_hz))
    }

    pub fn grid(&self) -> &GridState {
        &self.grid
    }

    pub fn current_tick(&self) -> Tick {
        self.tick
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }

    /// Process one inbound datagram from `from`.
    ///
    /// Malformed headers and unknown message types are dropped without any
    /// state change; this never fails.
    pub fn handle_datagram(
        &mut self,
        from: SocketAddr,
        datagram: &[u8],
        now_ms: u64,
    ) -> Vec<Outbound> {
        let (header, payload) = match split(datagram) {
            Ok(parts) => parts,
            Err(err) => {
                log::debug!("dropping malformed datagram from {from}: {err}");
                return Vec::new();
            }
        };

        let Some(message_type) = MessageType::from_code(header.message_type) else {
            log::debug!(
                "ignoring unknown message type {} from {from}",
                header.message_type
            );
            return Vec::new();
        };

        match message_type {
            MessageType::Init => self.handle_init(from, now_ms),
            MessageType::Intent => {
                self.handle_intent(from, header.snapshot_id, payload);
                Vec::new()
            }
            MessageType::SnapshotAck => {
                self.sessions.record_ack(from, header.snapshot_id);
                Vec::new()
            }
            // Server-bound protocol carries nothing else; client-bound
            // types arriving here are ignored.
            MessageType::ConnectAck
            | MessageType::Full
            | MessageType::Delta
            | MessageType::Heartbeat => Vec::new(),
        }
    }

    /// One tick of the broadcast scheduler.
    ///
    /// Captures a snapshot of the current grid unconditionally, then per
    /// session decides between heartbeat (grid unchanged and session
    /// caught up), delta against the session's ack cursor (changed, caught
    /// up), and full resync (previous snapshot unacknowledged, even on an
    /// idle tick: a heartbeat to an un-acked session would be acked and
    /// mask the lost snapshot). Stop-and-wait: the delta base never
    /// advances past what the client confirmed.
    pub fn broadcast_tick(&mut self, now_ms: u64) -> Vec<Outbound> {
        let changed = self.dirty;
        self.dirty = false;

        let snapshot_id = self.history.capture(&self.grid, self.tick);
        self.tick += 1;

        let mut outbound = Vec::with_capacity(self.sessions.len());
        for session in self.sessions.iter_mut() {
            let sequence = session.next_sequence();

            let datagram = if session.is_caught_up() && !changed {
                frame_header_only(MessageType::Heartbeat, snapshot_id, sequence, now_ms)
            } else {
                let patch = if session.is_caught_up() {
                    self.history.delta(session.last_acked_snapshot, &self.grid)
                } else {
                    // Non-ack is the resync signal: send current state in
                    // full rather than waiting for (or retransmitting) the
                    // lost bytes.
                    self.history.delta(0, &self.grid)
                };
                let message_type = match patch.mode {
                    PatchMode::Full => MessageType::Full,
                    PatchMode::Delta => MessageType::Delta,
                };
                let payload = CellPatchProto::from(&patch).encode_to_vec();
                match frame_message(message_type, snapshot_id, sequence, now_ms, &payload) {
                    Some(datagram) => datagram,
                    None => {
                        log::error!(
                            "snapshot {snapshot_id} payload exceeds the envelope length \
                             field; nothing sent to {}",
                            session.endpoint
                        );
                        continue;
                    }
                }
            };

            outbound.push(Outbound {
                to: session.endpoint,
                datagram,
            });
            session.last_snapshot_sent = snapshot_id;
        }
        outbound
    }

    fn handle_init(&mut self, from: SocketAddr, now_ms: u64) -> Vec<Outbound> {
        // Full current state, stamped with the latest captured id so the
        // client's ack lands on a usable delta base.
        let full_patch = CellPatchProto::from(&self.history.delta(0, &self.grid));
        let full_id = self.history.latest_id();

        let tick = self.tick;
        let session = self.sessions.register_or_refresh(from, tick);
        let actor_id = session.actor_id;
        log::info!(
            "actor {actor_id} registered from {from} (session {})",
            session.id
        );

        // Connection ack with the assigned actor id, plus an immediate full
        // snapshot so the client has state before the next broadcast tick.
        let ack_payload = ConnectAckProto { actor_id }.encode_to_vec();
        let ack_sequence = session.next_sequence();
        let full_sequence = session.next_sequence();
        session.last_snapshot_sent = full_id;

        let mut replies = Vec::with_capacity(2);
        if let Some(datagram) =
            frame_message(MessageType::ConnectAck, 0, ack_sequence, now_ms, &ack_payload)
        {
            replies.push(Outbound { to: from, datagram });
        }
        match frame_message(
            MessageType::Full,
            full_id,
            full_sequence,
            now_ms,
            &full_patch.encode_to_vec(),
        ) {
            Some(datagram) => replies.push(Outbound { to: from, datagram }),
            None => log::error!(
                "connect-time full snapshot exceeds the envelope length field; \
                 nothing sent to {from}"
            ),
        }
        replies
    }

    fn handle_intent(&mut self, from: SocketAddr, piggyback_snapshot: u32, payload: &[u8]) {
        // The intent's header snapshot_id piggybacks the sender's
        // last-applied snapshot; treat it as an ack.
        if piggyback_snapshot > 0 {
            self.sessions.record_ack(from, piggyback_snapshot);
        }

        let Ok(intent) = IntentProto::decode(payload) else {
            // Empty state update per the error model; nothing to apply.
            log::debug!("undecodable intent payload from {from}");
            return;
        };

        let (Ok(row), Ok(col)) = (u16::try_from(intent.row), u16::try_from(intent.col)) else {
            log::debug!("intent from {from} with out-of-range coordinates");
            return;
        };
        let cell = CellCoord::new(row, col);

        let outcome = self.grid.acquire(cell, intent.actor_id);
        if outcome.is_acquired() {
            self.dirty = true;
            log::info!(
                "actor {} acquired cell ({row}, {col})",
                intent.actor_id
            );
        } else {
            // Silent rejection: the next snapshot is the client's only
            // signal that the cell went to someone else.
            log::debug!(
                "intent from actor {} for cell ({row}, {col}) rejected: {outcome:?}",
                intent.actor_id
            );
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use gridclash_grid::UNOWNED;
    use gridclash_wire::{Header, HeaderError};

    fn endpoint(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn init_datagram(sequence: u32) -> Vec<u8> {
        frame_header_only(MessageType::Init, 0, sequence, 0)
    }

    fn intent_datagram(
        row: u32,
        col: u32,
        actor_id: u32,
        last_applied: u32,
        sequence: u32,
    ) -> Vec<u8> {
        let payload = IntentProto { row, col, actor_id }.encode_to_vec();
        frame_message(MessageType::Intent, last_applied, sequence, 0, &payload).unwrap()
    }

    fn ack_datagram(snapshot_id: u32, sequence: u32) -> Vec<u8> {
        frame_header_only(MessageType::SnapshotAck, snapshot_id, sequence, 0)
    }

    fn header_of(datagram: &[u8]) -> Header {
        Header::decode(datagram).unwrap()
    }

    fn patch_of(datagram: &[u8]) -> CellPatchProto {
        let (header, payload) = split(datagram).unwrap();
        assert!(
            header.message_type == MessageType::Full.code()
                || header.message_type == MessageType::Delta.code()
        );
        CellPatchProto::decode(payload).unwrap()
    }

    #[test]
    fn test_init_creates_session_and_replies() {
        let mut server = Server::new(ServerConfig::default());

        let replies = server.handle_datagram(endpoint(5000), &init_datagram(1), 100);
        assert_eq!(replies.len(), 2);
        assert_eq!(server.session_count(), 1);

        // Connection ack carries the assigned actor id.
        let (ack_header, ack_payload) = split(&replies[0].datagram).unwrap();
        assert_eq!(ack_header.message_type, MessageType::ConnectAck.code());
        assert_eq!(ack_header.timestamp_ms, 100);
        let ack = ConnectAckProto::decode(ack_payload).unwrap();
        assert_eq!(ack.actor_id, 1);

        // Followed by an immediate full snapshot (empty grid, id 0 before
        // any capture).
        let full_header = header_of(&replies[1].datagram);
        assert_eq!(full_header.message_type, MessageType::Full.code());
        assert_eq!(full_header.snapshot_id, 0);
    }

    #[test]
    fn test_repeated_init_is_idempotent() {
        let mut server = Server::new(ServerConfig::default());

        server.handle_datagram(endpoint(5000), &init_datagram(1), 0);
        server.handle_datagram(endpoint(5000), &ack_datagram(0, 2), 0);
        server.broadcast_tick(0);
        server.handle_datagram(endpoint(5000), &ack_datagram(1, 3), 0);

        // Second INIT from the same endpoint: same session, ack preserved.
        let replies = server.handle_datagram(endpoint(5000), &init_datagram(4), 0);
        assert_eq!(server.session_count(), 1);
        let session = server.sessions().get(&endpoint(5000)).unwrap();
        assert_eq!(session.last_acked_snapshot, 1);
        assert_eq!(session.actor_id, 1);
        assert_eq!(replies.len(), 2);
    }

    #[test]
    fn test_malformed_datagrams_are_dropped() {
        let mut server = Server::new(ServerConfig::default());

        // Too short.
        assert!(server.handle_datagram(endpoint(5000), &[1, 2, 3], 0).is_empty());
        // Bad magic.
        let mut bad = init_datagram(1);
        bad[0..4].copy_from_slice(b"NOPE");
        assert!(server.handle_datagram(endpoint(5000), &bad, 0).is_empty());
        // Unknown message type.
        let mut unknown = init_datagram(1);
        unknown[5] = 200;
        assert!(server.handle_datagram(endpoint(5000), &unknown, 0).is_empty());

        assert_eq!(server.session_count(), 0);
        assert_eq!(server.grid().owned_count(), 0);

        // Sanity: split on the short buffer really is a header error.
        assert!(matches!(split(&[1, 2, 3]), Err(HeaderError::Truncated { .. })));
    }

    #[test]
    fn test_intent_applies_and_marks_dirty() {
        let mut server = Server::new(ServerConfig::default());
        server.handle_datagram(endpoint(5000), &init_datagram(1), 0);

        server.handle_datagram(endpoint(5000), &intent_datagram(2, 3, 1, 0, 2), 0);
        assert_eq!(server.grid().owner(CellCoord::new(2, 3)), 1);
    }

    #[test]
    fn test_intent_on_owned_cell_silently_rejected() {
        let mut server = Server::new(ServerConfig::default());
        server.handle_datagram(endpoint(5000), &init_datagram(1), 0);
        server.handle_datagram(endpoint(5001), &init_datagram(1), 0);

        server.handle_datagram(endpoint(5000), &intent_datagram(2, 3, 1, 0, 2), 0);
        server.handle_datagram(endpoint(5001), &intent_datagram(2, 3, 2, 0, 2), 0);

        // First writer wins; no reply either way.
        assert_eq!(server.grid().owner(CellCoord::new(2, 3)), 1);
    }

    #[test]
    fn test_undecodable_intent_payload_is_empty_update() {
        let mut server = Server::new(ServerConfig::default());
        server.handle_datagram(endpoint(5000), &init_datagram(1), 0);

        let garbage = frame_message(MessageType::Intent, 0, 2, 0, &[0xff; 8]).unwrap();
        let replies = server.handle_datagram(endpoint(5000), &garbage, 0);

        assert!(replies.is_empty());
        assert_eq!(server.grid().owned_count(), 0);
    }

    #[test]
    fn test_first_tick_sends_full() {
        let mut server = Server::new(ServerConfig::default());
        server.handle_datagram(endpoint(5000), &init_datagram(1), 0);
        server.handle_datagram(endpoint(5000), &intent_datagram(2, 3, 1, 0, 2), 0);

        let out = server.broadcast_tick(0);
        assert_eq!(out.len(), 1);

        // Caught up (nothing sent yet), base 0 -> full state.
        let header = header_of(&out[0].datagram);
        assert_eq!(header.message_type, MessageType::Full.code());
        assert_eq!(header.snapshot_id, 1);
        let patch = patch_of(&out[0].datagram);
        assert_eq!(patch.cells.len(), 1);
    }

    #[test]
    fn test_idle_tick_sends_heartbeat() {
        let mut server = Server::new(ServerConfig::default());
        server.handle_datagram(endpoint(5000), &init_datagram(1), 0);

        // No grid change since the last capture, session caught up.
        let out = server.broadcast_tick(0);
        let header = header_of(&out[0].datagram);
        assert_eq!(header.message_type, MessageType::Heartbeat.code());
        assert_eq!(header.snapshot_id, 1);
        assert_eq!(header.payload_len, 0);

        // Snapshot ids keep progressing while idle.
        server.handle_datagram(endpoint(5000), &ack_datagram(1, 2), 0);
        let out = server.broadcast_tick(0);
        let header = header_of(&out[0].datagram);
        assert_eq!(header.message_type, MessageType::Heartbeat.code());
        assert_eq!(header.snapshot_id, 2);
    }

    /// An idle tick to an un-acked session resyncs in full. A heartbeat
    /// here would be acked, marking the session caught up at a base it
    /// never received, and every later delta would omit the lost cells.
    #[test]
    fn test_unacked_session_resyncs_even_when_idle() {
        let mut server = Server::new(ServerConfig::default());
        server.handle_datagram(endpoint(5000), &init_datagram(1), 0);
        server.handle_datagram(endpoint(5000), &intent_datagram(0, 0, 1, 0, 2), 0);

        // Full snapshot 1 goes unacknowledged (lost in transit).
        server.broadcast_tick(0);

        let out = server.broadcast_tick(0);
        let header = header_of(&out[0].datagram);
        assert_eq!(header.message_type, MessageType::Full.code());
        assert_eq!(header.snapshot_id, 2);
        assert_eq!(patch_of(&out[0].datagram).cells.len(), 1);
    }

    /// A full snapshot too large for the envelope's length field is not
    /// sent at all; a truncated length would decode as a partial (or
    /// empty) patch and wipe the client's grid.
    #[test]
    fn test_oversized_snapshot_is_not_sent_truncated() {
        let config = ServerConfig {
            grid_rows: 150,
            grid_cols: 150,
            ..ServerConfig::default()
        };
        let mut server = Server::new(config);
        server.handle_datagram(endpoint(5000), &init_datagram(1), 0);

        let mut sequence = 2;
        for row in 0..150 {
            for col in 0..150 {
                server.handle_datagram(endpoint(5000), &intent_datagram(row, col, 1, 0, sequence), 0);
                sequence += 1;
            }
        }
        assert_eq!(server.grid().owned_count(), 150 * 150);

        let out = server.broadcast_tick(0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_unacked_session_gets_full_resync() {
        let mut server = Server::new(ServerConfig::default());
        server.handle_datagram(endpoint(5000), &init_datagram(1), 0);

        server.handle_datagram(endpoint(5000), &intent_datagram(0, 0, 1, 0, 2), 0);
        server.broadcast_tick(0); // full, snapshot 1, never acked

        server.handle_datagram(endpoint(5000), &intent_datagram(0, 1, 1, 0, 3), 0);
        let out = server.broadcast_tick(0);

        // Previous snapshot unacknowledged: resync with the whole state,
        // not a delta.
        let header = header_of(&out[0].datagram);
        assert_eq!(header.message_type, MessageType::Full.code());
        assert_eq!(header.snapshot_id, 2);
        assert_eq!(patch_of(&out[0].datagram).cells.len(), 2);
    }

    #[test]
    fn test_acked_session_gets_delta() {
        let mut server = Server::new(ServerConfig::default());
        server.handle_datagram(endpoint(5000), &init_datagram(1), 0);

        server.handle_datagram(endpoint(5000), &intent_datagram(0, 0, 1, 0, 2), 0);
        server.broadcast_tick(0);
        server.handle_datagram(endpoint(5000), &ack_datagram(1, 3), 0);

        server.handle_datagram(endpoint(5000), &intent_datagram(0, 1, 1, 1, 4), 0);
        let out = server.broadcast_tick(0);

        // Caught up: delta against snapshot 1 carries only the new cell.
        let header = header_of(&out[0].datagram);
        assert_eq!(header.message_type, MessageType::Delta.code());
        assert_eq!(header.snapshot_id, 2);
        let patch = patch_of(&out[0].datagram);
        assert_eq!(patch.cells.len(), 1);
        assert_eq!(patch.cells[0].row, 0);
        assert_eq!(patch.cells[0].col, 1);
    }

    #[test]
    fn test_intent_piggybacks_ack() {
        let mut server = Server::new(ServerConfig::default());
        server.handle_datagram(endpoint(5000), &init_datagram(1), 0);

        server.handle_datagram(endpoint(5000), &intent_datagram(0, 0, 1, 0, 2), 0);
        server.broadcast_tick(0);

        // The intent's header carries last-applied snapshot 1: counts as
        // an ack, so the next changed tick is a delta.
        server.handle_datagram(endpoint(5000), &intent_datagram(0, 1, 1, 1, 3), 0);
        let out = server.broadcast_tick(0);
        assert_eq!(
            header_of(&out[0].datagram).message_type,
            MessageType::Delta.code()
        );
    }

    #[test]
    fn test_stale_ack_does_not_move_cursor_back() {
        let mut server = Server::new(ServerConfig::default());
        server.handle_datagram(endpoint(5000), &init_datagram(1), 0);

        server.handle_datagram(endpoint(5000), &intent_datagram(0, 0, 1, 0, 2), 0);
        server.broadcast_tick(0);
        server.handle_datagram(endpoint(5000), &ack_datagram(1, 3), 0);
        server.handle_datagram(endpoint(5000), &ack_datagram(0, 4), 0); // stale

        let session = server.sessions().get(&endpoint(5000)).unwrap();
        assert_eq!(session.last_acked_snapshot, 1);
    }

    #[test]
    fn test_ack_never_exceeds_sent() {
        let mut server = Server::new(ServerConfig::default());
        server.handle_datagram(endpoint(5000), &init_datagram(1), 0);

        for i in 0..5 {
            server.broadcast_tick(0);
            server.handle_datagram(endpoint(5000), &ack_datagram(i + 1, i + 2), 0);
            let session = server.sessions().get(&endpoint(5000)).unwrap();
            assert!(session.last_acked_snapshot <= session.last_snapshot_sent);
        }
    }

    #[test]
    fn test_sequences_increase_per_session() {
        let mut server = Server::new(ServerConfig::default());
        server.handle_datagram(endpoint(5000), &init_datagram(1), 0);

        let mut last = 0;
        for _ in 0..4 {
            let out = server.broadcast_tick(0);
            let sequence = header_of(&out[0].datagram).sequence;
            assert!(sequence > last);
            last = sequence;
        }
    }

    /// The end-to-end scenario: acquire, full, ack, heartbeat, losing
    /// intent from a second client.
    #[test]
    fn test_end_to_end_scenario() {
        let mut server = Server::new(ServerConfig::default());
        let a = endpoint(5000);
        let b = endpoint(5001);

        // Grid starts fully unowned.
        assert_eq!(server.grid().owned_count(), 0);

        // Client A connects and acquires (2, 3).
        server.handle_datagram(a, &init_datagram(1), 0);
        server.handle_datagram(a, &intent_datagram(2, 3, 1, 0, 2), 0);
        assert_eq!(server.grid().owner(CellCoord::new(2, 3)), 1);

        // First tick: full snapshot 1 showing (2,3) = A.
        let out = server.broadcast_tick(0);
        let header = header_of(&out[0].datagram);
        assert_eq!(header.message_type, MessageType::Full.code());
        assert_eq!(header.snapshot_id, 1);
        let patch = patch_of(&out[0].datagram);
        assert_eq!((patch.cells[0].row, patch.cells[0].col), (2, 3));
        assert_eq!(patch.cells[0].owner, 1);

        // A acks snapshot 1; second tick with no change is a heartbeat
        // with snapshot id 2 and empty payload.
        server.handle_datagram(a, &ack_datagram(1, 3), 0);
        let out = server.broadcast_tick(0);
        let header = header_of(&out[0].datagram);
        assert_eq!(header.message_type, MessageType::Heartbeat.code());
        assert_eq!(header.snapshot_id, 2);
        assert_eq!(header.payload_len, 0);

        // Client B connects and tries to take (2, 3): rejected, unchanged.
        server.handle_datagram(b, &init_datagram(1), 0);
        let actor_b = server.sessions().get(&b).unwrap().actor_id;
        assert_eq!(actor_b, 2);
        server.handle_datagram(b, &intent_datagram(2, 3, actor_b, 0, 2), 0);
        assert_eq!(server.grid().owner(CellCoord::new(2, 3)), 1);
        assert_ne!(server.grid().owner(CellCoord::new(2, 3)), UNOWNED);
    }
}
