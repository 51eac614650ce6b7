//! Session tracking for the server edge.
//!
//! One session per client endpoint, created on INIT and kept for the
//! process lifetime. There is deliberately no eviction: a client that
//! disappears leaves a permanent entry (accepted limitation of the
//! protocol, which defines no disconnect).

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::SocketAddr;

use gridclash_grid::{OwnerId, SnapshotId, Tick};

/// Session identifier (server-internal).
pub type SessionId = u64;

/// Per-client connection state.
///
/// Invariant: `last_acked_snapshot <= last_snapshot_sent`.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub endpoint: SocketAddr,
    /// Actor id assigned at registration; what this client paints cells with.
    pub actor_id: OwnerId,
    /// Outgoing sequence counter for messages sent to this endpoint.
    pub sequence: u32,
    /// Id of the snapshot most recently sent to this client.
    pub last_snapshot_sent: SnapshotId,
    /// Monotonic ack cursor; the delta base for this client.
    pub last_acked_snapshot: SnapshotId,
    pub registered_at_tick: Tick,
}

impl Session {
    fn new(id: SessionId, endpoint: SocketAddr, actor_id: OwnerId, tick: Tick) -> Self {
        Self {
            id,
            endpoint,
            actor_id,
            sequence: 0,
            last_snapshot_sent: 0,
            last_acked_snapshot: 0,
            registered_at_tick: tick,
        }
    }

    /// Whether this client has acknowledged its previously sent snapshot.
    pub fn is_caught_up(&self) -> bool {
        self.last_acked_snapshot == self.last_snapshot_sent
    }

    /// Advance and return the outgoing sequence number.
    pub fn next_sequence(&mut self) -> u32 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }
}

/// Endpoint-keyed session table with idempotent registration.
#[derive(Debug)]
pub struct SessionTracker {
    sessions: HashMap<SocketAddr, Session>,
    next_session_id: SessionId,
    /// Count of registrations so far; actor ids cycle 1..=max_actors.
    registrations: u32,
    max_actors: u32,
}

impl SessionTracker {
    pub fn new(max_actors: u32) -> Self {
        assert!(max_actors > 0, "max_actors must be positive");
        Self {
            sessions: HashMap::new(),
            next_session_id: 1,
            registrations: 0,
            max_actors,
        }
    }

    /// Return the session for `endpoint`, creating one if absent.
    ///
    /// Idempotent: a repeated INIT from the same endpoint returns the
    /// existing session with its counters and ack cursor intact.
    pub fn register_or_refresh(&mut self, endpoint: SocketAddr, tick: Tick) -> &mut Session {
        match self.sessions.entry(endpoint) {
            Entry::Occupied(existing) => existing.into_mut(),
            Entry::Vacant(slot) => {
                let id = self.next_session_id;
                self.next_session_id += 1;

                let actor_id = (self.registrations % self.max_actors) + 1;
                self.registrations += 1;

                slot.insert(Session::new(id, endpoint, actor_id, tick))
            }
        }
    }

    /// Record a snapshot acknowledgment from `endpoint`.
    ///
    /// The cursor is monotonic: an ack for an older snapshot than already
    /// recorded is ignored. An ack claiming an id above anything sent to
    /// this session (corrupt or forged) is clamped to `last_snapshot_sent`
    /// so the session invariant holds. Acks from unknown endpoints are
    /// dropped.
    pub fn record_ack(&mut self, endpoint: SocketAddr, snapshot_id: SnapshotId) {
        if let Some(session) = self.sessions.get_mut(&endpoint) {
            let acked = snapshot_id.min(session.last_snapshot_sent);
            session.last_acked_snapshot = session.last_acked_snapshot.max(acked);
        }
    }

    pub fn get(&self, endpoint: &SocketAddr) -> Option<&Session> {
        self.sessions.get(endpoint)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
