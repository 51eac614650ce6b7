//! GridClash Authoritative State Core
//!
//! This crate contains the authoritative grid-ownership state and the
//! snapshot/delta machinery built on top of it. It is the single source of
//! truth for cell ownership.
//!
//! # Architecture Constraints
//!
//! This crate MUST NOT:
//! - Perform I/O operations (file, network, etc.)
//! - Read wall-clock time
//!
//! Time enters only as an explicit tick parameter; everything else (sockets,
//! timestamps, scheduling) is owned by the server and client edges.

#![deny(unsafe_code)]

use std::collections::BTreeMap;
use std::collections::VecDeque;

// ============================================================================
// Type Aliases
// ============================================================================

/// A single broadcast tick; the atomic unit of server time.
pub type Tick = u64;

/// Owner of a cell. `0` means unowned and is never a valid actor id.
pub type OwnerId = u32;

/// Snapshot identifier. Assigned only by the server, strictly increasing,
/// never reused. `0` is reserved for "no snapshot" (the resync sentinel).
pub type SnapshotId = u32;

/// The unowned owner value.
pub const UNOWNED: OwnerId = 0;

// ============================================================================
// Core Types
// ============================================================================

/// A cell coordinate on the grid.
///
/// Ordered row-major so that map iteration over cells is deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellCoord {
    pub row: u16,
    pub col: u16,
}

impl CellCoord {
    pub fn new(row: u16, col: u16) -> Self {
        Self { row, col }
    }
}

/// Outcome of an acquire attempt.
///
/// Rejections are protocol-expected conditions, not errors: the server
/// applies or drops the intent and the next snapshot is the client's only
/// signal either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Cell was unowned and is now owned by the actor.
    Acquired,
    /// Cell is already owned; grid unchanged.
    AlreadyOwned { owner: OwnerId },
    /// Coordinate is outside the configured grid dimensions.
    OutOfBounds,
    /// Actor id was `0` (reserved for unowned).
    InvalidActor,
}

impl AcquireOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired)
    }
}

// ============================================================================
// GridState
// ============================================================================

/// Mapping from cell coordinate to owner id. Mutated only through the
/// validated [`GridState::acquire`] transition: a cell's owner never
/// reverts to unowned once set.
///
/// Unowned cells are simply absent from the map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridState {
    rows: u16,
    cols: u16,
    cells: BTreeMap<CellCoord, OwnerId>,
}

impl GridState {
    /// Create a fully-unowned grid of the given dimensions.
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            rows,
            cols,
            cells: BTreeMap::new(),
        }
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }

    pub fn cols(&self) -> u16 {
        self.cols
    }

    /// Owner of a cell, [`UNOWNED`] if nobody has acquired it.
    pub fn owner(&self, cell: CellCoord) -> OwnerId {
        self.cells.get(&cell).copied().unwrap_or(UNOWNED)
    }

    /// Number of owned cells.
    pub fn owned_count(&self) -> usize {
        self.cells.len()
    }

    /// Iterate owned cells in deterministic (row-major) order.
    pub fn owned_cells(&self) -> impl Iterator<Item = (CellCoord, OwnerId)> + '_ {
        self.cells.iter().map(|(&cell, &owner)| (cell, owner))
    }

    /// Attempt the acquire transition: the target cell must be in bounds,
    /// currently unowned, and the actor id must be nonzero.
    pub fn acquire(&mut self, cell: CellCoord, actor: OwnerId) -> AcquireOutcome {
        if actor == UNOWNED {
            return AcquireOutcome::InvalidActor;
        }
        if cell.row >= self.rows || cell.col >= self.cols {
            return AcquireOutcome::OutOfBounds;
        }
        match self.cells.get(&cell) {
            Some(&owner) => AcquireOutcome::AlreadyOwned { owner },
            None => {
                self.cells.insert(cell, actor);
                AcquireOutcome::Acquired
            }
        }
    }

    /// Apply a patch to this (client-local) representation.
    ///
    /// Full replaces the entire cell map; Delta merges only the listed
    /// cells. This is the `apply(StatePatch)` call the presentation layer
    /// consumes.
    pub fn apply(&mut self, patch: &StatePatch) {
        match patch.mode {
            PatchMode::Full => {
                self.cells = patch.cells.clone();
            }
            PatchMode::Delta => {
                for (&cell, &owner) in &patch.cells {
                    self.cells.insert(cell, owner);
                }
            }
        }
    }

    fn cells(&self) -> &BTreeMap<CellCoord, OwnerId> {
        &self.cells
    }
}

// ============================================================================
// Snapshot & StatePatch
// ============================================================================

/// An immutable capture of the grid's ownership state at one server tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub captured_at_tick: Tick,
    cells: BTreeMap<CellCoord, OwnerId>,
}

impl Snapshot {
    pub fn owner(&self, cell: CellCoord) -> OwnerId {
        self.cells.get(&cell).copied().unwrap_or(UNOWNED)
    }
}

/// Whether a patch carries the whole state or only changed cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchMode {
    Full,
    Delta,
}

/// The unit of state transfer: either the entire grid (resync) or the set
/// of cells whose owner changed since an agreed base snapshot.
///
/// An empty Delta is a valid patch (no change) and is distinct from Full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePatch {
    pub mode: PatchMode,
    pub cells: BTreeMap<CellCoord, OwnerId>,
}

impl StatePatch {
    pub fn full(cells: BTreeMap<CellCoord, OwnerId>) -> Self {
        Self {
            mode: PatchMode::Full,
            cells,
        }
    }

    pub fn delta(cells: BTreeMap<CellCoord, OwnerId>) -> Self {
        Self {
            mode: PatchMode::Delta,
            cells,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

// ============================================================================
// SnapshotHistory
// ============================================================================

/// Default bounded history capacity (the most recent K snapshots).
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Bounded, time-ordered record of past full grid states keyed by snapshot
/// id. Oldest entries are evicted first; once an id has aged out it can no
/// longer serve as a delta base and the resync path takes over.
///
/// Deltas are computed as a set difference against a single remembered
/// base, not as a chain of incremental diffs, so the history retains full
/// grid snapshots rather than patches.
#[derive(Debug, Clone)]
pub struct SnapshotHistory {
    capacity: usize,
    next_id: SnapshotId,
    entries: VecDeque<Snapshot>,
}

impl SnapshotHistory {
    /// Create an empty history with the given capacity.
    ///
    /// # Panics
    /// If `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "history capacity must be positive");
        Self {
            capacity,
            next_id: 1,
            entries: VecDeque::new(),
        }
    }

    /// Capture the current grid state as a new snapshot, assigning the next
    /// strictly-increasing id and evicting the oldest entry if the capacity
    /// is exceeded. Returns the new snapshot's id.
    pub fn capture(&mut self, state: &GridState, tick: Tick) -> SnapshotId {
        let id = self.next_id;
        self.next_id += 1;

        self.entries.push_back(Snapshot {
            id,
            captured_at_tick: tick,
            cells: state.cells().clone(),
        });
        if self.entries.len() > self.capacity {
            self.entries.pop_front();
        }

        id
    }

    /// Id of the most recently captured snapshot, `0` if none.
    pub fn latest_id(&self) -> SnapshotId {
        self.entries.back().map_or(0, |s| s.id)
    }

    /// Look up a snapshot by id.
    pub fn get(&self, id: SnapshotId) -> Option<&Snapshot> {
        self.entries.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compute the patch that brings a client holding `base_id` up to
    /// `current`.
    ///
    /// Returns Full with the entire current state when `base_id` is `0` or
    /// absent from history (evicted, or never captured): the resync path.
    /// Otherwise returns Delta with exactly the cells whose owner differs
    /// between the base snapshot and the current state.
    pub fn delta(&self, base_id: SnapshotId, current: &GridState) -> StatePatch {
        let Some(base) = (base_id != 0).then(|| self.get(base_id)).flatten() else {
            return StatePatch::full(current.cells().clone());
        };

        let mut changed = BTreeMap::new();
        for (&cell, &owner) in current.cells() {
            if base.owner(cell) != owner {
                changed.insert(cell, owner);
            }
        }
        // Owners never revert to unowned, so cells present in the base are
        // always present in the current state; no reverse scan needed.
        StatePatch::delta(changed)
    }
}

// ============================================================================
// Tests
// ============================================================================
