//! The framework-visible record of a protocol instance.

use crate::{neighbor::NeighborId, time::SimTime};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

/// Where a protocol instance is in its lifecycle.
///
/// `Uninitialized -> Initialized -> {Active, Inactive}`; `Active` and
/// `Inactive` swap as the enabled flag is toggled; `Stopped` is reachable from
/// any state; `Disposed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    Uninitialized,
    Initialized,
    Active,
    Inactive,
    Stopped,
    Disposed,
}

/// Mutable state shared by every protocol: an activity flag, a dirty flag, and
/// a generic last-seen ledger of neighbors.
///
/// The dirty flag is set by every mutation that should trigger a
/// recalculation and is cleared by the framework after the calculation runs.
/// Refreshing the last-seen time of a neighbor that is already known is not
/// such a mutation.
#[derive(Debug, Clone, Default)]
pub struct ProtocolState {
    active: bool,
    changed: bool,
    neighbor_activity: FxHashMap<NeighborId, SimTime>,
}

impl ProtocolState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        if self.active != active {
            self.active = active;
            self.changed = true;
        }
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn mark_changed(&mut self) {
        self.changed = true;
    }

    pub(crate) fn clear_changed(&mut self) {
        self.changed = false;
    }

    /// Records that `neighbor` was heard from at `at`. Returns `true` if the
    /// neighbor was not in the ledger before.
    pub fn record_neighbor_activity(&mut self, neighbor: NeighborId, at: SimTime) -> bool {
        let known = self.neighbor_activity.insert(neighbor, at).is_some();
        if !known {
            self.changed = true;
        }
        !known
    }

    pub fn remove_neighbor(&mut self, neighbor: &NeighborId) -> Option<SimTime> {
        let removed = self.neighbor_activity.remove(neighbor);
        if removed.is_some() {
            self.changed = true;
        }
        removed
    }

    pub fn clear_neighbors(&mut self) {
        if !self.neighbor_activity.is_empty() {
            self.neighbor_activity.clear();
            self.changed = true;
        }
    }

    pub fn last_seen(&self, neighbor: &NeighborId) -> Option<SimTime> {
        self.neighbor_activity.get(neighbor).copied()
    }

    pub fn neighbors(&self) -> impl Iterator<Item = (&NeighborId, SimTime)> {
        self.neighbor_activity.iter().map(|(id, seen)| (id, *seen))
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbor_activity.len()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            active: self.active,
            changed: self.changed,
            neighbors: self
                .neighbor_activity
                .iter()
                .map(|(id, seen)| (id.clone(), *seen))
                .collect(),
        }
    }
}

/// A point-in-time copy of a [`ProtocolState`], for CLI and monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub active: bool,
    pub changed: bool,
    pub neighbors: BTreeMap<NeighborId, SimTime>,
}
