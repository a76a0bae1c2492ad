//! Neighbor records and the shared hold-time sweep.
//!
//! Each concrete protocol keeps its own richer [`NeighborTable`], but also
//! records every neighbor in the generic ledger of its
//! [`ProtocolState`](crate::ProtocolState). Expiry is decided from that ledger
//! by [`sweep_expired`], so every protocol times neighbors out the same way.

use crate::{state::ProtocolState, time::SimTime};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt::Display, time::Duration};

/// The identity key of a neighbor, unique within one protocol instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NeighborId(String);

impl NeighborId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NeighborId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NeighborId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Display for NeighborId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A neighbor as a protocol sees it. `T` carries the protocol-specific details.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor<T> {
    pub id: NeighborId,
    /// The local interface the neighbor was heard on.
    pub interface: String,
    pub first_seen: SimTime,
    pub last_seen: SimTime,
    pub hold_time: Duration,
    pub info: T,
}

impl<T> Neighbor<T> {
    /// Seconds left before the entry expires, as shown by `show` commands.
    pub fn remaining(&self, now: SimTime) -> Duration {
        self.hold_time
            .saturating_sub(now.saturating_since(self.last_seen))
    }

    pub fn is_expired(&self, now: SimTime) -> bool {
        now.saturating_since(self.last_seen) > self.hold_time
    }
}

/// What [`NeighborTable::observe`] did with an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// The neighbor was not in the table.
    Discovered,
    /// The neighbor was known but its details or interface changed.
    Updated,
    /// Only the last-seen time moved.
    Refreshed,
}

impl Observation {
    /// Whether the observation changed anything derived data depends on.
    pub fn is_table_change(self) -> bool {
        !matches!(self, Observation::Refreshed)
    }
}

#[derive(Debug, Clone)]
pub struct NeighborTable<T> {
    entries: BTreeMap<NeighborId, Neighbor<T>>,
}

impl<T> Default for NeighborTable<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T: PartialEq> NeighborTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or refreshes the entry for `id`.
    pub fn observe(
        &mut self,
        id: NeighborId,
        interface: &str,
        info: T,
        hold_time: Duration,
        now: SimTime,
    ) -> Observation {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.last_seen = now;
                entry.hold_time = hold_time;
                if entry.info != info || entry.interface != interface {
                    entry.info = info;
                    entry.interface = interface.to_string();
                    Observation::Updated
                } else {
                    Observation::Refreshed
                }
            }
            None => {
                self.entries.insert(
                    id.clone(),
                    Neighbor {
                        id,
                        interface: interface.to_string(),
                        first_seen: now,
                        last_seen: now,
                        hold_time,
                        info,
                    },
                );
                Observation::Discovered
            }
        }
    }
}

impl<T> NeighborTable<T> {
    pub fn get(&self, id: &NeighborId) -> Option<&Neighbor<T>> {
        self.entries.get(id)
    }

    pub fn remove(&mut self, id: &NeighborId) -> Option<Neighbor<T>> {
        self.entries.remove(id)
    }

    pub fn contains(&self, id: &NeighborId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Neighbor<T>> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) -> Vec<Neighbor<T>> {
        std::mem::take(&mut self.entries).into_values().collect()
    }
}

/// Removes every neighbor whose last activity is more than `hold_time` before
/// `now` from the ledger of `state` and returns their IDs in order.
///
/// Removing entries marks `state` changed. Calling this again with the same
/// arguments removes nothing.
pub fn sweep_expired(state: &mut ProtocolState, now: SimTime, hold_time: Duration) -> Vec<NeighborId> {
    let mut expired: Vec<NeighborId> = state
        .neighbors()
        .filter(|(_, last_seen)| now.saturating_since(*last_seen) > hold_time)
        .map(|(id, _)| id.clone())
        .collect();
    expired.sort();
    for id in expired.iter() {
        state.remove_neighbor(id);
    }
    expired
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOLD: Duration = Duration::from_secs(180);

    #[test]
    fn sweep_removes_only_expired_neighbors() {
        let mut state = ProtocolState::new();
        state.record_neighbor_activity("old".into(), SimTime::ZERO);
        state.record_neighbor_activity("fresh".into(), SimTime::from_secs(100));
        state.clear_changed();

        let expired = sweep_expired(&mut state, SimTime::from_secs(181), HOLD);
        assert_eq!(expired, vec![NeighborId::from("old")]);
        assert!(state.is_changed());
        assert_eq!(state.neighbor_count(), 1);
        assert!(state.last_seen(&"fresh".into()).is_some());

        state.clear_changed();
        assert!(sweep_expired(&mut state, SimTime::from_secs(181), HOLD).is_empty());
        assert!(!state.is_changed());
    }

    #[test]
    fn hold_time_boundary_is_exclusive() {
        let mut state = ProtocolState::new();
        state.record_neighbor_activity("r2".into(), SimTime::ZERO);
        assert!(sweep_expired(&mut state, SimTime::from_secs(179), HOLD).is_empty());
        assert!(sweep_expired(&mut state, SimTime::from_secs(180), HOLD).is_empty());
        assert_eq!(sweep_expired(&mut state, SimTime::from_secs(181), HOLD).len(), 1);
    }

    #[test]
    fn observe_distinguishes_updates_from_refreshes() {
        let mut table = NeighborTable::new();
        let id = NeighborId::from("r2:Gi0/0");
        assert_eq!(
            table.observe(id.clone(), "Gi0/1", "IOS", HOLD, SimTime::ZERO),
            Observation::Discovered
        );
        assert_eq!(
            table.observe(id.clone(), "Gi0/1", "IOS", HOLD, SimTime::from_secs(60)),
            Observation::Refreshed
        );
        assert_eq!(
            table.observe(id.clone(), "Gi0/2", "IOS", HOLD, SimTime::from_secs(120)),
            Observation::Updated
        );
        let entry = table.get(&id).unwrap();
        assert_eq!(entry.first_seen, SimTime::ZERO);
        assert_eq!(entry.remaining(SimTime::from_secs(150)), Duration::from_secs(150));
        assert!(!entry.is_expired(SimTime::from_secs(300)));
        assert!(entry.is_expired(SimTime::from_secs(301)));
    }
}
