//! In-memory cluster state.
//!
//! Tracks the mapping between dense machine ids and network locations,
//! which machines are currently active, and the monotonic id watermark.
//! The authoritative mapping lives in the global store; this view is
//! refreshed on every heartbeat and from the copy embedded in checkpoints.
//!
//! Ids are never reused: `max_machine_id` only moves forward, and a record,
//! once learned, is only ever replaced by a newer record for the same id.

use crate::types::{MachineId, MachineLocation, MachineSet};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// A machine known to the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMachine {
    pub id: MachineId,
    pub location: MachineLocation,
    pub active: bool,
}

/// Persistable view of the cluster, embedded in database checkpoints and
/// exchanged with the global store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub machines: Vec<ClusterMachine>,
    pub max_machine_id: MachineId,
}

/// Our half of the heartbeat cluster-state exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStateUpdate {
    /// Our machine id, if the global store has assigned one yet.
    pub machine_id: Option<MachineId>,
    /// Our network location.
    pub location: MachineLocation,
    /// Highest machine id we have observed.
    pub max_machine_id: MachineId,
}

/// The global store's half of the exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStateResponse {
    /// The id assigned to the caller.
    pub assigned_machine_id: MachineId,
    /// The directory's current view.
    pub snapshot: ClusterSnapshot,
}

struct ClusterInner {
    machines: HashMap<MachineId, MachineRecord>,
    max_machine_id: MachineId,
    last_inactive_time: Option<DateTime<Utc>>,
}

#[derive(Clone)]
struct MachineRecord {
    location: MachineLocation,
    active: bool,
}

/// Read-mostly shared view of the cluster. Writes are serialized through
/// the owning location store.
pub struct ClusterState {
    local_location: MachineLocation,
    /// 0 means "not yet assigned".
    local_machine_id: AtomicU32,
    inner: RwLock<ClusterInner>,
}

impl ClusterState {
    pub fn new(local_location: MachineLocation) -> Self {
        Self {
            local_location,
            local_machine_id: AtomicU32::new(0),
            inner: RwLock::new(ClusterInner {
                machines: HashMap::new(),
                max_machine_id: 0,
                last_inactive_time: None,
            }),
        }
    }

    pub fn local_location(&self) -> &MachineLocation {
        &self.local_location
    }

    /// Our machine id, once the global store has assigned one.
    pub fn local_machine_id(&self) -> Option<MachineId> {
        match self.local_machine_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Resolve a machine id to its network location.
    pub fn resolve(&self, machine: MachineId) -> Option<MachineLocation> {
        self.inner.read().machines.get(&machine).map(|r| r.location.clone())
    }

    /// Resolve every machine in the set, collecting ids that are unknown to
    /// this view. Unknown ids mean the view is stale and should be
    /// refreshed from the global store.
    pub fn resolve_set(&self, set: &MachineSet) -> (Vec<MachineLocation>, Vec<MachineId>) {
        let inner = self.inner.read();
        let mut resolved = Vec::new();
        let mut unknown = Vec::new();
        for machine in set.iter() {
            match inner.machines.get(&machine) {
                Some(record) => resolved.push(record.location.clone()),
                None => unknown.push(machine),
            }
        }
        (resolved, unknown)
    }

    /// Mark a machine active, typically because an event from it was
    /// observed. Unknown ids are ignored; the next refresh will learn them.
    pub fn mark_active(&self, machine: MachineId) {
        let mut inner = self.inner.write();
        if let Some(record) = inner.machines.get_mut(&machine) {
            record.active = true;
        }
    }

    /// Highest machine id ever observed.
    pub fn max_machine_id(&self) -> MachineId {
        self.inner.read().max_machine_id
    }

    /// When this machine was last reported inactive by the directory.
    pub fn last_inactive_time(&self) -> Option<DateTime<Utc>> {
        self.inner.read().last_inactive_time
    }

    /// Build our half of the heartbeat exchange.
    pub fn to_update(&self) -> ClusterStateUpdate {
        ClusterStateUpdate {
            machine_id: self.local_machine_id(),
            location: self.local_location.clone(),
            max_machine_id: self.max_machine_id(),
        }
    }

    /// Merge the directory's response from a heartbeat exchange.
    pub fn apply_response(&self, response: &ClusterStateResponse, now: DateTime<Utc>) {
        let previous = self.local_machine_id.swap(response.assigned_machine_id, Ordering::AcqRel);
        if previous != 0 && previous != response.assigned_machine_id {
            debug!(
                previous,
                assigned = response.assigned_machine_id,
                "local machine id changed"
            );
        }
        self.merge_snapshot(&response.snapshot, now);
    }

    /// Merge a persisted or received snapshot into this view. The id
    /// watermark never regresses.
    pub fn merge_snapshot(&self, snapshot: &ClusterSnapshot, now: DateTime<Utc>) {
        let local_id = self.local_machine_id();
        let mut inner = self.inner.write();
        for machine in &snapshot.machines {
            if Some(machine.id) == local_id && !machine.active {
                inner.last_inactive_time = Some(now);
            }
            inner.machines.insert(
                machine.id,
                MachineRecord {
                    location: machine.location.clone(),
                    active: machine.active,
                },
            );
            inner.max_machine_id = inner.max_machine_id.max(machine.id);
        }
        inner.max_machine_id = inner.max_machine_id.max(snapshot.max_machine_id);
    }

    /// Snapshot this view for persistence in the database.
    pub fn snapshot(&self) -> ClusterSnapshot {
        let inner = self.inner.read();
        let mut machines: Vec<ClusterMachine> = inner
            .machines
            .iter()
            .map(|(id, record)| ClusterMachine {
                id: *id,
                location: record.location.clone(),
                active: record.active,
            })
            .collect();
        machines.sort_by_key(|m| m.id);
        ClusterSnapshot {
            machines,
            max_machine_id: inner.max_machine_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(s: &str) -> MachineLocation {
        MachineLocation::new(s)
    }

    fn snapshot(machines: Vec<(MachineId, &str, bool)>) -> ClusterSnapshot {
        let max = machines.iter().map(|m| m.0).max().unwrap_or(0);
        ClusterSnapshot {
            machines: machines
                .into_iter()
                .map(|(id, l, active)| ClusterMachine {
                    id,
                    location: loc(l),
                    active,
                })
                .collect(),
            max_machine_id: max,
        }
    }

    #[test]
    fn test_resolve_after_merge() {
        let cluster = ClusterState::new(loc("10.0.0.1:7071"));
        cluster.merge_snapshot(&snapshot(vec![(1, "10.0.0.1:7071", true), (2, "10.0.0.2:7071", true)]), Utc::now());

        assert_eq!(cluster.resolve(2), Some(loc("10.0.0.2:7071")));
        assert_eq!(cluster.resolve(3), None);
        assert_eq!(cluster.max_machine_id(), 2);
    }

    #[test]
    fn test_watermark_never_regresses() {
        let cluster = ClusterState::new(loc("a"));
        cluster.merge_snapshot(&snapshot(vec![(5, "e", true)]), Utc::now());
        cluster.merge_snapshot(&snapshot(vec![(2, "b", true)]), Utc::now());
        assert_eq!(cluster.max_machine_id(), 5);
    }

    #[test]
    fn test_resolve_set_reports_unknown() {
        let cluster = ClusterState::new(loc("a"));
        cluster.merge_snapshot(&snapshot(vec![(1, "a", true)]), Utc::now());

        let set: MachineSet = [1, 9].into_iter().collect();
        let (resolved, unknown) = cluster.resolve_set(&set);
        assert_eq!(resolved, vec![loc("a")]);
        assert_eq!(unknown, vec![9]);
    }

    #[test]
    fn test_local_inactive_sets_last_inactive_time() {
        let cluster = ClusterState::new(loc("self"));
        let response = ClusterStateResponse {
            assigned_machine_id: 3,
            snapshot: snapshot(vec![(3, "self", true)]),
        };
        cluster.apply_response(&response, Utc::now());
        assert!(cluster.last_inactive_time().is_none());

        let response = ClusterStateResponse {
            assigned_machine_id: 3,
            snapshot: snapshot(vec![(3, "self", false)]),
        };
        let now = Utc::now();
        cluster.apply_response(&response, now);
        assert_eq!(cluster.last_inactive_time(), Some(now));
    }

    #[test]
    fn test_mark_active_ignores_unknown() {
        let cluster = ClusterState::new(loc("a"));
        cluster.mark_active(42);
        assert_eq!(cluster.resolve(42), None);
    }

    #[test]
    fn test_to_update_carries_assignment() {
        let cluster = ClusterState::new(loc("self"));
        assert_eq!(cluster.to_update().machine_id, None);

        let response = ClusterStateResponse {
            assigned_machine_id: 7,
            snapshot: ClusterSnapshot::default(),
        };
        cluster.apply_response(&response, Utc::now());
        assert_eq!(cluster.to_update().machine_id, Some(7));
        assert_eq!(cluster.local_machine_id(), Some(7));
    }
}
