//! Per-machine reputation tracking.
//!
//! Callers fetching content try candidate locations in the order we return
//! them, so machines that recently failed to serve content are pushed to the
//! back. Reputation is a small non-negative score per machine: zero is a
//! machine in good standing, higher is worse. Successful interactions decay
//! the score back toward zero.

use crate::cluster::ClusterState;
use crate::types::{MachineId, MachineLocation, MachineSet};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::HashMap;

/// Outcome of an interaction with a machine, reported by callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineReputation {
    /// Served content as expected.
    Good,
    /// Claimed the content but did not have it.
    Missing,
    /// Unreachable or misbehaving.
    Bad,
}

impl MachineReputation {
    fn weight(self) -> u32 {
        match self {
            MachineReputation::Good => 0,
            MachineReputation::Missing => 1,
            MachineReputation::Bad => 3,
        }
    }
}

/// Tracks reputation scores used to order candidate locations.
#[derive(Default)]
pub struct MachineReputationTracker {
    scores: RwLock<HashMap<MachineId, u32>>,
}

impl MachineReputationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of an interaction. Good outcomes decay any
    /// accumulated score by one.
    pub fn report(&self, machine: MachineId, reputation: MachineReputation) {
        let mut scores = self.scores.write();
        let entry = scores.entry(machine).or_insert(0);
        match reputation {
            MachineReputation::Good => *entry = entry.saturating_sub(1),
            other => *entry = entry.saturating_add(other.weight()),
        }
    }

    pub fn score(&self, machine: MachineId) -> u32 {
        self.scores.read().get(&machine).copied().unwrap_or(0)
    }

    /// Order the machines of a location set for a caller: the local machine
    /// is dropped, the remainder is shuffled to spread load, then stably
    /// sorted so better-reputed machines come first. Ids the cluster view
    /// cannot resolve are skipped.
    pub fn order_locations(
        &self,
        set: &MachineSet,
        cluster: &ClusterState,
        exclude: Option<MachineId>,
    ) -> Vec<MachineLocation> {
        let mut machines: Vec<MachineId> =
            set.iter().filter(|m| Some(*m) != exclude).collect();
        machines.shuffle(&mut rand::thread_rng());

        let scores = self.scores.read();
        machines.sort_by_key(|m| scores.get(m).copied().unwrap_or(0));
        drop(scores);

        machines
            .into_iter()
            .filter_map(|m| cluster.resolve(m))
            .collect()
    }
}
