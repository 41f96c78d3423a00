//! The locally materialized content location database.
//!
//! Maps every known [`ContentHash`] to its size, last access time, and the
//! set of machines holding it, with ordered enumeration by hash. The
//! database is an in-memory materialized view: the authoritative state is
//! the event stream plus periodic checkpoints, and a node can always be
//! rebuilt by restoring a checkpoint and replaying events from its sequence
//! point.
//!
//! # Write gating
//!
//! Only the master role applies events to its database; workers are carried
//! forward by checkpoint restores. The gate is the `writeable` flag: all
//! mutating operations fail with a precondition error while it is off.
//! Snapshot installation deliberately bypasses the gate, because restores
//! happen on every role.
//!
//! # Corruption
//!
//! A corrupted snapshot or inconsistent internal state is reported through a
//! one-shot callback installed by the owning store, which reacts by forcing
//! a checkpoint restore.

use crate::cluster::ClusterSnapshot;
use crate::error::{LocusError, Result};
use crate::types::{
    ContentHash, ContentLocationEntry, HashWithSize, MachineId, UnixSeconds,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Counters describing database activity since startup.
#[derive(Debug, Clone, Default)]
pub struct DatabaseStats {
    pub adds_applied: u64,
    pub removes_applied: u64,
    pub touches_applied: u64,
    pub entries_compacted: u64,
    pub entries: usize,
}

type CorruptionHook = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Serialize, Deserialize)]
struct DatabaseSnapshot {
    entries: BTreeMap<ContentHash, ContentLocationEntry>,
    cluster: Option<ClusterSnapshot>,
}

struct DatabaseInner {
    entries: BTreeMap<ContentHash, ContentLocationEntry>,
    cluster: Option<ClusterSnapshot>,
}

/// Content location index with ordered enumeration by hash.
pub struct ContentLocationDatabase {
    inner: RwLock<DatabaseInner>,
    writeable: AtomicBool,
    corruption_hook: Mutex<Option<CorruptionHook>>,
    adds_applied: AtomicU64,
    removes_applied: AtomicU64,
    touches_applied: AtomicU64,
    entries_compacted: AtomicU64,
}

impl ContentLocationDatabase {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(DatabaseInner {
                entries: BTreeMap::new(),
                cluster: None,
            }),
            writeable: AtomicBool::new(false),
            corruption_hook: Mutex::new(None),
            adds_applied: AtomicU64::new(0),
            removes_applied: AtomicU64::new(0),
            touches_applied: AtomicU64::new(0),
            entries_compacted: AtomicU64::new(0),
        }
    }

    /// Mark the database writeable. Only the master role writes.
    pub fn set_writeable(&self, writeable: bool) {
        let was = self.writeable.swap(writeable, Ordering::AcqRel);
        if was != writeable {
            info!(writeable, "content location database write mode changed");
        }
    }

    pub fn is_writeable(&self) -> bool {
        self.writeable.load(Ordering::Acquire)
    }

    /// Install the one-shot corruption callback.
    pub fn set_corruption_hook(&self, hook: CorruptionHook) {
        *self.corruption_hook.lock() = Some(hook);
    }

    /// Signal that the database state is corrupted. Fires the installed
    /// hook at most once; later reports only log.
    pub fn report_corruption(&self, reason: &str) {
        warn!(reason, "content location database reported corruption");
        if let Some(hook) = self.corruption_hook.lock().take() {
            hook(reason);
        }
    }

    /// Look up a single entry.
    pub fn get(&self, hash: &ContentHash) -> Option<ContentLocationEntry> {
        self.inner.read().entries.get(hash).cloned()
    }

    /// Look up a batch of entries, preserving input order. `None` marks a
    /// hash not present in the local view.
    pub fn get_bulk(&self, hashes: &[ContentHash]) -> Vec<Option<ContentLocationEntry>> {
        let inner = self.inner.read();
        hashes.iter().map(|h| inner.entries.get(h).cloned()).collect()
    }

    /// Apply an Add: set the machine's bit for each hash, creating entries
    /// as needed. `touch` advances the last access time; without it a
    /// pre-existing entry keeps its timestamp.
    pub fn apply_add(
        &self,
        machine: MachineId,
        entries: &[HashWithSize],
        touch: bool,
        now: UnixSeconds,
    ) -> Result<()> {
        self.check_writeable()?;
        let mut inner = self.inner.write();
        for item in entries {
            let entry = inner
                .entries
                .entry(item.hash)
                .or_insert_with(|| ContentLocationEntry::new(item.size, now));
            entry.size = item.size;
            if touch {
                entry.last_access_utc = entry.last_access_utc.max(now);
            }
            entry.locations.insert(machine);
        }
        self.adds_applied
            .fetch_add(entries.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Apply a Remove: clear the machine's bit for each hash. Entries that
    /// end up with no locations stay until TTL compaction claims them.
    pub fn apply_remove(&self, machine: MachineId, hashes: &[ContentHash]) -> Result<()> {
        self.check_writeable()?;
        let mut inner = self.inner.write();
        for hash in hashes {
            if let Some(entry) = inner.entries.get_mut(hash) {
                entry.locations.remove(machine);
            }
        }
        self.removes_applied
            .fetch_add(hashes.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Apply a Touch: advance last access for existing entries. Timestamps
    /// never move backwards.
    pub fn apply_touch(&self, hashes: &[ContentHash], at: UnixSeconds) -> Result<()> {
        self.check_writeable()?;
        let mut inner = self.inner.write();
        for hash in hashes {
            if let Some(entry) = inner.entries.get_mut(hash) {
                entry.last_access_utc = entry.last_access_utc.max(at);
            }
        }
        self.touches_applied
            .fetch_add(hashes.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Remove entries whose last access is older than `expiry_secs`.
    pub fn compact_expired(&self, now: UnixSeconds, expiry_secs: i64) -> Result<usize> {
        self.check_writeable()?;
        let mut inner = self.inner.write();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, entry| entry.last_access_utc + expiry_secs >= now);
        let removed = before - inner.entries.len();
        if removed > 0 {
            debug!(removed, "compacted expired location entries");
            self.entries_compacted
                .fetch_add(removed as u64, Ordering::Relaxed);
        }
        Ok(removed)
    }

    /// Sorted page of `(hash, size)` for entries naming `machine`, starting
    /// strictly after `from`. Used by reconciliation to co-walk the local
    /// inventory against this view.
    pub fn entries_for_machine_page(
        &self,
        machine: MachineId,
        from: Option<ContentHash>,
        limit: usize,
    ) -> Vec<HashWithSize> {
        let inner = self.inner.read();
        let range = match from {
            Some(start) => inner
                .entries
                .range((Bound::Excluded(start), Bound::Unbounded)),
            None => inner.entries.range(..),
        };
        range
            .filter(|(_, entry)| entry.locations.contains(machine))
            .take(limit)
            .map(|(hash, entry)| HashWithSize {
                hash: *hash,
                size: entry.size,
            })
            .collect()
    }

    /// Serialize the full database for checkpointing.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let inner = self.inner.read();
        let snapshot = DatabaseSnapshot {
            entries: inner.entries.clone(),
            cluster: inner.cluster.clone(),
        };
        Ok(bincode::serialize(&snapshot)?)
    }

    /// Atomically replace the database contents from a serialized snapshot.
    /// Works on every role; restores are how workers advance. A snapshot
    /// that fails to decode is reported as corruption.
    pub fn install_snapshot(&self, bytes: &[u8]) -> Result<()> {
        let snapshot: DatabaseSnapshot = match bincode::deserialize(bytes) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let reason = format!("undecodable snapshot: {}", e);
                self.report_corruption(&reason);
                return Err(LocusError::Corruption(reason));
            }
        };
        let mut inner = self.inner.write();
        inner.entries = snapshot.entries;
        inner.cluster = snapshot.cluster;
        info!(entries = inner.entries.len(), "installed database snapshot");
        Ok(())
    }

    /// Persist the cluster view alongside the location entries so that
    /// checkpoints carry it.
    pub fn store_cluster_snapshot(&self, snapshot: ClusterSnapshot) -> Result<()> {
        self.check_writeable()?;
        self.inner.write().cluster = Some(snapshot);
        Ok(())
    }

    /// The cluster view carried by the last installed snapshot, if any.
    pub fn cluster_snapshot(&self) -> Option<ClusterSnapshot> {
        self.inner.read().cluster.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            adds_applied: self.adds_applied.load(Ordering::Relaxed),
            removes_applied: self.removes_applied.load(Ordering::Relaxed),
            touches_applied: self.touches_applied.load(Ordering::Relaxed),
            entries_compacted: self.entries_compacted.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    fn check_writeable(&self) -> Result<()> {
        if self.is_writeable() {
            Ok(())
        } else {
            Err(LocusError::Precondition(
                "content location database is not writeable on this role".to_string(),
            ))
        }
    }
}

impl Default for ContentLocationDatabase {
    fn default() -> Self {
        Self::new()
    }
}
