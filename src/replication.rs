//! Proactive replication of under-replicated content.
//!
//! After the first checkpoint restore a node knows, with bounded staleness,
//! how well replicated its content is. Content the node used recently but
//! few other machines hold is worth pushing out before it is wanted, so the
//! driver walks local content through the eviction ordering in reverse
//! (best replication targets are the candidates we would evict last) and
//! invokes the externally supplied copy function for entries below the
//! replica threshold.
//!
//! At most one replication pass is in flight per node; starting a new pass
//! cancels the previous one through its cancellation token. Successive
//! copies are paced by a configurable delay and the pass stops after a
//! fixed number of outcomes, successes and failures alike.

use crate::cluster::ClusterState;
use crate::config::{EvictionConfig, ProactiveReplicationConfig};
use crate::database::ContentLocationDatabase;
use crate::error::{LocusError, Result};
use crate::eviction::order_for_eviction;
use crate::reconcile::LocalContentStore;
use crate::reputation::MachineReputationTracker;
use crate::types::{ContentHash, HashWithLastAccess, MachineId, MachineLocation};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Copies a blob from this machine to peers. Supplied by the embedding
/// content store; transfer mechanics are out of scope here.
#[async_trait]
pub trait ProactiveCopier: Send + Sync {
    /// Replicate the blob somewhere else. `current_locations` lists the
    /// machines already holding it, best reputation first.
    async fn copy(
        &self,
        hash: ContentHash,
        size: u64,
        current_locations: &[MachineLocation],
    ) -> Result<()>;
}

/// Counters describing replication activity since startup.
#[derive(Debug, Clone, Default)]
pub struct ReplicationStats {
    pub copies_attempted: u64,
    pub copies_succeeded: u64,
    pub copies_failed: u64,
    pub candidates_skipped: u64,
}

#[derive(Default)]
pub(crate) struct ReplicationCounters {
    attempted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

impl ReplicationCounters {
    pub fn snapshot(&self) -> ReplicationStats {
        ReplicationStats {
            copies_attempted: self.attempted.load(Ordering::Relaxed),
            copies_succeeded: self.succeeded.load(Ordering::Relaxed),
            copies_failed: self.failed.load(Ordering::Relaxed),
            candidates_skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// One proactive replication pass.
pub(crate) struct ReplicationRun {
    pub db: Arc<ContentLocationDatabase>,
    pub content: Arc<dyn LocalContentStore>,
    pub copier: Arc<dyn ProactiveCopier>,
    pub cluster: Arc<ClusterState>,
    pub reputation: Arc<MachineReputationTracker>,
    pub machine: MachineId,
    pub config: ProactiveReplicationConfig,
    pub eviction: EvictionConfig,
    pub counters: Arc<ReplicationCounters>,
    pub cancel: watch::Receiver<bool>,
}

impl ReplicationRun {
    /// Returns the number of copy outcomes.
    pub async fn run(mut self) -> Result<usize> {
        let mut inventory = self.content.inventory().await?;
        inventory.sort_by(|a, b| b.last_access_utc.cmp(&a.last_access_utc));

        let candidates: Vec<HashWithLastAccess> = inventory
            .iter()
            .map(|info| HashWithLastAccess {
                hash: info.hash,
                last_access_utc: info.last_access_utc,
            })
            .collect();

        let now = Utc::now().timestamp();
        let stream = order_for_eviction(
            Arc::clone(&self.db),
            candidates,
            self.eviction.clone(),
            true,
            now,
        );

        let mut outcomes = 0;
        for candidate in stream {
            self.check_cancelled()?;
            if outcomes >= self.config.copy_limit {
                break;
            }

            let entry = self.db.get(&candidate.hash);
            let replicas = entry.as_ref().map(|e| e.replica_count()).unwrap_or(0);
            if replicas >= self.config.locations_threshold {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let locations = entry
                .map(|e| {
                    self.reputation
                        .order_locations(&e.locations, &self.cluster, Some(self.machine))
                })
                .unwrap_or_default();

            self.counters.attempted.fetch_add(1, Ordering::Relaxed);
            match self
                .copier
                .copy(candidate.hash, candidate.size, &locations)
                .await
            {
                Ok(()) => {
                    self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                    debug!(hash = ?candidate.hash, replicas, "proactively replicated");
                }
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(hash = ?candidate.hash, error = %e, "proactive copy failed");
                }
            }
            outcomes += 1;

            if outcomes < self.config.copy_limit {
                self.pace().await?;
            }
        }
        Ok(outcomes)
    }

    async fn pace(&mut self) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(self.config.delay) => Ok(()),
            _ = self.cancel.changed() => self.check_cancelled(),
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if *self.cancel.borrow() {
            Err(LocusError::Cancelled("replication pass superseded".into()))
        } else {
            Ok(())
        }
    }
}
