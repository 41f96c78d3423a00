//! Reconciliation of the local machine's contribution to the location
//! index.
//!
//! The event stream is lossy under extended disconnection: a machine that
//! was offline while its events aged out of the stream has a database view
//! the rest of the cluster no longer agrees with. Reconciliation re-derives
//! the truth from the local content store and emits compensating Add and
//! Remove batches.
//!
//! Each cycle pauses the main event store's production (consumption keeps
//! running), co-walks the sorted local inventory against the sorted
//! database view for this machine, and emits the difference as a single
//! Reconcile batch through a temporary event store that writes ahead of the
//! paused one. That routing is what guarantees the applier observes the
//! compensating events before anything this node produces after the cycle.
//!
//! A freshness marker on disk short-circuits the whole pass while a recent
//! reconciliation is still valid.

use crate::database::ContentLocationDatabase;
use crate::error::{LocusError, Result};
use crate::events::{EventStore, MemoryEventBus};
use crate::types::{ContentHash, ContentInfo, HashWithSize, MachineId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// The local content store, as reconciliation and proactive replication
/// see it.
#[async_trait]
pub trait LocalContentStore: Send + Sync {
    /// Full inventory of locally held content.
    async fn inventory(&self) -> Result<Vec<ContentInfo>>;
}

/// Name of the freshness marker inside the working directory.
const MARKER_FILE: &str = "reconcileMarker.txt";

/// The marker is valid for this fraction of the location entry expiry.
const MARKER_VALIDITY_FRACTION: f64 = 0.75;

pub(crate) fn marker_path(working_dir: &Path) -> PathBuf {
    working_dir.join(MARKER_FILE)
}

/// Write the freshness marker: `"<prefix>|<rfc3339 timestamp>"`.
pub(crate) async fn write_marker(
    working_dir: &Path,
    prefix: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let path = marker_path(working_dir);
    let content = format!("{}|{}", prefix, now.to_rfc3339());
    tokio::fs::write(&path, content).await?;
    Ok(())
}

/// Remove the freshness marker if present.
pub(crate) async fn clear_marker(working_dir: &Path) -> Result<()> {
    match tokio::fs::remove_file(marker_path(working_dir)).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Whether the marker exists, names the current prefix, and is younger
/// than 0.75 × the location entry expiry. Absence, a prefix mismatch, or
/// an unparseable timestamp all mean "not up to date".
pub(crate) async fn marker_up_to_date(
    working_dir: &Path,
    prefix: &str,
    now: DateTime<Utc>,
    entry_expiry: Duration,
) -> bool {
    let content = match tokio::fs::read_to_string(marker_path(working_dir)).await {
        Ok(content) => content,
        Err(_) => return false,
    };
    let Some((marker_prefix, timestamp)) = content.trim().split_once('|') else {
        return false;
    };
    if marker_prefix != prefix {
        return false;
    }
    let Ok(written) = DateTime::parse_from_rfc3339(timestamp) else {
        return false;
    };
    let validity = entry_expiry.mul_f64(MARKER_VALIDITY_FRACTION);
    let age = now.signed_duration_since(written.with_timezone(&Utc));
    age >= chrono::Duration::zero()
        && age.to_std().map(|age| age <= validity).unwrap_or(false)
}

/// Result of one sorted co-walk, capped at the cycle size.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct SortedDiff {
    pub added: Vec<HashWithSize>,
    pub removed: Vec<ContentHash>,
    /// Every key up to and including this one has been diffed.
    pub last_key: Option<ContentHash>,
    /// Whether both streams were fully consumed.
    pub exhausted: bool,
}

/// Classic two-stream diff over hash-sorted inputs: keys only on the local
/// side become Adds, keys only on the database side become Removes, equal
/// keys drop out. Stops once `cap` differences have accumulated.
pub(crate) fn diff_sorted(
    local: &[HashWithSize],
    stored: &[HashWithSize],
    cap: usize,
) -> SortedDiff {
    let mut diff = SortedDiff::default();
    let mut i = 0;
    let mut j = 0;

    while i < local.len() || j < stored.len() {
        if diff.added.len() + diff.removed.len() >= cap {
            return diff;
        }
        match (local.get(i), stored.get(j)) {
            (Some(l), Some(s)) if l.hash == s.hash => {
                diff.last_key = Some(l.hash);
                i += 1;
                j += 1;
            }
            (Some(l), Some(s)) if l.hash < s.hash => {
                diff.added.push(*l);
                diff.last_key = Some(l.hash);
                i += 1;
            }
            (Some(_), Some(s)) => {
                diff.removed.push(s.hash);
                diff.last_key = Some(s.hash);
                j += 1;
            }
            (Some(l), None) => {
                diff.added.push(*l);
                diff.last_key = Some(l.hash);
                i += 1;
            }
            (None, Some(s)) => {
                diff.removed.push(s.hash);
                diff.last_key = Some(s.hash);
                j += 1;
            }
            (None, None) => unreachable!(),
        }
    }
    diff.exhausted = true;
    diff
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// The marker was fresh and nothing ran.
    pub skipped: bool,
    pub cycles: usize,
    pub hashes_added: usize,
    pub hashes_removed: usize,
}

/// One reconciliation pass over the local machine's contribution.
pub(crate) struct ReconcileRun {
    pub db: Arc<ContentLocationDatabase>,
    pub events: Arc<EventStore>,
    pub bus: Arc<MemoryEventBus>,
    pub content: Arc<dyn LocalContentStore>,
    pub machine: MachineId,
    pub working_dir: PathBuf,
    pub checkpoint_prefix: String,
    pub entry_expiry: Duration,
    pub cycle_frequency: Duration,
    pub max_cycle_size: usize,
    pub cancel: watch::Receiver<bool>,
}

impl ReconcileRun {
    pub async fn run(mut self) -> Result<ReconcileOutcome> {
        let now = Utc::now();
        if marker_up_to_date(&self.working_dir, &self.checkpoint_prefix, now, self.entry_expiry)
            .await
        {
            debug!("reconcile marker is fresh, skipping");
            return Ok(ReconcileOutcome {
                skipped: true,
                ..ReconcileOutcome::default()
            });
        }

        let mut outcome = ReconcileOutcome::default();
        let mut last_processed: Option<ContentHash> = None;

        loop {
            self.check_cancelled()?;

            let diff = self.run_cycle(last_processed).await?;
            outcome.cycles += 1;
            outcome.hashes_added += diff.added.len();
            outcome.hashes_removed += diff.removed.len();
            last_processed = diff.last_key.or(last_processed);

            let diff_size = diff.added.len() + diff.removed.len();
            if diff.exhausted || diff_size < self.max_cycle_size {
                break;
            }

            self.sleep_between_cycles().await?;
        }

        write_marker(&self.working_dir, &self.checkpoint_prefix, Utc::now()).await?;
        info!(
            cycles = outcome.cycles,
            added = outcome.hashes_added,
            removed = outcome.hashes_removed,
            "reconciliation complete"
        );
        Ok(outcome)
    }

    /// One cycle: pause production, diff the sorted streams past
    /// `resume_after`, emit the difference through a temporary store.
    async fn run_cycle(&self, resume_after: Option<ContentHash>) -> Result<SortedDiff> {
        let _pause = self.events.pause_sending();

        let mut local: Vec<HashWithSize> = self
            .content
            .inventory()
            .await?
            .into_iter()
            .map(|info| HashWithSize {
                hash: info.hash,
                size: info.size,
            })
            .filter(|item| resume_after.map(|r| item.hash > r).unwrap_or(true))
            .collect();
        local.sort_by_key(|item| item.hash);

        let stored =
            self.db
                .entries_for_machine_page(self.machine, resume_after, usize::MAX);

        let diff = diff_sorted(&local, &stored, self.max_cycle_size);
        if !diff.added.is_empty() || !diff.removed.is_empty() {
            // The temporary store writes ahead of the paused main store and
            // is torn down with the cycle.
            let temporary = EventStore::new_producing(Arc::clone(&self.bus));
            temporary
                .reconcile(self.machine, diff.added.clone(), diff.removed.clone())
                .await;
        }
        Ok(diff)
    }

    async fn sleep_between_cycles(&mut self) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(self.cycle_frequency) => Ok(()),
            _ = self.cancel.changed() => {
                self.check_cancelled()
            }
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if *self.cancel.borrow() {
            Err(LocusError::Cancelled("reconciliation interrupted".into()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(prefix: u8) -> ContentHash {
        let mut bytes = [0u8; 32];
        bytes[0] = prefix;
        ContentHash::from_bytes(bytes)
    }

    fn with_size(prefix: u8, size: u64) -> HashWithSize {
        HashWithSize {
            hash: hash(prefix),
            size,
        }
    }

    #[test]
    fn test_diff_adds_and_removes() {
        // Local holds {a, b, d}; the database view holds {b, c, d}.
        let local = vec![with_size(1, 10), with_size(2, 20), with_size(4, 40)];
        let stored = vec![with_size(2, 20), with_size(3, 30), with_size(4, 40)];

        let diff = diff_sorted(&local, &stored, 10);
        assert_eq!(diff.added, vec![with_size(1, 10)]);
        assert_eq!(diff.removed, vec![hash(3)]);
        assert!(diff.exhausted);
    }

    #[test]
    fn test_diff_identical_streams_is_empty() {
        let items = vec![with_size(1, 1), with_size(2, 2)];
        let diff = diff_sorted(&items, &items, 10);
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
        assert!(diff.exhausted);
    }

    #[test]
    fn test_diff_respects_cap_and_resumes() {
        let local: Vec<_> = (1..=6).map(|i| with_size(i, i as u64)).collect();
        let stored = vec![];

        let first = diff_sorted(&local, &stored, 4);
        assert_eq!(first.added.len(), 4);
        assert!(!first.exhausted);
        assert_eq!(first.last_key, Some(hash(4)));

        let rest: Vec<_> = local
            .iter()
            .copied()
            .filter(|item| item.hash > first.last_key.unwrap())
            .collect();
        let second = diff_sorted(&rest, &stored, 4);
        assert_eq!(second.added.len(), 2);
        assert!(second.exhausted);
    }

    #[tokio::test]
    async fn test_marker_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let expiry = Duration::from_secs(3600);

        assert!(!marker_up_to_date(dir.path(), "main", Utc::now(), expiry).await);

        write_marker(dir.path(), "main", Utc::now()).await.unwrap();
        assert!(marker_up_to_date(dir.path(), "main", Utc::now(), expiry).await);

        // A different prefix invalidates the marker.
        assert!(!marker_up_to_date(dir.path(), "other", Utc::now(), expiry).await);
    }

    #[tokio::test]
    async fn test_marker_expires() {
        let dir = tempfile::tempdir().unwrap();
        let expiry = Duration::from_secs(3600);

        let written = Utc::now() - chrono::Duration::seconds(2701);
        write_marker(dir.path(), "main", written).await.unwrap();

        // 2701s old against a 0.75 × 3600s = 2700s validity window.
        assert!(!marker_up_to_date(dir.path(), "main", Utc::now(), expiry).await);
    }

    #[tokio::test]
    async fn test_unparseable_marker_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(marker_path(dir.path()), "main|not-a-timestamp")
            .await
            .unwrap();
        assert!(!marker_up_to_date(dir.path(), "main", Utc::now(), Duration::from_secs(60)).await);

        tokio::fs::write(marker_path(dir.path()), "no separator")
            .await
            .unwrap();
        assert!(!marker_up_to_date(dir.path(), "main", Utc::now(), Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn test_clear_marker_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        clear_marker(dir.path()).await.unwrap();

        write_marker(dir.path(), "main", Utc::now()).await.unwrap();
        clear_marker(dir.path()).await.unwrap();
        assert!(!marker_up_to_date(dir.path(), "main", Utc::now(), Duration::from_secs(60)).await);
    }
}
