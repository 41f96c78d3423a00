//! Eviction ordering.
//!
//! Local eviction wants to drop the content whose loss costs the cluster
//! the least. Under an exponential-decay recall model and per-replica
//! independent unavailability, the quantity to minimize is
//! `Pr(want ∧ all replicas unreachable)` per byte freed; taking logs turns
//! that into an age adjustment of the last-access time:
//!
//! ```text
//! effective_last_access = max(local, db) − lifetime × (r·(−ln risk) + ln s)
//! ```
//!
//! with `r = max(1, replica_count)` and `s = max(1, size)`. More replicas
//! or more bytes push the effective timestamp further into the past, making
//! the content more evictable. Candidates are emitted oldest-effective
//! first.
//!
//! Sorting the entire candidate set up front would stall callers that only
//! want the first few candidates, so the ordering is a lazy approximate
//! sort: the input splits in two halves, each half scores candidates a
//! window at a time into a bounded pool and emits the best fraction of the
//! pool per step, and the halves merge under the same comparator.

use crate::config::EvictionConfig;
use crate::database::ContentLocationDatabase;
use crate::types::{HashWithLastAccess, UnixSeconds};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

/// A scored eviction candidate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub hash: crate::types::ContentHash,
    pub local_last_access_utc: UnixSeconds,
    pub effective_last_access_utc: UnixSeconds,
    pub size: u64,
    pub replica_count: usize,
}

/// Compute the age-adjusted last-access time.
pub fn effective_last_access(
    local_last_access_utc: UnixSeconds,
    db_last_access_utc: UnixSeconds,
    size: u64,
    replica_count: usize,
    config: &EvictionConfig,
) -> UnixSeconds {
    let replicas = replica_count.max(1) as f64;
    let size = size.max(1) as f64;
    let lifetime = config.content_lifetime.as_secs_f64();
    let unavailability = -config.machine_risk.ln();

    let newest = local_last_access_utc.max(db_last_access_utc);
    let offset = lifetime * (replicas * unavailability + size.ln());
    newest - offset.round() as i64
}

/// Lazily order candidates for eviction. `reverse` flips to
/// newest-effective first, which is the ordering proactive replication
/// wants. Candidates younger than `min_age` are filtered out.
pub fn order_for_eviction(
    db: Arc<ContentLocationDatabase>,
    candidates: Vec<HashWithLastAccess>,
    config: EvictionConfig,
    reverse: bool,
    now: UnixSeconds,
) -> impl Iterator<Item = EvictionCandidate> {
    let mid = candidates.len() / 2;
    let mut front = candidates;
    let back = front.split_off(mid);

    let first = PoolSortIter::new(Arc::clone(&db), config.clone(), reverse, front);
    let second = PoolSortIter::new(db, config.clone(), reverse, back);

    let min_age_secs = config.min_age.as_secs() as i64;
    MergeIter::new(first, second, reverse)
        .filter(move |candidate| now - candidate.local_last_access_utc >= min_age_secs)
}

fn compare(a: &EvictionCandidate, b: &EvictionCandidate, reverse: bool) -> Ordering {
    let forward = a
        .effective_last_access_utc
        .cmp(&b.effective_last_access_utc)
        .then_with(|| a.hash.cmp(&b.hash));
    if reverse {
        forward.reverse()
    } else {
        forward
    }
}

/// Streaming approximate sort over one half of the candidate set.
struct PoolSortIter {
    db: Arc<ContentLocationDatabase>,
    config: EvictionConfig,
    reverse: bool,
    input: std::vec::IntoIter<HashWithLastAccess>,
    /// Scored candidates, kept sorted best-first.
    pool: Vec<EvictionCandidate>,
    ready: VecDeque<EvictionCandidate>,
}

impl PoolSortIter {
    fn new(
        db: Arc<ContentLocationDatabase>,
        config: EvictionConfig,
        reverse: bool,
        input: Vec<HashWithLastAccess>,
    ) -> Self {
        Self {
            db,
            config,
            reverse,
            input: input.into_iter(),
            pool: Vec::new(),
            ready: VecDeque::new(),
        }
    }

    fn step(&mut self) {
        let page: Vec<HashWithLastAccess> =
            (&mut self.input).take(self.config.window_size).collect();
        if !page.is_empty() {
            let hashes: Vec<_> = page.iter().map(|c| c.hash).collect();
            let entries = self.db.get_bulk(&hashes);
            for (candidate, entry) in page.into_iter().zip(entries) {
                let (size, replicas, db_last_access) = match entry {
                    Some(entry) => (entry.size, entry.replica_count(), entry.last_access_utc),
                    None => (0, 0, candidate.last_access_utc),
                };
                let effective = effective_last_access(
                    candidate.last_access_utc,
                    db_last_access,
                    size,
                    replicas,
                    &self.config,
                );
                self.pool.push(EvictionCandidate {
                    hash: candidate.hash,
                    local_last_access_utc: candidate.last_access_utc,
                    effective_last_access_utc: effective,
                    size,
                    replica_count: replicas,
                });
            }
        }

        let reverse = self.reverse;
        self.pool.sort_by(|a, b| compare(a, b, reverse));
        if self.pool.len() > self.config.pool_size {
            self.pool.truncate(self.config.pool_size);
        }

        let emit = ((self.pool.len() as f64 * self.config.removal_fraction).ceil() as usize)
            .clamp(1, self.pool.len());
        self.ready.extend(self.pool.drain(..emit));

        let discard = (self.pool.len() as f64 * self.config.discard_fraction).floor() as usize;
        if discard > 0 {
            let keep = self.pool.len() - discard;
            self.pool.truncate(keep);
        }
    }
}

impl Iterator for PoolSortIter {
    type Item = EvictionCandidate;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(candidate) = self.ready.pop_front() {
                return Some(candidate);
            }
            if self.input.len() == 0 && self.pool.is_empty() {
                return None;
            }
            self.step();
        }
    }
}

/// Ordered merge of the two half-streams.
struct MergeIter {
    first: std::iter::Peekable<PoolSortIter>,
    second: std::iter::Peekable<PoolSortIter>,
    reverse: bool,
}

impl MergeIter {
    fn new(first: PoolSortIter, second: PoolSortIter, reverse: bool) -> Self {
        Self {
            first: first.peekable(),
            second: second.peekable(),
            reverse,
        }
    }
}

impl Iterator for MergeIter {
    type Item = EvictionCandidate;

    fn next(&mut self) -> Option<Self::Item> {
        match (self.first.peek(), self.second.peek()) {
            (Some(a), Some(b)) => {
                if compare(a, b, self.reverse) != Ordering::Greater {
                    self.first.next()
                } else {
                    self.second.next()
                }
            }
            (Some(_), None) => self.first.next(),
            (None, _) => self.second.next(),
        }
    }
}
