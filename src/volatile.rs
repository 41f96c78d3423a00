//! Time-expiring membership sets.
//!
//! The store keeps three of these: recently-added, recently-touched, and
//! recently-removed hashes. Membership decays automatically after the
//! configured time-to-live, which is what turns them into dedup filters for
//! the registration and touch paths.
//!
//! Entries are sharded across independently locked maps so that concurrent
//! registrations for unrelated hashes do not contend. `add`, `contains`, and
//! `invalidate` are linearizable per item because every item maps to exactly
//! one shard lock.

use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

const DEFAULT_SHARDS: usize = 16;

/// A membership set whose entries expire `ttl` after insertion.
pub struct VolatileSet<T> {
    shards: Vec<Mutex<HashMap<T, Instant>>>,
    ttl: Duration,
}

impl<T: Hash + Eq> VolatileSet<T> {
    pub fn new(ttl: Duration) -> Self {
        Self::with_shards(ttl, DEFAULT_SHARDS)
    }

    pub fn with_shards(ttl: Duration, shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
            ttl,
        }
    }

    /// Insert an item, refreshing its expiry if already present.
    pub fn add(&self, item: T) {
        let mut shard = self.shard(&item).lock();
        shard.insert(item, Instant::now());
    }

    /// Whether the item is present and not yet expired. Expired entries are
    /// pruned on the way out.
    pub fn contains(&self, item: &T) -> bool {
        let mut shard = self.shard(item).lock();
        match shard.get(item) {
            Some(inserted) if inserted.elapsed() <= self.ttl => true,
            Some(_) => {
                shard.remove(item);
                false
            }
            None => false,
        }
    }

    /// Remove an item regardless of its age.
    pub fn invalidate(&self, item: &T) {
        self.shard(item).lock().remove(item);
    }

    /// Drop every expired entry. The sets are pruned lazily on `contains`;
    /// this sweep exists for long-idle processes.
    pub fn cleanup(&self) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let before = shard.len();
            shard.retain(|_, inserted| inserted.elapsed() <= self.ttl);
            removed += before - shard.len();
        }
        removed
    }

    /// Number of entries currently stored, including not-yet-pruned expired
    /// ones.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard(&self, item: &T) -> &Mutex<HashMap<T, Instant>> {
        let mut hasher = DefaultHasher::new();
        item.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_contains() {
        let set = VolatileSet::new(Duration::from_secs(60));
        set.add("a");
        assert!(set.contains(&"a"));
        assert!(!set.contains(&"b"));
    }

    #[test]
    fn test_invalidate() {
        let set = VolatileSet::new(Duration::from_secs(60));
        set.add("a");
        set.invalidate(&"a");
        assert!(!set.contains(&"a"));
    }

    #[test]
    fn test_expiry() {
        let set = VolatileSet::new(Duration::ZERO);
        set.add("a");
        std::thread::sleep(Duration::from_millis(5));
        assert!(!set.contains(&"a"));
        // The expired entry was pruned by the failed lookup.
        assert!(set.is_empty());
    }

    #[test]
    fn test_readd_refreshes_expiry() {
        let set = VolatileSet::new(Duration::from_millis(80));
        set.add("a");
        std::thread::sleep(Duration::from_millis(50));
        set.add("a");
        std::thread::sleep(Duration::from_millis(50));
        assert!(set.contains(&"a"));
    }

    #[test]
    fn test_cleanup_sweeps_expired() {
        let set = VolatileSet::with_shards(Duration::ZERO, 4);
        for i in 0..32 {
            set.add(i);
        }
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(set.cleanup(), 32);
        assert!(set.is_empty());
    }
}
