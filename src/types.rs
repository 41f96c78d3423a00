//! Core type definitions for the locus location store.
//!
//! This module contains the fundamental data types used throughout locus,
//! including content hashes, machine identifiers, and location entries.
//!
//! # Key Types
//!
//! - [`ContentHash`]: fixed-width identifier for a blob of content
//! - [`ShortHash`]: compact prefix of a content hash, used for ordering and
//!   set membership
//! - [`MachineSet`]: bitset over dense machine ids, recording which machines
//!   hold a piece of content
//! - [`ContentLocationEntry`]: per-hash record in the location database
//!
//! # Type Aliases
//!
//! - [`MachineId`] = `u32`: dense machine identifier assigned by the global
//!   store on first registration; ids are never reused
//! - [`SequencePoint`] = `u64`: totally ordered cursor into the event stream
//! - [`UnixSeconds`] = `i64`: wall-clock timestamp in seconds since the epoch
//!
//! # Examples
//!
//! ```rust
//! use locus::types::{ContentHash, MachineSet};
//!
//! let hash = ContentHash::from_bytes([7u8; 32]);
//! let short = hash.short();
//! assert_eq!(short, hash.short());
//!
//! let mut set = MachineSet::new();
//! set.insert(3);
//! set.insert(17);
//! assert_eq!(set.count(), 2);
//! assert!(set.contains(3));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Dense machine identifier assigned by the global store.
pub type MachineId = u32;

/// Totally ordered cursor into the event stream.
pub type SequencePoint = u64;

/// Wall-clock timestamp in seconds since the Unix epoch.
pub type UnixSeconds = i64;

/// Fixed-width content identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derive the compact ordering prefix for this hash.
    pub fn short(&self) -> ShortHash {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.0[..8]);
        ShortHash(u64::from_be_bytes(prefix))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ContentHash {
    // First four bytes only, for log-friendly output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..")
    }
}

/// Compact prefix of a [`ContentHash`], ordered consistently with the full
/// hash.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ShortHash(pub u64);

impl fmt::Display for ShortHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for ShortHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}..", self.0 >> 32)
    }
}

/// Opaque network address of a machine in the cluster.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Debug, PartialOrd, Ord)]
pub struct MachineLocation(String);

impl MachineLocation {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bitset over dense [`MachineId`]s.
///
/// Word-packed so that entries with many replicas stay compact; machine ids
/// are dense small integers, which keeps the backing vector short.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSet {
    words: Vec<u64>,
}

impl MachineSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, machine: MachineId) {
        let (word, bit) = Self::index(machine);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << bit;
    }

    pub fn remove(&mut self, machine: MachineId) {
        let (word, bit) = Self::index(machine);
        if word < self.words.len() {
            self.words[word] &= !(1 << bit);
        }
    }

    pub fn contains(&self, machine: MachineId) -> bool {
        let (word, bit) = Self::index(machine);
        self.words.get(word).is_some_and(|w| w & (1 << bit) != 0)
    }

    /// Number of machines in the set, i.e. the replica count.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Iterate over set machine ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = MachineId> + '_ {
        self.words.iter().enumerate().flat_map(|(word_idx, word)| {
            let word = *word;
            (0..64).filter_map(move |bit| {
                if word & (1 << bit) != 0 {
                    Some((word_idx * 64 + bit) as MachineId)
                } else {
                    None
                }
            })
        })
    }

    fn index(machine: MachineId) -> (usize, u32) {
        ((machine / 64) as usize, machine % 64)
    }
}

impl FromIterator<MachineId> for MachineSet {
    fn from_iter<I: IntoIterator<Item = MachineId>>(iter: I) -> Self {
        let mut set = Self::new();
        for machine in iter {
            set.insert(machine);
        }
        set
    }
}

/// Record in the content location database: how large the content is, when
/// it was last accessed, and which machines hold it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentLocationEntry {
    pub size: u64,
    pub last_access_utc: UnixSeconds,
    pub locations: MachineSet,
}

impl ContentLocationEntry {
    pub fn new(size: u64, last_access_utc: UnixSeconds) -> Self {
        Self {
            size,
            last_access_utc,
            locations: MachineSet::new(),
        }
    }

    pub fn replica_count(&self) -> usize {
        self.locations.count()
    }

    /// Whether the entry was touched within `window` seconds of `now`.
    pub fn touched_within(&self, window_secs: i64, now: UnixSeconds) -> bool {
        self.last_access_utc + window_secs >= now
    }
}

/// A content hash together with the size of the blob it names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashWithSize {
    pub hash: ContentHash,
    pub size: u64,
}

/// A content hash together with its local last-access time, the input shape
/// of the eviction ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HashWithLastAccess {
    pub hash: ContentHash,
    pub last_access_utc: UnixSeconds,
}

/// Full inventory record reported by the local content store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContentInfo {
    pub hash: ContentHash,
    pub size: u64,
    pub last_access_utc: UnixSeconds,
}

/// Node role in the master/worker protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Role not yet established with the global store.
    Unknown,
    /// Consumer of the event stream; database is read-only.
    Worker,
    /// Producer of the event stream and creator of checkpoints.
    Master,
}

impl Role {
    pub fn is_master(&self) -> bool {
        matches!(self, Role::Master)
    }
}

/// Where a bulk location query should be answered from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GetBulkOrigin {
    /// Answer from the locally materialized database.
    Local,
    /// Ask the global authoritative store.
    Global,
}

/// Resolved result of a bulk location query, in input order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocatedContent {
    pub hash: ContentHash,
    pub size: u64,
    pub locations: Vec<MachineLocation>,
}

impl LocatedContent {
    /// Result for a hash with no known entry.
    pub fn missing(hash: ContentHash) -> Self {
        Self {
            hash,
            size: 0,
            locations: Vec::new(),
        }
    }
}
