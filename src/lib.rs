//! Locus - per-node content location tracking for distributed
//! content-addressable cache clusters.
//!
//! Every node of a content-addressable cache cluster runs one
//! [`LocalLocationStore`]. It maintains a locally materialized view of
//! which machines hold which content and keeps that view coherent with the
//! cluster's authoritative directory through an event-sourced replication
//! stream, periodic database checkpoints, and a master/worker role
//! protocol. The local content store consults it to answer "where else can
//! I obtain this blob?" and "who needs to be told that I now have it?",
//! and it drives background eviction ordering and proactive replication.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      LocalLocationStore                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Read/Write API: get_bulk | register | touch | trim          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Heartbeat: role lease | checkpoint create/restore           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Content Location DB  ←  Event Stream  ←  peers              │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Background: reconciliation | proactive replication          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use locus::config::LocationStoreConfig;
//! use locus::store::{LocalLocationStore, StoreDependencies};
//! # async fn example(deps: StoreDependencies) -> locus::Result<()> {
//! let config = LocationStoreConfig::development("/var/lib/locus");
//! locus::observability::init(&config.observability)?;
//!
//! let store = LocalLocationStore::start(config, deps).await?;
//! // ... serve lookups, register content ...
//! store.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod types;

pub mod checkpoint;
pub mod cluster;
pub mod database;
pub mod events;
pub mod eviction;
pub mod global;
pub mod observability;
pub mod reconcile;
pub mod replication;
pub mod reputation;
pub mod storage;
pub mod store;
pub mod volatile;

// Re-exports
pub use error::{LocusError, Result};
pub use store::{LocalLocationStore, LocationStoreClient, StoreDependencies};
pub use types::*;
