//! Error types for the locus location store.
//!
//! This module provides a unified error type [`LocusError`] for all locus
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Precondition**: a caller violated an API contract; never retried
//! - **Remote**: a transient failure talking to the global store, central
//!   storage, or the event stream; callers recover via the next heartbeat
//! - **Corruption**: the content location database detected corrupted state
//!   and a forced checkpoint restore is required
//! - **Cancelled**: the operation was interrupted by shutdown or an explicit
//!   cancellation token
//! - **Configuration**: invalid settings detected at startup; the process
//!   must not proceed
//!
//! # Example
//!
//! ```rust
//! use locus::error::{LocusError, Result};
//!
//! fn check_batch(hashes: &[u8]) -> Result<()> {
//!     if hashes.is_empty() {
//!         return Err(LocusError::Precondition("empty batch".into()));
//!     }
//!     Ok(())
//! }
//!
//! fn handle(err: &LocusError) {
//!     if err.is_transient() {
//!         println!("will retry on next heartbeat");
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

/// Main error type for locus operations.
#[derive(Error, Debug)]
pub enum LocusError {
    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("remote operation failed: {0}")]
    Remote(String),

    #[error("database corruption: {0}")]
    Corruption(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("event store error: {0}")]
    EventStore(String),

    #[error("machine {0} is not resolvable in cluster state")]
    UnknownMachine(u32),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("shutdown completed with failures: {0:?}")]
    Shutdown(Vec<String>),
}

impl LocusError {
    /// Check if the error is transient and safe to retry on a later cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LocusError::Remote(_) | LocusError::Storage(_) | LocusError::EventStore(_)
        )
    }

    /// Check if the error signals local database corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(self, LocusError::Corruption(_))
    }

    /// Check if the error is fatal for process startup.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LocusError::InvalidConfig { .. })
    }
}

impl From<bincode::Error> for LocusError {
    fn from(e: bincode::Error) -> Self {
        LocusError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for LocusError {
    fn from(e: serde_json::Error) -> Self {
        LocusError::Serialization(e.to_string())
    }
}

/// Result type alias for locus operations.
pub type Result<T> = std::result::Result<T, LocusError>;
