//! Client contract for the cluster-wide authoritative store.
//!
//! The global store is a remote service owning three concerns: the
//! authoritative content location directory, the machine directory with
//! master-role leases, and a blob namespace some deployments use for
//! checkpoint artifacts. Transport is out of scope here; the location store
//! only depends on this trait.
//!
//! All methods may fail transiently; callers treat failures per the error
//! policy (public operations bubble them up, background tasks log and retry
//! on the next heartbeat).

use crate::cluster::{ClusterStateResponse, ClusterStateUpdate};
use crate::error::Result;
use crate::storage::CentralStorage;
use crate::types::{
    ContentHash, ContentLocationEntry, HashWithSize, MachineId, Role, SequencePoint,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Role and checkpoint coordinates returned by the role-lease service on
/// every heartbeat.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// The role this machine currently holds.
    pub role: Role,
    /// Where event production resumes if this machine is the master.
    pub start_sequence_point: SequencePoint,
    /// Identifier of the checkpoint the cluster agreed on, if any.
    pub checkpoint_id: Option<String>,
    /// Whether that checkpoint's artifact is available in central storage.
    pub checkpoint_available: bool,
}

impl CheckpointState {
    /// State for a cluster that has not yet published a checkpoint.
    pub fn initial(role: Role) -> Self {
        Self {
            role,
            start_sequence_point: 0,
            checkpoint_id: None,
            checkpoint_available: false,
        }
    }
}

/// The authoritative location directory and role-lease service.
#[async_trait]
pub trait GlobalStore: Send + Sync {
    /// Fetch the current role and checkpoint coordinates for this machine.
    async fn get_checkpoint_state(&self) -> Result<CheckpointState>;

    /// Release the master lease if this machine holds one and should not,
    /// returning the role to operate under.
    async fn release_role_if_necessary(&self, current: Role) -> Result<Role>;

    /// Exchange cluster state: send our record and watermark, receive the
    /// directory's view and our assigned machine id.
    async fn update_cluster_state(
        &self,
        update: ClusterStateUpdate,
    ) -> Result<ClusterStateResponse>;

    /// Eagerly register content held by a machine.
    async fn register_local_locations(
        &self,
        machine: MachineId,
        entries: &[HashWithSize],
    ) -> Result<()>;

    /// Fetch authoritative entries for the given hashes, in input order.
    /// `None` marks a hash the directory has never seen.
    async fn get_bulk(&self, hashes: &[ContentHash]) -> Result<Vec<Option<ContentLocationEntry>>>;

    /// Drop every registration this machine has made.
    async fn invalidate_local_machine(&self, machine: MachineId) -> Result<()>;

    /// Store a blob in the global blob namespace.
    async fn put_blob(&self, name: &str, bytes: Vec<u8>) -> Result<()>;

    /// Fetch a blob from the global blob namespace.
    async fn get_blob(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Release resources held by the client.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Adapter exposing the global store's blob namespace as a
/// [`CentralStorage`], the remote-blob deployment variant for checkpoint
/// artifacts.
pub struct GlobalBlobStorage {
    global: Arc<dyn GlobalStore>,
}

impl GlobalBlobStorage {
    pub fn new(global: Arc<dyn GlobalStore>) -> Self {
        Self { global }
    }
}

#[async_trait]
impl CentralStorage for GlobalBlobStorage {
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
        self.global.put_blob(name, bytes).await
    }

    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.global.get_blob(name).await
    }

    async fn delete(&self, _name: &str) -> Result<bool> {
        // The global blob namespace applies its own retention.
        Ok(false)
    }
}
