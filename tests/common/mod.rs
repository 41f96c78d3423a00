//! Common test utilities for integration tests.

use async_trait::async_trait;
use locus::cluster::{ClusterMachine, ClusterSnapshot, ClusterStateResponse, ClusterStateUpdate};
use locus::config::LocationStoreConfig;
use locus::error::{LocusError, Result};
use locus::events::MemoryEventBus;
use locus::global::{CheckpointState, GlobalStore};
use locus::reconcile::LocalContentStore;
use locus::replication::ProactiveCopier;
use locus::storage::MemoryStorage;
use locus::store::{LocalLocationStore, StoreDependencies};
use locus::types::{
    ContentHash, ContentInfo, ContentLocationEntry, HashWithSize, MachineId, MachineLocation,
    Role,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Deterministic content hash from a prefix byte.
pub fn hash(prefix: u8) -> ContentHash {
    let mut bytes = [0u8; 32];
    bytes[0] = prefix;
    ContentHash::from_bytes(bytes)
}

pub fn with_size(prefix: u8, size: u64) -> HashWithSize {
    HashWithSize {
        hash: hash(prefix),
        size,
    }
}

/// Test environment that manages a temporary working directory.
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub working_dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let working_dir = temp_dir.path().join("locus");
        Self {
            temp_dir,
            working_dir,
        }
    }
}

/// Scriptable in-memory global store.
pub struct InMemoryGlobalStore {
    state: Mutex<CheckpointState>,
    machines: Mutex<HashMap<MachineLocation, MachineId>>,
    next_machine_id: AtomicU32,
    inactive: Mutex<Vec<MachineId>>,
    directory: Mutex<HashMap<ContentHash, ContentLocationEntry>>,
    register_calls: Mutex<Vec<(MachineId, Vec<HashWithSize>)>>,
    invalidated: Mutex<Vec<MachineId>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    fail_checkpoint_state: Mutex<Option<String>>,
}

impl InMemoryGlobalStore {
    pub fn new(role: Role) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CheckpointState::initial(role)),
            machines: Mutex::new(HashMap::new()),
            next_machine_id: AtomicU32::new(1),
            inactive: Mutex::new(Vec::new()),
            directory: Mutex::new(HashMap::new()),
            register_calls: Mutex::new(Vec::new()),
            invalidated: Mutex::new(Vec::new()),
            blobs: Mutex::new(HashMap::new()),
            fail_checkpoint_state: Mutex::new(None),
        })
    }

    pub fn set_checkpoint_state(&self, state: CheckpointState) {
        *self.state.lock() = state;
    }

    /// Make `get_checkpoint_state` fail until cleared.
    pub fn fail_checkpoint_state(&self, reason: Option<&str>) {
        *self.fail_checkpoint_state.lock() = reason.map(|r| r.to_string());
    }

    /// Register a peer machine directly, as if another node had
    /// heartbeated.
    pub fn add_peer(&self, location: &str) -> MachineId {
        let location = MachineLocation::new(location);
        let mut machines = self.machines.lock();
        *machines.entry(location).or_insert_with(|| {
            self.next_machine_id.fetch_add(1, Ordering::SeqCst)
        })
    }

    pub fn set_entry(&self, hash: ContentHash, entry: ContentLocationEntry) {
        self.directory.lock().insert(hash, entry);
    }

    pub fn register_calls(&self) -> Vec<(MachineId, Vec<HashWithSize>)> {
        self.register_calls.lock().clone()
    }

    pub fn invalidated_machines(&self) -> Vec<MachineId> {
        self.invalidated.lock().clone()
    }

    pub fn mark_inactive(&self, machine: MachineId) {
        self.inactive.lock().push(machine);
    }

    fn snapshot(&self) -> ClusterSnapshot {
        let machines = self.machines.lock();
        let inactive = self.inactive.lock();
        let mut listed: Vec<ClusterMachine> = machines
            .iter()
            .map(|(location, id)| ClusterMachine {
                id: *id,
                location: location.clone(),
                active: !inactive.contains(id),
            })
            .collect();
        listed.sort_by_key(|m| m.id);
        let max_machine_id = listed.iter().map(|m| m.id).max().unwrap_or(0);
        ClusterSnapshot {
            machines: listed,
            max_machine_id,
        }
    }
}

#[async_trait]
impl GlobalStore for InMemoryGlobalStore {
    async fn get_checkpoint_state(&self) -> Result<CheckpointState> {
        if let Some(reason) = self.fail_checkpoint_state.lock().clone() {
            return Err(LocusError::Remote(reason));
        }
        Ok(self.state.lock().clone())
    }

    async fn release_role_if_necessary(&self, _current: Role) -> Result<Role> {
        Ok(self.state.lock().role)
    }

    async fn update_cluster_state(
        &self,
        update: ClusterStateUpdate,
    ) -> Result<ClusterStateResponse> {
        let assigned = {
            let mut machines = self.machines.lock();
            *machines.entry(update.location.clone()).or_insert_with(|| {
                self.next_machine_id.fetch_add(1, Ordering::SeqCst)
            })
        };
        Ok(ClusterStateResponse {
            assigned_machine_id: assigned,
            snapshot: self.snapshot(),
        })
    }

    async fn register_local_locations(
        &self,
        machine: MachineId,
        entries: &[HashWithSize],
    ) -> Result<()> {
        self.register_calls.lock().push((machine, entries.to_vec()));
        let mut directory = self.directory.lock();
        for item in entries {
            let entry = directory
                .entry(item.hash)
                .or_insert_with(|| ContentLocationEntry::new(item.size, 0));
            entry.locations.insert(machine);
        }
        Ok(())
    }

    async fn get_bulk(&self, hashes: &[ContentHash]) -> Result<Vec<Option<ContentLocationEntry>>> {
        let directory = self.directory.lock();
        Ok(hashes.iter().map(|h| directory.get(h).cloned()).collect())
    }

    async fn invalidate_local_machine(&self, machine: MachineId) -> Result<()> {
        self.invalidated.lock().push(machine);
        let mut directory = self.directory.lock();
        for entry in directory.values_mut() {
            entry.locations.remove(machine);
        }
        Ok(())
    }

    async fn put_blob(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
        self.blobs.lock().insert(name.to_string(), bytes);
        Ok(())
    }

    async fn get_blob(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(name).cloned())
    }
}

/// Content store fake with a settable inventory.
#[derive(Default)]
pub struct InMemoryContentStore {
    inventory: Mutex<Vec<ContentInfo>>,
}

impl InMemoryContentStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_inventory(&self, inventory: Vec<ContentInfo>) {
        *self.inventory.lock() = inventory;
    }
}

#[async_trait]
impl LocalContentStore for InMemoryContentStore {
    async fn inventory(&self) -> Result<Vec<ContentInfo>> {
        Ok(self.inventory.lock().clone())
    }
}

/// Copier fake that records copy requests.
#[derive(Default)]
pub struct RecordingCopier {
    copied: Mutex<Vec<ContentHash>>,
}

impl RecordingCopier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn copied(&self) -> Vec<ContentHash> {
        self.copied.lock().clone()
    }
}

#[async_trait]
impl ProactiveCopier for RecordingCopier {
    async fn copy(
        &self,
        hash: ContentHash,
        _size: u64,
        _current_locations: &[MachineLocation],
    ) -> Result<()> {
        self.copied.lock().push(hash);
        Ok(())
    }
}

/// Configuration tuned for tests: background cadence effectively off, all
/// heartbeats manual.
pub fn test_config(env: &TestEnv) -> LocationStoreConfig {
    let mut config = LocationStoreConfig::development(&env.working_dir);
    config.checkpoint_prefix = "test".to_string();
    config.heartbeat.heartbeat_interval = Duration::from_secs(3600);
    config.heartbeat.create_checkpoint_interval = Duration::from_secs(3600);
    config.heartbeat.restore_checkpoint_interval = Duration::from_secs(3600);
    config.heartbeat.restore_checkpoint_age_threshold = Duration::from_secs(300);
    config.reconciliation.enabled = false;
    config.replication.enabled = false;
    config
}

/// Collaborators created ahead of the store, so tests can seed storage,
/// content, and the global store before post-initialization runs.
pub struct TestSetup {
    pub env: TestEnv,
    pub global: Arc<InMemoryGlobalStore>,
    pub storage: Arc<MemoryStorage>,
    pub content: Arc<InMemoryContentStore>,
    pub copier: Arc<RecordingCopier>,
    pub bus: Arc<MemoryEventBus>,
}

impl TestSetup {
    pub fn new(role: Role) -> Self {
        Self {
            env: TestEnv::new(),
            global: InMemoryGlobalStore::new(role),
            storage: Arc::new(MemoryStorage::new()),
            content: InMemoryContentStore::new(),
            copier: RecordingCopier::new(),
            bus: Arc::new(MemoryEventBus::new()),
        }
    }

    pub async fn start(self, configure: impl FnOnce(&mut LocationStoreConfig)) -> TestNode {
        let mut config = test_config(&self.env);
        configure(&mut config);

        let store = LocalLocationStore::start(
            config,
            StoreDependencies {
                global: self.global.clone(),
                storage: self.storage.clone(),
                content: self.content.clone(),
                copier: self.copier.clone(),
                bus: self.bus.clone(),
            },
        )
        .await
        .expect("store failed to start");

        TestNode {
            env: self.env,
            store,
            global: self.global,
            storage: self.storage,
            content: self.content,
            copier: self.copier,
            bus: self.bus,
        }
    }
}

/// A node under test with handles to every collaborator.
pub struct TestNode {
    pub env: TestEnv,
    pub store: Arc<LocalLocationStore>,
    pub global: Arc<InMemoryGlobalStore>,
    pub storage: Arc<MemoryStorage>,
    pub content: Arc<InMemoryContentStore>,
    pub copier: Arc<RecordingCopier>,
    pub bus: Arc<MemoryEventBus>,
}

impl TestNode {
    pub async fn start(role: Role) -> Self {
        TestSetup::new(role).start(|_| {}).await
    }

    pub async fn start_with(
        role: Role,
        configure: impl FnOnce(&mut LocationStoreConfig),
    ) -> Self {
        TestSetup::new(role).start(configure).await
    }

    /// Wait until the store's consumer has applied everything published so
    /// far.
    pub async fn drain_events(&self) {
        self.store
            .event_store()
            .wait_until_processed(self.bus.last_sequence())
            .await;
    }
}
