//! The local location store.
//!
//! One of these runs on every node of the cluster. It answers "where else
//! can I obtain this blob" from a locally materialized database, decides
//! how each local registration reaches the rest of the cluster (eagerly
//! through the global store, lazily through the event stream, or not at
//! all), and drives the background machinery that keeps the local view
//! coherent: the heartbeat with its master/worker role protocol, checkpoint
//! creation and restore, reconciliation, and proactive replication.
//!
//! # Consistency model
//!
//! The database is bounded-stale: masters apply the event stream as it
//! arrives, workers are carried forward by periodic checkpoint restores.
//! Writes about this machine's own content are therefore pushed eagerly to
//! the global store exactly when staleness would be harmful (a recent
//! remove that peers may still have materialized, recent inactivity that
//! may have peers filtering us out, or a replica count too low to risk the
//! stream's delivery latency) and ride the event stream otherwise.
//!
//! # Lifecycle
//!
//! [`LocalLocationStore::start`] performs core startup (component wiring,
//! event consumer, heartbeat timer) and then post-initialization: an
//! initial heartbeat, awaited inline or run in the background per
//! configuration. Every public operation waits for post-initialization and
//! short-circuits with its error if it failed; a later successful heartbeat
//! replaces that failure with success. [`LocalLocationStore::shutdown`]
//! awaits a pending post-init and any in-flight heartbeat, then tears down
//! the event store, database, global store client, and central storage in
//! that order, aggregating failures.

use crate::checkpoint::CheckpointManager;
use crate::cluster::ClusterState;
use crate::config::LocationStoreConfig;
use crate::database::{ContentLocationDatabase, DatabaseStats};
use crate::error::{LocusError, Result};
use crate::events::{
    EventConsumer, EventStore, EventStoreStats, MemoryEventBus, SequencedEvent,
};
use crate::eviction::{order_for_eviction, EvictionCandidate};
use crate::global::{CheckpointState, GlobalStore};
use crate::reconcile::{self, LocalContentStore, ReconcileOutcome, ReconcileRun};
use crate::replication::{
    ProactiveCopier, ReplicationCounters, ReplicationRun, ReplicationStats,
};
use crate::reputation::MachineReputationTracker;
use crate::storage::CentralStorage;
use crate::types::{
    ContentHash, GetBulkOrigin, HashWithLastAccess, HashWithSize, LocatedContent, MachineId,
    Role, ShortHash, UnixSeconds,
};
use crate::volatile::VolatileSet;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Why a registration goes through the eager global path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EagerReason {
    /// The hash was trimmed recently; peer databases may still list this
    /// machine, and events alone race the next restore.
    RecentRemove,
    /// This machine was recently inactive; peers may be filtering its
    /// contributions.
    RecentInactive,
    /// Too few replicas to risk the event stream's delivery latency.
    LowReplicaCount,
}

/// Per-hash decision of the registration policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterAction {
    /// Nothing to do; the cluster already knows.
    Skip,
    /// Our bit is set but stale; refresh the timestamp with a Touch event.
    LazyTouchEventOnly,
    /// Emit an Add event, no eager write.
    LazyEventOnly,
    /// Eager write to the global store and an Add event.
    EagerGlobal(EagerReason),
}

/// Decide the action for one registration, in strict priority order.
pub(crate) fn classify_registration(
    config: &LocationStoreConfig,
    db: &ContentLocationDatabase,
    recently_added: &VolatileSet<ShortHash>,
    recently_removed: &VolatileSet<ShortHash>,
    last_inactive: Option<DateTime<Utc>>,
    local_machine: MachineId,
    item: &HashWithSize,
    now: DateTime<Utc>,
) -> RegisterAction {
    let suppress = config.skip_redundant_content_location_add;

    // A recent remove wins over everything, including a recent add.
    if suppress && recently_removed.contains(&item.hash.short()) {
        return RegisterAction::EagerGlobal(EagerReason::RecentRemove);
    }

    if let Some(inactive) = last_inactive {
        let window = chrono_duration(config.recompute_inactive_machines_expiry * 5);
        if now.signed_duration_since(inactive) <= window {
            return RegisterAction::EagerGlobal(EagerReason::RecentInactive);
        }
    }

    if suppress && recently_added.contains(&item.hash.short()) {
        return RegisterAction::Skip;
    }

    if let Some(entry) = db.get(&item.hash) {
        if entry.locations.contains(local_machine) {
            let touch_secs = config.touch_frequency.as_secs() as i64;
            return if entry.touched_within(touch_secs, now.timestamp()) {
                RegisterAction::Skip
            } else {
                RegisterAction::LazyTouchEventOnly
            };
        }
        if entry.replica_count() >= config.safe_to_lazily_update_machine_count_threshold {
            return RegisterAction::LazyEventOnly;
        }
    }

    RegisterAction::EagerGlobal(EagerReason::LowReplicaCount)
}

/// External collaborators wired into the store at startup.
pub struct StoreDependencies {
    pub global: Arc<dyn GlobalStore>,
    pub storage: Arc<dyn CentralStorage>,
    pub content: Arc<dyn LocalContentStore>,
    pub copier: Arc<dyn ProactiveCopier>,
    pub bus: Arc<MemoryEventBus>,
}

/// Narrow capability the local content store programs against.
#[async_trait]
pub trait LocationStoreClient: Send + Sync {
    async fn get_bulk(
        &self,
        hashes: &[ContentHash],
        origin: GetBulkOrigin,
    ) -> Result<Vec<LocatedContent>>;

    async fn register_local_location(
        &self,
        entries: &[HashWithSize],
        touch: bool,
    ) -> Result<()>;
}

#[derive(Clone, Debug)]
enum PostInitState {
    Pending,
    Ready,
    Failed(String),
}

struct RoleState {
    current_role: Role,
    last_restore: Option<DateTime<Utc>>,
    last_checkpoint: Option<DateTime<Utc>>,
    last_checkpoint_id: Option<String>,
    first_restore_done: bool,
}

#[derive(Default)]
struct HeartbeatCounters {
    heartbeats: AtomicU64,
    role_switches: AtomicU64,
    restores: AtomicU64,
    restore_skips: AtomicU64,
    checkpoints_created: AtomicU64,
}

#[derive(Default)]
struct RegisterCounters {
    eager: AtomicU64,
    lazy_events: AtomicU64,
    lazy_touches: AtomicU64,
    skipped: AtomicU64,
}

/// Registration decisions taken since startup, by action.
#[derive(Debug, Clone, Default)]
pub struct RegisterStats {
    pub eager: u64,
    pub lazy_events: u64,
    pub lazy_touches: u64,
    pub skipped: u64,
}

/// Combined view of store activity since startup.
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub role: Role,
    pub heartbeats: u64,
    pub role_switches: u64,
    pub restores: u64,
    pub restore_skips: u64,
    pub checkpoints_created: u64,
    pub register: RegisterStats,
    pub replication: ReplicationStats,
    pub database: DatabaseStats,
    pub events: EventStoreStats,
}

/// The per-node location coordinator.
pub struct LocalLocationStore {
    config: LocationStoreConfig,
    db: Arc<ContentLocationDatabase>,
    cluster: Arc<ClusterState>,
    events: Arc<EventStore>,
    bus: Arc<MemoryEventBus>,
    checkpoints: Arc<CheckpointManager>,
    global: Arc<dyn GlobalStore>,
    storage: Arc<dyn CentralStorage>,
    content: Arc<dyn LocalContentStore>,
    copier: Arc<dyn ProactiveCopier>,
    reputation: Arc<MachineReputationTracker>,
    recently_added: VolatileSet<ShortHash>,
    recently_touched: VolatileSet<ShortHash>,
    recently_removed: VolatileSet<ShortHash>,
    role: RwLock<RoleState>,
    /// Non-blocking gate: at most one heartbeat body runs; reentrant fires
    /// are dropped. Shutdown locks it to await an in-flight heartbeat.
    heartbeat_gate: tokio::sync::Mutex<()>,
    /// Non-blocking gate deduplicating concurrent corruption callbacks.
    invalidation_gate: tokio::sync::Mutex<()>,
    /// Token handoff for the single in-flight replication pass.
    replication_cancel: tokio::sync::Mutex<Option<watch::Sender<bool>>>,
    replication_counters: Arc<ReplicationCounters>,
    post_init_tx: watch::Sender<PostInitState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    heartbeat_counters: HeartbeatCounters,
    register_counters: RegisterCounters,
    /// Back-reference installed at startup so background spawns can take
    /// an owning handle from `&self`.
    weak_self: RwLock<Option<std::sync::Weak<Self>>>,
}

impl LocalLocationStore {
    /// Core startup plus post-initialization.
    pub async fn start(
        config: LocationStoreConfig,
        deps: StoreDependencies,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        std::fs::create_dir_all(&config.working_dir)?;

        let db = Arc::new(ContentLocationDatabase::new());
        let cluster = Arc::new(ClusterState::new(config.local_location.clone()));
        let events = Arc::new(EventStore::new(Arc::clone(&deps.bus)));
        let checkpoints = Arc::new(CheckpointManager::new(
            Arc::clone(&deps.storage),
            Arc::clone(&db),
            config.checkpoint_prefix.clone(),
        ));
        let (post_init_tx, _) = watch::channel(PostInitState::Pending);
        let (shutdown_tx, _) = watch::channel(false);

        let touch_ttl = config.touch_frequency;
        let store = Arc::new(Self {
            recently_added: VolatileSet::new(touch_ttl),
            recently_touched: VolatileSet::new(touch_ttl),
            recently_removed: VolatileSet::new(touch_ttl),
            db,
            cluster,
            events,
            bus: Arc::clone(&deps.bus),
            checkpoints,
            global: deps.global,
            storage: deps.storage,
            content: deps.content,
            copier: deps.copier,
            reputation: Arc::new(MachineReputationTracker::new()),
            role: RwLock::new(RoleState {
                current_role: Role::Unknown,
                last_restore: None,
                last_checkpoint: None,
                last_checkpoint_id: None,
                first_restore_done: false,
            }),
            heartbeat_gate: tokio::sync::Mutex::new(()),
            invalidation_gate: tokio::sync::Mutex::new(()),
            replication_cancel: tokio::sync::Mutex::new(None),
            replication_counters: Arc::new(ReplicationCounters::default()),
            post_init_tx,
            shutdown_tx,
            tasks: parking_lot::Mutex::new(Vec::new()),
            heartbeat_counters: HeartbeatCounters::default(),
            register_counters: RegisterCounters::default(),
            weak_self: RwLock::new(None),
            config,
        });

        *store.weak_self.write() = Some(Arc::downgrade(&store));
        store.install_corruption_hook();
        store.spawn_event_consumer();
        store.spawn_heartbeat_timer();

        if store.config.inline_post_initialization {
            store.run_post_initialization().await;
        } else {
            let background = Arc::clone(&store);
            let handle = tokio::spawn(async move {
                background.run_post_initialization().await;
            });
            store.tasks.lock().push(handle);
        }

        info!(
            location = %store.config.local_location,
            prefix = %store.config.checkpoint_prefix,
            "location store started"
        );
        Ok(store)
    }

    /// Run one heartbeat now. A heartbeat already in flight makes this a
    /// successful no-op.
    pub async fn heartbeat(&self) -> Result<()> {
        self.heartbeat_inner(false).await
    }

    /// Resolve locations for a batch of hashes, preserving input order.
    pub async fn get_bulk(
        &self,
        hashes: &[ContentHash],
        origin: GetBulkOrigin,
    ) -> Result<Vec<LocatedContent>> {
        self.await_post_init().await?;
        match origin {
            GetBulkOrigin::Local => self.get_bulk_local(hashes).await,
            GetBulkOrigin::Global => self.get_bulk_global(hashes).await,
        }
    }

    /// Register content now present on this machine.
    pub async fn register_local_location(
        &self,
        entries: &[HashWithSize],
        touch: bool,
    ) -> Result<()> {
        self.await_post_init().await?;
        let machine = self.require_machine_id()?;
        let now = Utc::now();
        let last_inactive = self.cluster.last_inactive_time();

        let mut eager = Vec::new();
        let mut event_adds = Vec::new();
        let mut touch_only = Vec::new();
        for item in entries {
            let action = classify_registration(
                &self.config,
                &self.db,
                &self.recently_added,
                &self.recently_removed,
                last_inactive,
                machine,
                item,
                now,
            );
            match action {
                RegisterAction::Skip => {
                    self.register_counters.skipped.fetch_add(1, Ordering::Relaxed);
                }
                RegisterAction::LazyTouchEventOnly => {
                    self.register_counters
                        .lazy_touches
                        .fetch_add(1, Ordering::Relaxed);
                    touch_only.push(item.hash);
                }
                RegisterAction::LazyEventOnly => {
                    self.register_counters
                        .lazy_events
                        .fetch_add(1, Ordering::Relaxed);
                    event_adds.push(*item);
                }
                RegisterAction::EagerGlobal(reason) => {
                    debug!(hash = ?item.hash, ?reason, "eager registration");
                    self.register_counters.eager.fetch_add(1, Ordering::Relaxed);
                    eager.push(*item);
                    event_adds.push(*item);
                }
            }
        }

        if !eager.is_empty() {
            self.global.register_local_locations(machine, &eager).await?;
        }
        if !event_adds.is_empty() {
            self.events
                .add_locations(machine, event_adds.clone(), touch)
                .await;
            for item in &event_adds {
                self.recently_added.add(item.hash.short());
                self.recently_removed.invalidate(&item.hash.short());
            }
        }
        if !touch_only.is_empty() {
            self.events
                .touch(machine, touch_only.clone(), now.timestamp())
                .await;
            for hash in &touch_only {
                self.recently_touched.add(hash.short());
            }
        }
        Ok(())
    }

    /// Refresh last-access for content used locally. Touches collapse to at
    /// most one event per hash per touch window.
    pub async fn touch_bulk(&self, hashes: &[ContentHash]) -> Result<()> {
        self.await_post_init().await?;
        let machine = self.require_machine_id()?;
        let now = Utc::now().timestamp();
        let touch_secs = self.config.touch_frequency.as_secs() as i64;

        let entries = self.db.get_bulk(hashes);
        let remainder: Vec<ContentHash> = hashes
            .iter()
            .zip(entries)
            .filter(|(hash, entry)| {
                if self.recently_added.contains(&hash.short())
                    || self.recently_touched.contains(&hash.short())
                {
                    return false;
                }
                match entry {
                    Some(entry) => !entry.touched_within(touch_secs, now),
                    None => true,
                }
            })
            .map(|(hash, _)| *hash)
            .collect();

        if !remainder.is_empty() {
            self.events.touch(machine, remainder.clone(), now).await;
            for hash in &remainder {
                self.recently_touched.add(hash.short());
            }
        }
        Ok(())
    }

    /// Announce that content is gone from this machine.
    pub async fn trim_bulk(&self, hashes: &[ContentHash]) -> Result<()> {
        self.await_post_init().await?;
        let machine = self.require_machine_id()?;

        for hash in hashes {
            self.recently_added.invalidate(&hash.short());
            self.recently_removed.add(hash.short());
        }
        self.events.remove_locations(machine, hashes.to_vec()).await;
        Ok(())
    }

    /// Lazily order candidates for eviction; see the eviction module for
    /// the cost model.
    pub async fn get_hashes_in_eviction_order(
        &self,
        candidates: Vec<HashWithLastAccess>,
        reverse: bool,
    ) -> Result<impl Iterator<Item = EvictionCandidate>> {
        self.await_post_init().await?;
        Ok(order_for_eviction(
            Arc::clone(&self.db),
            candidates,
            self.config.eviction.clone(),
            reverse,
            Utc::now().timestamp(),
        ))
    }

    /// Rebuild this machine's contribution to the location index from the
    /// local content store.
    pub async fn reconcile(&self) -> Result<ReconcileOutcome> {
        self.await_post_init().await?;
        self.reconcile_inner().await
    }

    /// Clear the reconcile marker and drop this machine's registrations
    /// from the global store.
    pub async fn invalidate_local_machine(&self) -> Result<()> {
        self.await_post_init().await?;
        let machine = self.require_machine_id()?;
        reconcile::clear_marker(&self.config.working_dir).await?;
        self.global.invalidate_local_machine(machine).await
    }

    /// Await background work and tear components down, aggregating
    /// failures.
    pub async fn shutdown(&self) -> Result<()> {
        info!("location store shutting down");
        let _ = self.shutdown_tx.send(true);

        // Cancel any replication pass first: an inline pass runs under the
        // heartbeat gate we are about to wait on.
        if let Some(token) = self.replication_cancel.lock().await.as_ref() {
            let _ = token.send(true);
        }

        // Await an in-flight heartbeat; the gate serializes them.
        drop(self.heartbeat_gate.lock().await);

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        let mut failures = Vec::new();
        if self.current_role().is_master() {
            match self.global.release_role_if_necessary(Role::Master).await {
                Ok(role) => {
                    self.db.set_writeable(role.is_master());
                    self.role.write().current_role = role;
                }
                Err(e) => failures.push(format!("role release: {}", e)),
            }
        }
        self.events.suspend_processing();
        // The database is an in-memory view; nothing to flush.
        if let Err(e) = self.global.shutdown().await {
            failures.push(format!("global store: {}", e));
        }
        if let Err(e) = self.storage.shutdown().await {
            failures.push(format!("central storage: {}", e));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(LocusError::Shutdown(failures))
        }
    }

    pub fn current_role(&self) -> Role {
        self.role.read().current_role
    }

    /// Direct access to the underlying content location database.
    pub fn database(&self) -> Arc<ContentLocationDatabase> {
        Arc::clone(&self.db)
    }

    /// Direct access to this node's event stream client.
    pub fn event_store(&self) -> Arc<EventStore> {
        Arc::clone(&self.events)
    }

    pub fn local_machine_id(&self) -> Option<MachineId> {
        self.cluster.local_machine_id()
    }

    /// Report the outcome of talking to another machine; feeds location
    /// ordering.
    pub fn report_reputation(
        &self,
        machine: MachineId,
        reputation: crate::reputation::MachineReputation,
    ) {
        self.reputation.report(machine, reputation);
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            role: self.current_role(),
            heartbeats: self.heartbeat_counters.heartbeats.load(Ordering::Relaxed),
            role_switches: self.heartbeat_counters.role_switches.load(Ordering::Relaxed),
            restores: self.heartbeat_counters.restores.load(Ordering::Relaxed),
            restore_skips: self.heartbeat_counters.restore_skips.load(Ordering::Relaxed),
            checkpoints_created: self
                .heartbeat_counters
                .checkpoints_created
                .load(Ordering::Relaxed),
            register: RegisterStats {
                eager: self.register_counters.eager.load(Ordering::Relaxed),
                lazy_events: self.register_counters.lazy_events.load(Ordering::Relaxed),
                lazy_touches: self.register_counters.lazy_touches.load(Ordering::Relaxed),
                skipped: self.register_counters.skipped.load(Ordering::Relaxed),
            },
            replication: self.replication_counters.snapshot(),
            database: self.db.stats(),
            events: self.events.stats(),
        }
    }

    // ------------------------------------------------------------------
    // Startup machinery
    // ------------------------------------------------------------------

    fn install_corruption_hook(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::runtime::Handle::current();
        self.db.set_corruption_hook(Box::new(move |reason| {
            let reason = reason.to_string();
            if let Some(store) = weak.upgrade() {
                handle.spawn(async move {
                    store.on_database_invalidated(&reason).await;
                });
            }
        }));
    }

    fn spawn_event_consumer(self: &Arc<Self>) {
        let mut rx = self.bus.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        let store = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    event = rx.recv() => {
                        match event {
                            Some(event) => store.handle_event(event),
                            None => break,
                        }
                    }
                }
            }
            debug!("event consumer stopped");
        });
        self.tasks.lock().push(handle);
    }

    fn spawn_heartbeat_timer(self: &Arc<Self>) {
        let interval = self.config.heartbeat.heartbeat_interval;
        let mut shutdown = self.shutdown_tx.subscribe();
        let store = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = store.heartbeat_inner(false).await {
                            warn!(error = %e, "heartbeat failed; will retry next interval");
                        }
                    }
                }
            }
            debug!("heartbeat timer stopped");
        });
        self.tasks.lock().push(handle);
    }

    async fn run_post_initialization(&self) {
        match self.heartbeat_inner(false).await {
            Ok(()) => {}
            Err(e) => {
                error!(error = %e, "post-initialization heartbeat failed");
                self.post_init_tx.send_if_modified(|state| {
                    if matches!(state, PostInitState::Ready) {
                        false
                    } else {
                        *state = PostInitState::Failed(e.to_string());
                        true
                    }
                });
            }
        }
    }

    async fn await_post_init(&self) -> Result<()> {
        let mut rx = self.post_init_tx.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                PostInitState::Ready => return Ok(()),
                PostInitState::Failed(msg) => {
                    return Err(LocusError::Remote(format!(
                        "post-initialization failed: {}",
                        msg
                    )));
                }
                PostInitState::Pending => {
                    if rx.changed().await.is_err() {
                        return Err(LocusError::Cancelled("store dropped".into()));
                    }
                }
            }
        }
    }

    fn handle_event(&self, event: SequencedEvent) {
        // Every incoming event proves its sender is alive.
        self.cluster.mark_active(event.event.machine());
        if self.db.is_writeable() {
            event.event.apply_to(&DbEventApplier { db: self.db.as_ref() });
        }
        self.events.note_processed(event.sequence);
    }

    // ------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------

    async fn heartbeat_inner(&self, force_restore: bool) -> Result<()> {
        // Non-blocking gate: the loser returns success without doing work.
        let Ok(_gate) = self.heartbeat_gate.try_lock() else {
            return Ok(());
        };
        if *self.shutdown_tx.borrow() {
            return Ok(());
        }
        self.heartbeat_counters
            .heartbeats
            .fetch_add(1, Ordering::Relaxed);

        let result = self.heartbeat_body(force_restore).await;
        if result.is_ok() {
            self.post_init_tx.send_if_modified(|state| {
                if matches!(state, PostInitState::Ready) {
                    false
                } else {
                    *state = PostInitState::Ready;
                    true
                }
            });
        }
        result
    }

    async fn heartbeat_body(&self, force_restore: bool) -> Result<()> {
        let state = self.global.get_checkpoint_state().await?;
        let now = Utc::now();

        let (old_role, last_restore) = {
            let role = self.role.read();
            (role.current_role, role.last_restore)
        };
        let switched = state.role != old_role;
        if switched {
            info!(from = ?old_role, to = ?state.role, "role switched");
            self.db.set_writeable(state.role.is_master());
            self.heartbeat_counters
                .role_switches
                .fetch_add(1, Ordering::Relaxed);
        }

        let restore_due = match last_restore {
            None => true,
            Some(at) => {
                now.signed_duration_since(at)
                    >= chrono_duration(self.config.heartbeat.restore_checkpoint_interval)
            }
        };
        let should_restore =
            force_restore || switched || (state.role == Role::Worker && restore_due);
        if should_restore {
            self.restore_checkpoint(&state, now).await?;
            let mut role = self.role.write();
            role.last_restore = Some(now);
            role.last_checkpoint = Some(now);
        }

        // Refresh cluster state from the database copy and the directory;
        // persist the merged view only when we are the master.
        if let Some(snapshot) = self.db.cluster_snapshot() {
            self.cluster.merge_snapshot(&snapshot, now);
        }
        let response = self.global.update_cluster_state(self.cluster.to_update()).await?;
        self.cluster.apply_response(&response, now);
        if state.role.is_master() {
            self.db.store_cluster_snapshot(self.cluster.snapshot())?;
        }

        if state.role.is_master() {
            self.events.start_processing(state.start_sequence_point);
        } else {
            self.events.suspend_processing();
        }

        if state.role.is_master() {
            let checkpoint_due = {
                let role = self.role.read();
                match role.last_checkpoint {
                    None => true,
                    Some(at) => {
                        now.signed_duration_since(at)
                            >= chrono_duration(self.config.heartbeat.create_checkpoint_interval)
                    }
                }
            };
            if checkpoint_due {
                if let Some(sequence_point) = self.events.last_processed_sequence_point() {
                    let manifest = self.checkpoints.create_checkpoint(sequence_point).await?;
                    let mut role = self.role.write();
                    role.last_checkpoint = Some(now);
                    role.last_checkpoint_id = Some(manifest.checkpoint_id);
                    self.heartbeat_counters
                        .checkpoints_created
                        .fetch_add(1, Ordering::Relaxed);
                }
            }

            let expiry = self.config.location_entry_expiry.as_secs() as i64;
            self.db.compact_expired(now.timestamp(), expiry)?;
        }

        self.role.write().current_role = state.role;

        // The first completed restore kicks off reconciliation and, when
        // enabled, proactive replication. Runs after the cluster refresh so
        // the machine id is assigned.
        let first_restore = {
            let mut role = self.role.write();
            if should_restore && !role.first_restore_done {
                role.first_restore_done = true;
                true
            } else {
                false
            }
        };
        if first_restore {
            self.after_first_restore().await;
        }

        Ok(())
    }

    async fn restore_checkpoint(&self, state: &CheckpointState, now: DateTime<Utc>) -> Result<()> {
        let latest = self.checkpoints.latest_checkpoint().await?;
        let (is_first, last_checkpoint_id) = {
            let role = self.role.read();
            (role.last_restore.is_none(), role.last_checkpoint_id.clone())
        };

        // A process that just started next to a fresh checkpoint skips the
        // restore entirely; its database will be caught up by the next
        // scheduled restore long before staleness matters.
        if is_first {
            if let Some(latest) = &latest {
                let threshold =
                    chrono_duration(self.config.heartbeat.restore_checkpoint_age_threshold);
                if latest.age(now) <= threshold {
                    info!(
                        checkpoint_id = %latest.checkpoint_id,
                        "first restore skipped: latest checkpoint is fresh"
                    );
                    self.heartbeat_counters
                        .restore_skips
                        .fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
            }
        }

        let Some(checkpoint_id) = &state.checkpoint_id else {
            return Ok(());
        };
        if last_checkpoint_id.as_deref() == Some(checkpoint_id.as_str()) {
            debug!(checkpoint_id = %checkpoint_id, "already restored");
            return Ok(());
        }
        if !state.checkpoint_available {
            warn!(checkpoint_id = %checkpoint_id, "checkpoint not yet available in central storage");
            return Ok(());
        }

        self.checkpoints.restore_checkpoint(checkpoint_id).await?;
        self.role.write().last_checkpoint_id = Some(checkpoint_id.clone());
        self.heartbeat_counters
            .restores
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn after_first_restore(&self) {
        if self.config.reconciliation.enabled {
            let store = match self.self_arc() {
                Some(store) => store,
                None => return,
            };
            let handle = tokio::spawn(async move {
                match store.reconcile_inner().await {
                    Ok(outcome) if outcome.skipped => {
                        debug!("post-restore reconciliation skipped; marker fresh")
                    }
                    Ok(outcome) => info!(
                        added = outcome.hashes_added,
                        removed = outcome.hashes_removed,
                        "post-restore reconciliation complete"
                    ),
                    Err(e) => warn!(error = %e, "post-restore reconciliation failed"),
                }
            });
            self.tasks.lock().push(handle);
        }

        if self.config.replication.enabled {
            if self.config.replication.inline {
                self.run_proactive_replication().await;
            } else if let Some(store) = self.self_arc() {
                let handle = tokio::spawn(async move {
                    store.run_proactive_replication().await;
                });
                self.tasks.lock().push(handle);
            }
        }
    }

    async fn reconcile_inner(&self) -> Result<ReconcileOutcome> {
        let machine = self.require_machine_id()?;
        let run = ReconcileRun {
            db: Arc::clone(&self.db),
            events: Arc::clone(&self.events),
            bus: Arc::clone(&self.bus),
            content: Arc::clone(&self.content),
            machine,
            working_dir: self.config.working_dir.clone(),
            checkpoint_prefix: self.config.checkpoint_prefix.clone(),
            entry_expiry: self.config.location_entry_expiry,
            cycle_frequency: self.config.reconciliation.cycle_frequency,
            max_cycle_size: self.config.reconciliation.max_cycle_size,
            cancel: self.shutdown_tx.subscribe(),
        };
        run.run().await
    }

    async fn run_proactive_replication(&self) {
        let machine = match self.local_machine_id() {
            Some(machine) => machine,
            None => {
                warn!("proactive replication skipped: machine id not yet assigned");
                return;
            }
        };

        // Hand off the cancellation token; the previous pass, if any, is
        // cancelled by the replacement.
        let (token, cancel) = watch::channel(false);
        {
            let mut slot = self.replication_cancel.lock().await;
            if let Some(previous) = slot.replace(token) {
                let _ = previous.send(true);
            }
        }

        let run = ReplicationRun {
            db: Arc::clone(&self.db),
            content: Arc::clone(&self.content),
            copier: Arc::clone(&self.copier),
            cluster: Arc::clone(&self.cluster),
            reputation: Arc::clone(&self.reputation),
            machine,
            config: self.config.replication.clone(),
            eviction: self.config.eviction.clone(),
            counters: Arc::clone(&self.replication_counters),
            cancel,
        };
        match run.run().await {
            Ok(outcomes) => info!(outcomes, "proactive replication pass complete"),
            Err(e) if matches!(e, LocusError::Cancelled(_)) => {
                debug!("proactive replication pass superseded")
            }
            Err(e) => warn!(error = %e, "proactive replication pass failed"),
        }
    }

    async fn on_database_invalidated(&self, reason: &str) {
        // Second non-blocking gate: concurrent corruption callbacks
        // collapse into one forced restore.
        let Ok(_gate) = self.invalidation_gate.try_lock() else {
            return;
        };
        warn!(reason, "database invalidated; forcing restore heartbeat");
        if let Err(e) = self.heartbeat_inner(true).await {
            error!(error = %e, "forced restore heartbeat failed");
        }
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    async fn get_bulk_local(&self, hashes: &[ContentHash]) -> Result<Vec<LocatedContent>> {
        let now = Utc::now().timestamp();
        let touch_secs = self.config.touch_frequency.as_secs() as i64;
        let local_machine = self.cluster.local_machine_id();

        let entries = self.db.get_bulk(hashes);
        let mut stale = Vec::new();
        let results = hashes
            .iter()
            .zip(entries)
            .map(|(hash, entry)| match entry {
                Some(entry) => {
                    if !entry.touched_within(touch_secs, now)
                        && !self.recently_touched.contains(&hash.short())
                    {
                        stale.push(*hash);
                        self.recently_touched.add(hash.short());
                    }
                    LocatedContent {
                        hash: *hash,
                        size: entry.size,
                        locations: self.reputation.order_locations(
                            &entry.locations,
                            &self.cluster,
                            local_machine,
                        ),
                    }
                }
                None => LocatedContent::missing(*hash),
            })
            .collect();

        if !stale.is_empty() {
            if let Some(machine) = local_machine {
                self.events.touch(machine, stale, now).await;
            }
        }
        Ok(results)
    }

    async fn get_bulk_global(&self, hashes: &[ContentHash]) -> Result<Vec<LocatedContent>> {
        let entries = self.global.get_bulk(hashes).await?;
        let local_machine = self.cluster.local_machine_id();

        // Any unresolved machine id means our cluster view is stale; one
        // synchronous refresh, then resolve best-effort.
        let needs_refresh = entries.iter().flatten().any(|entry| {
            let (_, unknown) = self.cluster.resolve_set(&entry.locations);
            !unknown.is_empty()
        });
        if needs_refresh {
            debug!("unknown machine ids in global entries; refreshing cluster state");
            let response = self
                .global
                .update_cluster_state(self.cluster.to_update())
                .await?;
            self.cluster.apply_response(&response, Utc::now());
        }

        Ok(hashes
            .iter()
            .zip(entries)
            .map(|(hash, entry)| match entry {
                Some(entry) => LocatedContent {
                    hash: *hash,
                    size: entry.size,
                    locations: self.reputation.order_locations(
                        &entry.locations,
                        &self.cluster,
                        local_machine,
                    ),
                },
                None => LocatedContent::missing(*hash),
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn require_machine_id(&self) -> Result<MachineId> {
        self.cluster.local_machine_id().ok_or_else(|| {
            LocusError::Precondition(
                "machine id not yet assigned by the global store".to_string(),
            )
        })
    }

    /// Recover an owning handle from `&self`; installed by `start`.
    fn self_arc(&self) -> Option<Arc<Self>> {
        self.weak_self.read().as_ref().and_then(|weak| weak.upgrade())
    }
}

#[async_trait]
impl LocationStoreClient for LocalLocationStore {
    async fn get_bulk(
        &self,
        hashes: &[ContentHash],
        origin: GetBulkOrigin,
    ) -> Result<Vec<LocatedContent>> {
        LocalLocationStore::get_bulk(self, hashes, origin).await
    }

    async fn register_local_location(
        &self,
        entries: &[HashWithSize],
        touch: bool,
    ) -> Result<()> {
        LocalLocationStore::register_local_location(self, entries, touch).await
    }
}

/// Adapter applying consumed events to the local database. Mutations go
/// through the writeable gate, so a worker's applier is a no-op for the
/// database while still advancing the cursor and cluster liveness.
struct DbEventApplier<'a> {
    db: &'a ContentLocationDatabase,
}

impl EventConsumer for DbEventApplier<'_> {
    fn location_added(&self, machine: MachineId, entries: &[HashWithSize], touch: bool) {
        let now = Utc::now().timestamp();
        if let Err(e) = self.db.apply_add(machine, entries, touch, now) {
            debug!(error = %e, machine, "add event not applied");
        }
    }

    fn location_removed(&self, machine: MachineId, hashes: &[ContentHash]) {
        if let Err(e) = self.db.apply_remove(machine, hashes) {
            debug!(error = %e, machine, "remove event not applied");
        }
    }

    fn content_touched(&self, machine: MachineId, hashes: &[ContentHash], at: UnixSeconds) {
        if let Err(e) = self.db.apply_touch(hashes, at) {
            debug!(error = %e, machine, "touch event not applied");
        }
    }
}

fn chrono_duration(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::max_value())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const LOCAL: MachineId = 1;

    fn hash(prefix: u8) -> ContentHash {
        let mut bytes = [0u8; 32];
        bytes[0] = prefix;
        ContentHash::from_bytes(bytes)
    }

    fn item(prefix: u8) -> HashWithSize {
        HashWithSize {
            hash: hash(prefix),
            size: 100,
        }
    }

    struct PolicyFixture {
        config: LocationStoreConfig,
        db: ContentLocationDatabase,
        recently_added: VolatileSet<ShortHash>,
        recently_removed: VolatileSet<ShortHash>,
        last_inactive: Option<DateTime<Utc>>,
    }

    impl PolicyFixture {
        fn new() -> Self {
            let mut config = LocationStoreConfig::development("/tmp/locus-policy-tests");
            config.touch_frequency = Duration::from_secs(300);
            config.safe_to_lazily_update_machine_count_threshold = 3;
            let db = ContentLocationDatabase::new();
            db.set_writeable(true);
            Self {
                config,
                db,
                recently_added: VolatileSet::new(Duration::from_secs(300)),
                recently_removed: VolatileSet::new(Duration::from_secs(300)),
                last_inactive: None,
            }
        }

        fn classify(&self, item: &HashWithSize) -> RegisterAction {
            classify_registration(
                &self.config,
                &self.db,
                &self.recently_added,
                &self.recently_removed,
                self.last_inactive,
                LOCAL,
                item,
                Utc::now(),
            )
        }

        fn seed_entry(&self, prefix: u8, machines: &[MachineId], last_access: UnixSeconds) {
            for machine in machines {
                self.db
                    .apply_add(*machine, &[item(prefix)], false, last_access)
                    .unwrap();
            }
            self.db.apply_touch(&[hash(prefix)], last_access).unwrap();
        }
    }

    #[test]
    fn test_unknown_hash_is_eager() {
        let fixture = PolicyFixture::new();
        assert_eq!(
            fixture.classify(&item(1)),
            RegisterAction::EagerGlobal(EagerReason::LowReplicaCount)
        );
    }

    #[test]
    fn test_recent_remove_forces_eager() {
        let fixture = PolicyFixture::new();
        fixture.recently_removed.add(hash(1).short());
        assert_eq!(
            fixture.classify(&item(1)),
            RegisterAction::EagerGlobal(EagerReason::RecentRemove)
        );
    }

    #[test]
    fn test_recent_remove_wins_over_recent_add() {
        let fixture = PolicyFixture::new();
        fixture.recently_added.add(hash(1).short());
        fixture.recently_removed.add(hash(1).short());
        assert_eq!(
            fixture.classify(&item(1)),
            RegisterAction::EagerGlobal(EagerReason::RecentRemove)
        );
    }

    #[test]
    fn test_recent_inactivity_forces_eager() {
        let mut fixture = PolicyFixture::new();
        fixture.recently_added.add(hash(1).short());
        fixture.last_inactive = Some(Utc::now() - chrono::Duration::seconds(10));
        assert_eq!(
            fixture.classify(&item(1)),
            RegisterAction::EagerGlobal(EagerReason::RecentInactive)
        );
    }

    #[test]
    fn test_old_inactivity_is_ignored() {
        let mut fixture = PolicyFixture::new();
        let window = fixture.config.recompute_inactive_machines_expiry * 5;
        fixture.last_inactive =
            Some(Utc::now() - chrono_duration(window) - chrono::Duration::seconds(1));
        assert_eq!(
            fixture.classify(&item(1)),
            RegisterAction::EagerGlobal(EagerReason::LowReplicaCount)
        );
    }

    #[test]
    fn test_recently_added_skips() {
        let fixture = PolicyFixture::new();
        fixture.recently_added.add(hash(1).short());
        assert_eq!(fixture.classify(&item(1)), RegisterAction::Skip);
    }

    #[test]
    fn test_suppression_disabled_ignores_volatile_sets() {
        let mut fixture = PolicyFixture::new();
        fixture.config.skip_redundant_content_location_add = false;
        fixture.recently_added.add(hash(1).short());
        fixture.recently_removed.add(hash(1).short());
        assert_eq!(
            fixture.classify(&item(1)),
            RegisterAction::EagerGlobal(EagerReason::LowReplicaCount)
        );
    }

    #[test]
    fn test_fresh_local_entry_skips() {
        let fixture = PolicyFixture::new();
        fixture.seed_entry(1, &[LOCAL, 2, 3, 4, 5], Utc::now().timestamp());
        assert_eq!(fixture.classify(&item(1)), RegisterAction::Skip);
    }

    #[test]
    fn test_stale_local_entry_is_lazy_touch() {
        let fixture = PolicyFixture::new();
        let stale = Utc::now().timestamp() - 2 * 300;
        fixture.seed_entry(1, &[LOCAL, 2, 3, 4, 5], stale);
        assert_eq!(fixture.classify(&item(1)), RegisterAction::LazyTouchEventOnly);
    }

    #[test]
    fn test_well_replicated_entry_is_lazy_event() {
        let fixture = PolicyFixture::new();
        fixture.seed_entry(1, &[2, 3, 4], Utc::now().timestamp());
        assert_eq!(fixture.classify(&item(1)), RegisterAction::LazyEventOnly);
    }

    #[test]
    fn test_under_replicated_entry_is_eager() {
        let fixture = PolicyFixture::new();
        fixture.seed_entry(1, &[2, 3], Utc::now().timestamp());
        assert_eq!(
            fixture.classify(&item(1)),
            RegisterAction::EagerGlobal(EagerReason::LowReplicaCount)
        );
    }
}
