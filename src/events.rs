//! The content location event stream.
//!
//! Location changes ride an ordered, append-only stream of batched events:
//! `Added`, `Removed`, `Touched`, and `Reconciled`. Each node produces
//! events for its own content and consumes the whole stream to keep its
//! materialized database current. The stream transport assigns every event
//! a [`SequencePoint`]; checkpoints embed the last consumed point so that a
//! restored node resumes exactly where the snapshot left off.
//!
//! # Production control
//!
//! [`EventStore::start_processing`] and [`EventStore::suspend_processing`]
//! switch production on and off with the master/worker role. Orthogonally,
//! [`EventStore::pause_sending`] returns a guard that *buffers* outgoing
//! events for its lifetime: reconciliation pauses the main store, emits its
//! compensating batch through a separate short-lived store, and only then
//! lets the buffered events flow. That is what guarantees reconcile events
//! are observed before any post-reconcile event from the same node.

use crate::types::{ContentHash, HashWithSize, MachineId, SequencePoint, UnixSeconds};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// A batched location event, tagged with the machine that produced it.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LocationEvent {
    Added {
        machine: MachineId,
        entries: Vec<HashWithSize>,
        touch: bool,
    },
    Removed {
        machine: MachineId,
        hashes: Vec<ContentHash>,
    },
    Touched {
        machine: MachineId,
        hashes: Vec<ContentHash>,
        at: UnixSeconds,
    },
    Reconciled {
        machine: MachineId,
        added: Vec<HashWithSize>,
        removed: Vec<ContentHash>,
    },
}

impl LocationEvent {
    /// The machine that produced this event.
    pub fn machine(&self) -> MachineId {
        match self {
            LocationEvent::Added { machine, .. }
            | LocationEvent::Removed { machine, .. }
            | LocationEvent::Touched { machine, .. }
            | LocationEvent::Reconciled { machine, .. } => *machine,
        }
    }

    /// Deliver this event to a consumer. Reconcile batches decompose into
    /// their add and remove halves.
    pub fn apply_to(&self, consumer: &dyn EventConsumer) {
        match self {
            LocationEvent::Added {
                machine,
                entries,
                touch,
            } => consumer.location_added(*machine, entries, *touch),
            LocationEvent::Removed { machine, hashes } => {
                consumer.location_removed(*machine, hashes)
            }
            LocationEvent::Touched { machine, hashes, at } => {
                consumer.content_touched(*machine, hashes, *at)
            }
            LocationEvent::Reconciled {
                machine,
                added,
                removed,
            } => {
                if !added.is_empty() {
                    consumer.location_added(*machine, added, false);
                }
                if !removed.is_empty() {
                    consumer.location_removed(*machine, removed);
                }
            }
        }
    }
}

/// An event with its position in the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequencedEvent {
    pub sequence: SequencePoint,
    pub event: LocationEvent,
}

/// Consumer-side view of the stream, implemented by the database adapter.
pub trait EventConsumer: Send + Sync {
    fn location_added(&self, machine: MachineId, entries: &[HashWithSize], touch: bool);
    fn location_removed(&self, machine: MachineId, hashes: &[ContentHash]);
    fn content_touched(&self, machine: MachineId, hashes: &[ContentHash], at: UnixSeconds);
}

struct BusInner {
    next_sequence: SequencePoint,
    log: Vec<SequencedEvent>,
    subscribers: Vec<mpsc::UnboundedSender<SequencedEvent>>,
}

/// In-process event stream transport.
///
/// Assigns sequence points, retains the full log, and fans events out to
/// subscribers. Stands in for the cluster's hosted event hub; nodes under
/// test share one bus.
pub struct MemoryEventBus {
    inner: Mutex<BusInner>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BusInner {
                next_sequence: 1,
                log: Vec::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Append an event, assigning the next sequence point.
    pub fn publish(&self, event: LocationEvent) -> SequencePoint {
        let mut inner = self.inner.lock();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        let sequenced = SequencedEvent { sequence, event };
        inner.log.push(sequenced.clone());
        inner
            .subscribers
            .retain(|tx| tx.send(sequenced.clone()).is_ok());
        sequence
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SequencedEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push(tx);
        rx
    }

    /// The sequence point of the most recently published event.
    pub fn last_sequence(&self) -> SequencePoint {
        self.inner.lock().next_sequence - 1
    }

    /// Full copy of the stream so far.
    pub fn log(&self) -> Vec<SequencedEvent> {
        self.inner.lock().log.clone()
    }
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters describing event store activity since startup.
#[derive(Debug, Clone, Default)]
pub struct EventStoreStats {
    pub events_produced: u64,
    pub events_suppressed: u64,
    pub events_buffered: u64,
}

struct ProducerState {
    pause_depth: usize,
    pending: Vec<LocationEvent>,
}

struct ProducerShared {
    bus: Arc<MemoryEventBus>,
    producing: AtomicBool,
    state: Mutex<ProducerState>,
    produced: AtomicU64,
    suppressed: AtomicU64,
    buffered: AtomicU64,
}

impl ProducerShared {
    fn emit(&self, event: LocationEvent) {
        if !self.producing.load(Ordering::Acquire) {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            debug!(machine = event.machine(), "event suppressed: production off");
            return;
        }
        {
            let mut state = self.state.lock();
            if state.pause_depth > 0 {
                state.pending.push(event);
                self.buffered.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        self.bus.publish(event);
        self.produced.fetch_add(1, Ordering::Relaxed);
    }

    fn unpause(&self) {
        let drained = {
            let mut state = self.state.lock();
            state.pause_depth -= 1;
            if state.pause_depth == 0 {
                std::mem::take(&mut state.pending)
            } else {
                Vec::new()
            }
        };
        for event in drained {
            self.bus.publish(event);
            self.produced.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Buffers production for its lifetime; flushes buffered events in order on
/// drop. Release is guaranteed on every exit path.
pub struct EventPauseGuard {
    shared: Arc<ProducerShared>,
}

impl Drop for EventPauseGuard {
    fn drop(&mut self) {
        self.shared.unpause();
    }
}

/// This node's client to the event stream.
pub struct EventStore {
    shared: Arc<ProducerShared>,
    cursor_tx: watch::Sender<SequencePoint>,
    cursor_rx: watch::Receiver<SequencePoint>,
}

impl EventStore {
    /// Create a client over the given transport. Production starts off; a
    /// master turns it on via [`EventStore::start_processing`].
    pub fn new(bus: Arc<MemoryEventBus>) -> Self {
        let (cursor_tx, cursor_rx) = watch::channel(0);
        Self {
            shared: Arc::new(ProducerShared {
                bus,
                producing: AtomicBool::new(false),
                state: Mutex::new(ProducerState {
                    pause_depth: 0,
                    pending: Vec::new(),
                }),
                produced: AtomicU64::new(0),
                suppressed: AtomicU64::new(0),
                buffered: AtomicU64::new(0),
            }),
            cursor_tx,
            cursor_rx,
        }
    }

    /// Create a client with production already on. Used for the short-lived
    /// store that emits reconcile batches.
    pub fn new_producing(bus: Arc<MemoryEventBus>) -> Self {
        let store = Self::new(bus);
        store.shared.producing.store(true, Ordering::Release);
        store
    }

    /// Resume event production from the given sequence point.
    pub fn start_processing(&self, from: SequencePoint) {
        info!(from, "event production resumed");
        self.shared.producing.store(true, Ordering::Release);
    }

    /// Suspend event production; the consumer side keeps running.
    pub fn suspend_processing(&self) {
        if self.shared.producing.swap(false, Ordering::AcqRel) {
            info!("event production suspended");
        }
    }

    pub fn is_producing(&self) -> bool {
        self.shared.producing.load(Ordering::Acquire)
    }

    /// Scoped production pause. Events emitted while the guard lives are
    /// buffered and flushed, in order, when it drops.
    pub fn pause_sending(&self) -> EventPauseGuard {
        self.shared.state.lock().pause_depth += 1;
        EventPauseGuard {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Emit an Add batch.
    pub async fn add_locations(
        &self,
        machine: MachineId,
        entries: Vec<HashWithSize>,
        touch: bool,
    ) {
        self.shared.emit(LocationEvent::Added {
            machine,
            entries,
            touch,
        });
    }

    /// Emit a Remove batch.
    pub async fn remove_locations(&self, machine: MachineId, hashes: Vec<ContentHash>) {
        self.shared.emit(LocationEvent::Removed { machine, hashes });
    }

    /// Emit a Touch batch.
    pub async fn touch(&self, machine: MachineId, hashes: Vec<ContentHash>, at: UnixSeconds) {
        self.shared.emit(LocationEvent::Touched { machine, hashes, at });
    }

    /// Emit a Reconcile batch.
    pub async fn reconcile(
        &self,
        machine: MachineId,
        added: Vec<HashWithSize>,
        removed: Vec<ContentHash>,
    ) {
        self.shared.emit(LocationEvent::Reconciled {
            machine,
            added,
            removed,
        });
    }

    /// Record that the consumer has applied everything up to `sequence`.
    pub fn note_processed(&self, sequence: SequencePoint) {
        self.cursor_tx.send_if_modified(|current| {
            if sequence > *current {
                *current = sequence;
                true
            } else {
                false
            }
        });
    }

    /// The last sequence point the consumer has applied, if any. Checkpoint
    /// creation embeds this.
    pub fn last_processed_sequence_point(&self) -> Option<SequencePoint> {
        match *self.cursor_rx.borrow() {
            0 => None,
            sequence => Some(sequence),
        }
    }

    /// Wait until the consumer has applied at least `sequence`.
    pub async fn wait_until_processed(&self, sequence: SequencePoint) {
        let mut rx = self.cursor_rx.clone();
        while *rx.borrow() < sequence {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn stats(&self) -> EventStoreStats {
        EventStoreStats {
            events_produced: self.shared.produced.load(Ordering::Relaxed),
            events_suppressed: self.shared.suppressed.load(Ordering::Relaxed),
            events_buffered: self.shared.buffered.load(Ordering::Relaxed),
        }
    }
}
