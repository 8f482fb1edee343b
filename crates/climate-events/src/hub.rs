//! Event fan-out with a bounded replay ring.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Default replay ring capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Smallest allowed ring capacity.
const MIN_CAPACITY: usize = 16;

/// Extra slots a subscriber queue gets beyond the ring capacity, so a full
/// replay always fits without blocking.
const QUEUE_HEADROOM: usize = 16;

/// Events dropped because a subscriber queue was full (counter).
pub const EVENTS_DROPPED_TOTAL: &str = "hub_events_dropped_total";

/// One event on a hub.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    /// Monotonic per-hub id, assigned starting at 1. Never reused or skipped.
    pub id: u64,
    /// Short tag describing the event source (e.g. `codex/stdout`).
    pub kind: String,
    /// Opaque payload.
    pub data: String,
}

struct HubState {
    capacity: usize,
    next_id: u64,
    ring: VecDeque<Event>,
    subs: HashMap<u64, mpsc::Sender<Event>>,
    next_sub_id: u64,
    closed: bool,
}

/// Per-client event bus.
///
/// Id assignment, ring append, and subscriber registration all happen under
/// one lock, so a subscriber created by [`EventHub::subscribe_from`] observes
/// a contiguous id sequence: buffered events first (in id order), then every
/// later publish.
pub struct EventHub {
    inner: Mutex<HubState>,
}

impl EventHub {
    /// Create a hub with the given ring capacity (clamped to at least 16).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_CAPACITY);
        Self {
            inner: Mutex::new(HubState {
                capacity,
                next_id: 0,
                ring: VecDeque::with_capacity(capacity),
                subs: HashMap::new(),
                next_sub_id: 0,
                closed: false,
            }),
        }
    }

    /// Publish an event, returning its assigned id.
    ///
    /// Total: never fails and never blocks. Subscribers whose queue is full
    /// skip this event; they recover by reconnecting with their last seen id.
    /// Publishing on a closed hub is a no-op (returns 0).
    pub fn publish(&self, kind: &str, data: impl Into<String>) -> u64 {
        let mut state = self.inner.lock();
        if state.closed {
            return 0;
        }

        state.next_id += 1;
        let event = Event {
            id: state.next_id,
            kind: kind.to_owned(),
            data: data.into(),
        };

        if state.ring.len() == state.capacity {
            let _ = state.ring.pop_front();
        }
        state.ring.push_back(event.clone());

        for sender in state.subs.values() {
            if sender.try_send(event.clone()).is_err() {
                metrics::counter!(EVENTS_DROPPED_TOTAL).increment(1);
            }
        }
        event.id
    }

    /// Subscribe, replaying every buffered event with id > `last_event_id`
    /// before any live event.
    ///
    /// A request older than the ring floor replays from the floor; the gap is
    /// strictly at the start of the replay, never in the middle. Dropping the
    /// returned [`Subscription`] removes the queue. After [`EventHub::close`]
    /// the receiver is already closed.
    pub fn subscribe_from(
        self: &Arc<Self>,
        last_event_id: u64,
    ) -> (mpsc::Receiver<Event>, Subscription) {
        let mut state = self.inner.lock();
        let (tx, rx) = mpsc::channel(state.capacity + QUEUE_HEADROOM);

        if state.closed {
            // Dropping the sender leaves the receiver at EOF immediately.
            drop(tx);
            return (
                rx,
                Subscription {
                    hub: Weak::new(),
                    id: 0,
                    cancelled: true,
                },
            );
        }

        for event in &state.ring {
            if event.id > last_event_id {
                // Queue capacity exceeds ring capacity, so replay never fills it.
                let _ = tx.try_send(event.clone());
            }
        }

        state.next_sub_id += 1;
        let id = state.next_sub_id;
        let _ = state.subs.insert(id, tx);
        (
            rx,
            Subscription {
                hub: Arc::downgrade(self),
                id,
                cancelled: false,
            },
        )
    }

    /// Greatest id assigned so far (0 if none).
    pub fn high_water_mark(&self) -> u64 {
        self.inner.lock().next_id
    }

    /// Close the hub: every live queue is closed and the ring is dropped.
    /// Idempotent.
    pub fn close(&self) {
        let mut state = self.inner.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.subs.clear();
        state.ring = VecDeque::new();
        debug!("event hub closed");
    }

    /// Ring capacity.
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Number of live subscriber queues.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subs.len()
    }

    fn remove_subscriber(&self, id: u64) {
        let mut state = self.inner.lock();
        let _ = state.subs.remove(&id);
    }
}

/// Cancel handle for one subscriber queue.
///
/// Removes and closes the queue exactly once, either via
/// [`Subscription::cancel`] or on drop.
pub struct Subscription {
    hub: Weak<EventHub>,
    id: u64,
    cancelled: bool,
}

impl Subscription {
    /// Remove the subscriber queue from the hub.
    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        if let Some(hub) = self.hub.upgrade() {
            hub.remove_subscriber(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
