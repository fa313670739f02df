//! Barrel: the per-key unit of allocation in every store
//!
//! A barrel holds a bounded live window of envelopes, the subscriber queues
//! tailing the key, and a persistence sub-buffer of envelopes awaiting a
//! durable write. The live window and subscribers sit behind one short lock;
//! the persistence section has its own locks so a slow write never blocks
//! inserts.

use crate::message::MessageEnvelope;
use crate::persist::MessagePersister;
use crate::Error;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Receiving half of a subscriber queue
pub type SubscriberQueue = mpsc::Receiver<Arc<MessageEnvelope>>;

/// A queue whose sender is already gone, handed out for unusable keys.
pub fn closed_queue() -> SubscriberQueue {
    let (_, rx) = mpsc::channel(1);
    rx
}

/// Capacity limits applied to a barrel
#[derive(Debug, Clone, Copy)]
pub struct BarrelLimits {
    /// Maximum envelopes kept in the live window
    pub cache_count: usize,
    /// Outbound queue capacity per subscriber
    pub subscriber_queue: usize,
}

impl Default for BarrelLimits {
    fn default() -> Self {
        Self {
            cache_count: 512,
            subscriber_queue: 10,
        }
    }
}

/// Fan-out result for a single envelope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Subscribers whose queue was full
    pub dropped: usize,
}

/// Outcome of an insert
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertOutcome {
    pub delivery: Delivery,
    /// Persistence sub-buffer length after the insert
    pub pending: usize,
}

/// Outcome of a persistence attempt
#[derive(Debug)]
pub enum PersistOutcome {
    /// Nothing was waiting
    Empty,
    /// Envelopes durably written
    Saved(usize),
    /// Write failed; the envelopes are handed back for spilling
    Failed(Vec<Arc<MessageEnvelope>>, Error),
}

struct BarrelState {
    window: VecDeque<Arc<MessageEnvelope>>,
    subscribers: HashMap<String, mpsc::Sender<Arc<MessageEnvelope>>>,
    last_update: Instant,
}

impl BarrelState {
    fn new() -> Self {
        Self {
            window: VecDeque::new(),
            subscribers: HashMap::new(),
            last_update: Instant::now(),
        }
    }

    fn fan_out(&mut self, envelope: &Arc<MessageEnvelope>) -> Delivery {
        let mut delivery = Delivery::default();
        let mut closed = Vec::new();
        for (id, tx) in self.subscribers.iter() {
            match tx.try_send(envelope.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(TrySendError::Full(_)) => delivery.dropped += 1,
                Err(TrySendError::Closed(_)) => closed.push(id.clone()),
            }
        }
        for id in closed {
            self.subscribers.remove(&id);
        }
        delivery
    }

    fn trim(&mut self, cache_count: usize) {
        while self.window.len() > cache_count {
            self.window.pop_front();
        }
    }
}

/// Per-key buffer with subscriber fan-out and a persistence sub-buffer
pub struct Barrel {
    key: String,
    limits: BarrelLimits,
    state: Mutex<BarrelState>,
    pending: Mutex<Vec<Arc<MessageEnvelope>>>,
    /// Held across the durable write so per-key order is preserved
    flush_lock: tokio::sync::Mutex<()>,
}

impl Barrel {
    pub fn new(key: impl Into<String>, limits: BarrelLimits) -> Self {
        Self {
            key: key.into(),
            limits,
            state: Mutex::new(BarrelState::new()),
            pending: Mutex::new(Vec::new()),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Rebind a recycled barrel to a new key and limits.
    pub(crate) fn rebind(&mut self, key: String, limits: BarrelLimits) {
        self.key = key;
        self.limits = limits;
        self.state.get_mut().last_update = Instant::now();
    }

    /// Clear every buffer and close every subscriber queue.
    ///
    /// This is the only way a barrel is prepared for reuse.
    pub fn reset(&mut self) {
        self.key.clear();
        *self.state.get_mut() = BarrelState::new();
        self.pending.get_mut().clear();
    }

    /// Append to the live window, fan out to subscribers and, when `persist`
    /// is set, queue the envelope for a durable write.
    pub fn insert(&self, envelope: Arc<MessageEnvelope>, persist: bool) -> InsertOutcome {
        let mut state = self.state.lock();
        state.window.push_back(envelope.clone());
        state.trim(self.limits.cache_count);
        state.last_update = Instant::now();
        let delivery = state.fan_out(&envelope);

        let pending = if persist {
            let mut pending = self.pending.lock();
            pending.push(envelope);
            pending.len()
        } else {
            self.pending.lock().len()
        };

        InsertOutcome { delivery, pending }
    }

    /// Replace the first window entry matching `same` (or append), then fan
    /// the merged view produced by `merge` out to subscribers.
    pub fn upsert<F, M>(&self, envelope: Arc<MessageEnvelope>, same: F, merge: M) -> Delivery
    where
        F: Fn(&MessageEnvelope) -> bool,
        M: FnOnce(&VecDeque<Arc<MessageEnvelope>>) -> Option<Arc<MessageEnvelope>>,
    {
        let mut state = self.state.lock();
        match state.window.iter().position(|existing| same(existing)) {
            Some(idx) => state.window[idx] = envelope,
            None => {
                state.window.push_back(envelope);
                state.trim(self.limits.cache_count);
            }
        }
        state.last_update = Instant::now();
        match merge(&state.window) {
            Some(merged) => state.fan_out(&merged),
            None => Delivery::default(),
        }
    }

    /// Register a subscriber queue. A subscriber id already present is
    /// replaced and its previous queue closed. With `replay` the current live
    /// window is offered to the new queue first.
    pub fn subscribe(&self, subscriber_id: &str, replay: bool) -> SubscriberQueue {
        let (tx, rx) = mpsc::channel(self.limits.subscriber_queue.max(1));
        let mut state = self.state.lock();
        if replay {
            for envelope in state.window.iter() {
                if tx.try_send(envelope.clone()).is_err() {
                    break;
                }
            }
        }
        state.subscribers.insert(subscriber_id.to_string(), tx);
        rx
    }

    /// Offer one envelope to a single subscriber.
    pub fn publish_to(&self, subscriber_id: &str, envelope: Arc<MessageEnvelope>) -> bool {
        let state = self.state.lock();
        state
            .subscribers
            .get(subscriber_id)
            .map(|tx| tx.try_send(envelope).is_ok())
            .unwrap_or(false)
    }

    pub fn unsubscribe(&self, subscriber_id: &str) -> bool {
        self.state.lock().subscribers.remove(subscriber_id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Newest `length` envelopes of the live window, oldest first. A zero
    /// length returns the whole window.
    pub fn history(&self, length: usize) -> Vec<Arc<MessageEnvelope>> {
        let state = self.state.lock();
        let skip = if length == 0 {
            0
        } else {
            state.window.len().saturating_sub(length)
        };
        state.window.iter().skip(skip).cloned().collect()
    }

    pub fn window_len(&self) -> usize {
        self.state.lock().window.len()
    }

    pub fn last_update(&self) -> Instant {
        self.state.lock().last_update
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn needs_persistence(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    /// No subscribers and no update within `idle`.
    pub fn is_idle(&self, now: Instant, idle: std::time::Duration) -> bool {
        let state = self.state.lock();
        state.subscribers.is_empty() && now.saturating_duration_since(state.last_update) >= idle
    }

    /// Drain the persistence sub-buffer and write it through `persister`.
    pub async fn persist(&self, persister: &dyn MessagePersister) -> PersistOutcome {
        let _flush = self.flush_lock.lock().await;
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return PersistOutcome::Empty;
        }
        match persister.save_message(&batch).await {
            Ok(()) => PersistOutcome::Saved(batch.len()),
            Err(e) => PersistOutcome::Failed(batch, e),
        }
    }
}

impl std::fmt::Debug for Barrel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Barrel")
            .field("key", &self.key)
            .field("window", &self.window_len())
            .field("pending", &self.pending_len())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
