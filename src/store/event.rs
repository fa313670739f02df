//! Operation-event store
//!
//! Keyed by EventID. An event's lines accumulate in its barrel up to
//! `max_lines_per_event`; the count survives eviction and is cleared when the
//! event is finalized. Every accepted line is queued for persistence; a barrel
//! is written when its sub-buffer reaches `persist_threshold`, when it has
//! been untouched for `persist_idle`, and always before eviction. The
//! "callback" control message closes an event: its lines are persisted and
//! its terminal status recorded through the [`EventStatusSink`].

use super::barrel::{closed_queue, BarrelLimits, SubscriberQueue};
use super::control::{ControlOp, ControlQueue};
use super::engine::BarrelMap;
use super::read::ReadStore;
use super::{telemetry, MessageStore, MonitorData, StoreContext, StoreKind};
use crate::message::MessageEnvelope;
use crate::persist::{EventStatusSink, MessagePersister};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const STORE: &str = "event";

#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    /// Lines accepted per event, and the live window size; later lines are
    /// dropped
    pub max_lines_per_event: usize,
    /// Sub-buffer length that requests an immediate write
    pub persist_threshold: usize,
    /// Outbound queue capacity per subscriber
    pub subscriber_queue: usize,
    /// Idle window before an event without subscribers is evicted
    pub idle_timeout: Duration,
    /// Untouched time after which unflushed lines are written
    pub persist_idle: Duration,
    /// Periodic persistence interval
    pub persist_interval: Duration,
    /// GC sweep interval
    pub gc_interval: Duration,
    /// Control queue capacity
    pub control_queue: usize,
    /// Recycled barrels kept for reuse
    pub pool_size: usize,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            max_lines_per_event: 50_000,
            persist_threshold: 256,
            subscriber_queue: 64,
            idle_timeout: Duration::from_secs(30),
            persist_idle: Duration::from_secs(60),
            persist_interval: Duration::from_secs(60),
            gc_interval: Duration::from_secs(30),
            control_queue: 1024,
            pool_size: 256,
        }
    }
}

pub struct EventStore {
    config: EventStoreConfig,
    map: BarrelMap,
    /// Lines accepted per event across barrel reallocations
    line_totals: DashMap<String, usize>,
    persister: Arc<dyn MessagePersister>,
    status_sink: Arc<dyn EventStatusSink>,
    read: Option<Arc<ReadStore>>,
    control: ControlQueue,
    control_rx: tokio::sync::Mutex<Option<mpsc::Receiver<ControlOp>>>,
    instance_id: String,
    shutdown: CancellationToken,
}

impl EventStore {
    pub fn new(
        config: EventStoreConfig,
        context: StoreContext,
        persister: Arc<dyn MessagePersister>,
        status_sink: Arc<dyn EventStatusSink>,
    ) -> Self {
        let limits = BarrelLimits {
            cache_count: config.max_lines_per_event,
            subscriber_queue: config.subscriber_queue,
        };
        let (control, control_rx) = ControlQueue::channel(config.control_queue);
        Self {
            map: BarrelMap::new(
                STORE,
                limits,
                config.pool_size,
                Some(persister.clone()),
                context.spill.clone(),
            ),
            line_totals: DashMap::new(),
            persister,
            status_sink,
            read: None,
            control,
            control_rx: tokio::sync::Mutex::new(Some(control_rx)),
            instance_id: context.instance_id,
            shutdown: context.shutdown.child_token(),
            config,
        }
    }

    /// Forward accepted envelopes to `read` for live tailing.
    pub fn with_read_store(mut self, read: Arc<ReadStore>) -> Self {
        self.read = Some(read);
        self
    }

    pub fn persister(&self) -> &Arc<dyn MessagePersister> {
        &self.persister
    }

    pub fn resident(&self, key: &str) -> bool {
        self.map.contains(key)
    }

    /// Lines accepted for `event_id` since it was last finalized.
    pub fn line_total(&self, event_id: &str) -> usize {
        self.line_totals.get(event_id).map(|total| *total).unwrap_or(0)
    }

    /// Count one line against the event's cap. False once the cap is reached.
    fn admit_line(&self, event_id: &str) -> bool {
        let mut total = self.line_totals.entry(event_id.to_string()).or_insert(0);
        if *total >= self.config.max_lines_per_event {
            return false;
        }
        *total += 1;
        true
    }

    /// One GC pass as of `now`.
    pub async fn sweep_at(&self, now: Instant) -> Vec<String> {
        self.map.sweep(now, self.config.idle_timeout).await
    }

    /// Write every event untouched for `persist_idle` as of `now`.
    pub async fn persist_idle_at(&self, now: Instant) -> usize {
        let idle = self.config.persist_idle;
        self.map
            .persist_where(|barrel| now.saturating_duration_since(barrel.last_update()) >= idle)
            .await
    }

    /// Execute one control operation.
    pub async fn apply(&self, op: ControlOp) {
        match op {
            ControlOp::Persist { key } => {
                self.map.persist_key(&key).await;
            }
            ControlOp::Finalize {
                event_id,
                status,
                message,
            } => {
                match self
                    .status_sink
                    .finalize(&event_id, &status, &message)
                    .await
                {
                    Ok(()) => info!(event_id = %event_id, status = %status, "Event finalized"),
                    Err(e) => {
                        error!(event_id = %event_id, error = %e, "Failed to record event status")
                    }
                }
            }
        }
    }

    /// Apply every queued control operation without waiting for more.
    pub async fn drain_control(&self) -> usize {
        let mut guard = self.control_rx.lock().await;
        let Some(rx) = guard.as_mut() else {
            return 0;
        };
        let mut ops = Vec::new();
        while let Ok(op) = rx.try_recv() {
            ops.push(op);
        }
        drop(guard);
        let n = ops.len();
        for op in ops {
            self.apply(op).await;
        }
        n
    }

    fn finalize(&self, envelope: &MessageEnvelope) {
        let key = envelope.stream_key.clone();
        self.line_totals.remove(&key);
        self.control.submit(ControlOp::Persist { key: key.clone() });
        self.control.submit(ControlOp::Finalize {
            event_id: key,
            status: envelope.status.clone(),
            message: envelope.message.clone(),
        });
    }
}

fn render(envelopes: Vec<Arc<MessageEnvelope>>) -> Vec<String> {
    envelopes.iter().map(|e| e.render()).collect()
}

#[async_trait]
impl MessageStore for EventStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Event
    }

    fn insert_message(&self, envelope: MessageEnvelope) {
        if !envelope.has_stream_key() {
            telemetry::record_malformed(STORE);
            warn!(store = STORE, "Dropping envelope without stream key");
            return;
        }
        if envelope.is_callback() {
            self.finalize(&envelope);
            return;
        }

        if !self.admit_line(&envelope.stream_key) {
            debug!(
                store = STORE,
                key = %envelope.stream_key,
                cap = self.config.max_lines_per_event,
                "Event line cap reached, dropping"
            );
            return;
        }
        let barrel = self.map.get_or_allocate(&envelope.stream_key);

        let envelope = Arc::new(envelope);
        let outcome = barrel.insert(envelope.clone(), true);
        self.map.record_lines(1);
        telemetry::record_insert(STORE);
        telemetry::record_subscriber_drops(STORE, outcome.delivery.dropped as u64);

        let threshold = self.config.persist_threshold.max(1);
        if outcome.pending % threshold == 0 {
            self.control.submit(ControlOp::Persist {
                key: barrel.key().to_string(),
            });
        }

        if let Some(read) = &self.read {
            read.insert_shared(envelope);
        }
    }

    fn sub_chan(&self, key: &str, subscriber_id: &str) -> SubscriberQueue {
        if key.trim().is_empty() {
            return closed_queue();
        }
        self.map.get_or_allocate(key).subscribe(subscriber_id, true)
    }

    fn release_sub_chan(&self, key: &str, subscriber_id: &str) {
        if let Some(barrel) = self.map.get(key) {
            barrel.unsubscribe(subscriber_id);
        }
    }

    async fn get_history_message(&self, key: &str, length: usize) -> Vec<String> {
        let resident = self.map.get(key);
        if let Some(barrel) = &resident {
            // Lines from a previously evicted barrel live only in the persister
            let covered = barrel.window_len() >= self.line_total(key)
                || (length > 0 && barrel.window_len() >= length);
            if covered {
                return render(barrel.history(length));
            }
            self.map.persist_barrel(barrel).await;
        }
        match self.persister.get_messages(key, None, length).await {
            Ok(lines) => lines,
            Err(e) => {
                warn!(store = STORE, key = %key, error = %e, "History read failed");
                resident
                    .map(|barrel| render(barrel.history(length)))
                    .unwrap_or_default()
            }
        }
    }

    fn get_monitor_data(&self) -> MonitorData {
        MonitorData {
            instance_id: self.instance_id.clone(),
            service_size: self.map.len() as u64,
            log_size_per_minute: self.map.lines_per_minute(),
        }
    }

    async fn run(&self) {
        let Some(mut control_rx) = self.control_rx.lock().await.take() else {
            warn!(store = STORE, "Event store sweep already running");
            return;
        };
        let mut gc = tokio::time::interval(self.config.gc_interval);
        gc.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut persist = tokio::time::interval(self.config.persist_interval);
        persist.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = gc.tick() => {
                    self.sweep_at(Instant::now()).await;
                }
                _ = persist.tick() => {
                    self.persist_idle_at(Instant::now()).await;
                }
                Some(op) = control_rx.recv() => {
                    self.apply(op).await;
                }
                _ = self.shutdown.cancelled() => {
                    while let Ok(op) = control_rx.try_recv() {
                        self.apply(op).await;
                    }
                    let written = self.map.persist_all().await;
                    info!(store = STORE, written, "Event store sweep stopped");
                    return;
                }
            }
        }
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        self.drain_control().await;
        self.map.persist_all().await;
    }
}
