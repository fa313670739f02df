//! Container-log store
//!
//! Keyed by ServiceID. Unlike the event store, pending lines are written on a
//! fixed interval whether or not the service is idle, so container output
//! survives a node restart. The rolling per-minute line count feeds the
//! node's load report.

use super::barrel::{closed_queue, BarrelLimits, SubscriberQueue};
use super::control::{ControlOp, ControlQueue};
use super::engine::BarrelMap;
use super::{telemetry, MessageStore, MonitorData, StoreContext, StoreKind};
use crate::message::MessageEnvelope;
use crate::persist::MessagePersister;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const STORE: &str = "container";

#[derive(Debug, Clone)]
pub struct ContainerStoreConfig {
    /// Live window per service
    pub cache_count: usize,
    /// Sub-buffer length that requests an immediate write
    pub persist_threshold: usize,
    /// Outbound queue capacity per subscriber
    pub subscriber_queue: usize,
    /// Idle window before a service without subscribers is evicted
    pub idle_timeout: Duration,
    /// Fixed persistence interval
    pub persist_interval: Duration,
    /// GC sweep interval
    pub gc_interval: Duration,
    /// Control queue capacity
    pub control_queue: usize,
    /// Recycled barrels kept for reuse
    pub pool_size: usize,
}

impl Default for ContainerStoreConfig {
    fn default() -> Self {
        Self {
            cache_count: 256,
            persist_threshold: 1024,
            subscriber_queue: 128,
            idle_timeout: Duration::from_secs(60),
            persist_interval: Duration::from_secs(60),
            gc_interval: Duration::from_secs(30),
            control_queue: 1024,
            pool_size: 256,
        }
    }
}

pub struct ContainerStore {
    config: ContainerStoreConfig,
    map: BarrelMap,
    persister: Arc<dyn MessagePersister>,
    control: ControlQueue,
    control_rx: tokio::sync::Mutex<Option<mpsc::Receiver<ControlOp>>>,
    instance_id: String,
    shutdown: CancellationToken,
}

impl ContainerStore {
    pub fn new(
        config: ContainerStoreConfig,
        context: StoreContext,
        persister: Arc<dyn MessagePersister>,
    ) -> Self {
        let limits = BarrelLimits {
            cache_count: config.cache_count,
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
            persister,
            control,
            control_rx: tokio::sync::Mutex::new(Some(control_rx)),
            instance_id: context.instance_id,
            shutdown: context.shutdown.child_token(),
            config,
        }
    }

    pub fn persister(&self) -> &Arc<dyn MessagePersister> {
        &self.persister
    }

    pub fn resident(&self, key: &str) -> bool {
        self.map.contains(key)
    }

    pub async fn sweep_at(&self, now: Instant) -> Vec<String> {
        self.map.sweep(now, self.config.idle_timeout).await
    }

    /// Write every service with pending lines.
    pub async fn persist_pending(&self) -> usize {
        self.map.persist_where(|_| true).await
    }

    async fn apply(&self, op: ControlOp) {
        match op {
            ControlOp::Persist { key } => {
                self.map.persist_key(&key).await;
            }
            other => warn!(store = STORE, op = other.name(), "Ignoring unsupported control op"),
        }
    }
}

#[async_trait]
impl MessageStore for ContainerStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Container
    }

    fn insert_message(&self, envelope: MessageEnvelope) {
        if !envelope.has_stream_key() {
            telemetry::record_malformed(STORE);
            warn!(store = STORE, "Dropping envelope without stream key");
            return;
        }
        let barrel = self.map.get_or_allocate(&envelope.stream_key);
        let outcome = barrel.insert(Arc::new(envelope), true);
        self.map.record_lines(1);
        telemetry::record_insert(STORE);
        telemetry::record_subscriber_drops(STORE, outcome.delivery.dropped as u64);

        if outcome.pending % self.config.persist_threshold.max(1) == 0 {
            self.control.submit(ControlOp::Persist {
                key: barrel.key().to_string(),
            });
        }
    }

    fn sub_chan(&self, key: &str, subscriber_id: &str) -> SubscriberQueue {
        if key.trim().is_empty() {
            return closed_queue();
        }
        self.map.get_or_allocate(key).subscribe(subscriber_id, false)
    }

    fn release_sub_chan(&self, key: &str, subscriber_id: &str) {
        if let Some(barrel) = self.map.get(key) {
            barrel.unsubscribe(subscriber_id);
        }
    }

    async fn get_history_message(&self, key: &str, length: usize) -> Vec<String> {
        if let Some(barrel) = self.map.get(key) {
            return barrel.history(length).iter().map(|e| e.render()).collect();
        }
        match self.persister.get_messages(key, None, length).await {
            Ok(lines) => lines,
            Err(e) => {
                warn!(store = STORE, key = %key, error = %e, "History read failed");
                Vec::new()
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
            warn!(store = STORE, "Container store sweep already running");
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
                    self.persist_pending().await;
                }
                Some(op) = control_rx.recv() => {
                    self.apply(op).await;
                }
                _ = self.shutdown.cancelled() => {
                    let written = self.map.persist_all().await;
                    info!(store = STORE, written, "Container store sweep stopped");
                    return;
                }
            }
        }
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        self.map.persist_all().await;
    }
}
