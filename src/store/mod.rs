//! Message store engine
//!
//! Every store variant keeps one [`Barrel`] per stream key in a
//! [`BarrelMap`](engine::BarrelMap) and shares the same lifecycle contract
//! ([`MessageStore`]). The variants differ in keying, persistence policy and
//! idle window:
//!
//! | Store       | Key       | Persistence                         | Idle eviction |
//! |-------------|-----------|-------------------------------------|---------------|
//! | event       | EventID   | periodic (idle >= 60s) + on evict   | 30s           |
//! | read        | EventID   | none                                | 2m            |
//! | container   | ServiceID | every 60s + on evict                | 60s           |
//! | monitor     | ServiceID | none                                | 3m            |

pub mod barrel;
pub mod container;
pub mod control;
pub mod engine;
pub mod event;
pub mod monitor;
pub mod pool;
pub mod rate;
pub mod read;
pub mod spill;
pub mod telemetry;

pub use barrel::{Barrel, BarrelLimits, SubscriberQueue};
pub use container::{ContainerStore, ContainerStoreConfig};
pub use control::{ControlOp, ControlQueue};
pub use event::{EventStore, EventStoreConfig};
pub use monitor::{merge_samples, MonitorStore, MonitorStoreConfig};
pub use read::{ReadStore, ReadStoreConfig};
pub use spill::{GarbageSpill, SpillConfig, SpillFile};

use crate::persist::{EventStatusSink, MessagePersister};
use crate::message::MessageEnvelope;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Store variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Event,
    Read,
    Container,
    Monitor,
}

impl StoreKind {
    pub const ALL: [StoreKind; 4] = [
        StoreKind::Event,
        StoreKind::Read,
        StoreKind::Container,
        StoreKind::Monitor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Event => "event",
            StoreKind::Read => "read",
            StoreKind::Container => "container",
            StoreKind::Monitor => "monitor",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "event" => Ok(StoreKind::Event),
            "read" => Ok(StoreKind::Read),
            "container" | "docker" => Ok(StoreKind::Container),
            "monitor" => Ok(StoreKind::Monitor),
            other => Err(crate::Error::Config(format!("unknown store: {other}"))),
        }
    }
}

/// Load snapshot reported by a store and broadcast by the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorData {
    pub instance_id: String,
    /// Resident barrel count
    pub service_size: u64,
    /// Messages accepted in the last minute
    pub log_size_per_minute: u64,
}

impl MonitorData {
    /// Routing score: log volume plus a flat weight per resident stream.
    pub fn load_score(&self) -> u64 {
        self.log_size_per_minute + 20 * self.service_size
    }

    pub fn accumulate(&mut self, other: &MonitorData) {
        self.service_size += other.service_size;
        self.log_size_per_minute += other.log_size_per_minute;
    }
}

/// Lifecycle and data contract shared by every store variant.
#[async_trait]
pub trait MessageStore: Send + Sync {
    fn kind(&self) -> StoreKind;

    /// Accept one envelope. Never blocks on persistence or slow subscribers.
    fn insert_message(&self, envelope: MessageEnvelope);

    /// Open an outbound queue for `subscriber_id` on `key`, allocating the
    /// barrel if the key is not resident.
    fn sub_chan(&self, key: &str, subscriber_id: &str) -> SubscriberQueue;

    fn release_sub_chan(&self, key: &str, subscriber_id: &str);

    /// Newest `length` history lines for `key`, oldest first.
    async fn get_history_message(&self, key: &str, length: usize) -> Vec<String>;

    fn get_monitor_data(&self) -> MonitorData;

    /// Background sweep. Returns after `stop` with a final persistence pass.
    async fn run(&self);

    /// Cancel the sweep and write every pending envelope.
    async fn stop(&self);
}

/// Shared collaborators handed to every store constructor.
#[derive(Clone)]
pub struct StoreContext {
    pub instance_id: String,
    pub shutdown: CancellationToken,
    pub spill: Arc<GarbageSpill>,
}

impl StoreContext {
    pub fn new(instance_id: impl Into<String>, shutdown: CancellationToken) -> Self {
        Self {
            instance_id: instance_id.into(),
            shutdown,
            spill: Arc::new(GarbageSpill::in_memory()),
        }
    }

    pub fn with_spill(mut self, spill: Arc<GarbageSpill>) -> Self {
        self.spill = spill;
        self
    }
}

/// Per-variant configuration for a [`StoreSet`].
#[derive(Debug, Clone, Default)]
pub struct StoreSetConfig {
    pub event: EventStoreConfig,
    pub read: ReadStoreConfig,
    pub container: ContainerStoreConfig,
    pub monitor: MonitorStoreConfig,
}

/// The four stores of one node, wired together.
pub struct StoreSet {
    pub event: Arc<EventStore>,
    pub read: Arc<ReadStore>,
    pub container: Arc<ContainerStore>,
    pub monitor: Arc<MonitorStore>,
    context: StoreContext,
}

impl StoreSet {
    pub fn new(
        config: StoreSetConfig,
        context: StoreContext,
        event_persister: Arc<dyn MessagePersister>,
        container_persister: Arc<dyn MessagePersister>,
        status_sink: Arc<dyn EventStatusSink>,
    ) -> Self {
        let read = Arc::new(ReadStore::new(config.read, context.clone()));
        let event = Arc::new(
            EventStore::new(config.event, context.clone(), event_persister, status_sink)
                .with_read_store(read.clone()),
        );
        let container = Arc::new(ContainerStore::new(
            config.container,
            context.clone(),
            container_persister,
        ));
        let monitor = Arc::new(MonitorStore::new(config.monitor, context.clone()));
        Self {
            event,
            read,
            container,
            monitor,
            context,
        }
    }

    pub fn get(&self, kind: StoreKind) -> Arc<dyn MessageStore> {
        match kind {
            StoreKind::Event => self.event.clone(),
            StoreKind::Read => self.read.clone(),
            StoreKind::Container => self.container.clone(),
            StoreKind::Monitor => self.monitor.clone(),
        }
    }

    pub fn all(&self) -> Vec<Arc<dyn MessageStore>> {
        StoreKind::ALL.iter().map(|kind| self.get(*kind)).collect()
    }

    pub fn spill(&self) -> &Arc<GarbageSpill> {
        &self.context.spill
    }

    /// Node load: the event and container stores own the ingested streams;
    /// the read and monitor stores only mirror them for tailing.
    pub fn monitor_data(&self) -> MonitorData {
        let mut total = MonitorData {
            instance_id: self.context.instance_id.clone(),
            ..Default::default()
        };
        total.accumulate(&self.event.get_monitor_data());
        total.accumulate(&self.container.get_monitor_data());
        total
    }

    /// Spawn every store sweep plus the spill timer.
    pub fn spawn(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles: Vec<tokio::task::JoinHandle<()>> = self
            .all()
            .into_iter()
            .map(|store| tokio::spawn(async move { store.run().await }))
            .collect();
        let spill = self.context.spill.clone();
        let shutdown = self.context.shutdown.clone();
        handles.push(tokio::spawn(async move { spill.run(shutdown).await }));
        handles
    }

    /// Stop every store, then flush the garbage buffer.
    pub async fn stop(&self) {
        for store in self.all() {
            store.stop().await;
            info!(store = %store.kind(), "Store stopped");
        }
        if let Err(e) = self.context.spill.flush().await {
            warn!(error = %e, "Spill flush on stop failed");
        }
        for persister in [self.event.persister(), self.container.persister()] {
            if let Err(e) = persister.close().await {
                warn!(error = %e, "Persister close failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_score() {
        let a = MonitorData {
            instance_id: "a".into(),
            service_size: 2,
            log_size_per_minute: 100,
        };
        assert_eq!(a.load_score(), 140);
    }

    #[test]
    fn test_store_kind_parse() {
        assert_eq!("docker".parse::<StoreKind>().unwrap(), StoreKind::Container);
        assert_eq!(" Event ".parse::<StoreKind>().unwrap(), StoreKind::Event);
        assert!("bogus".parse::<StoreKind>().is_err());
    }
}
