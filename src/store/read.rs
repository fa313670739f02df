//! Read store: short-lived fan-out buffer for live dashboard tails.
//!
//! Nothing here is persisted. The event store forwards every accepted
//! envelope into this store; a new subscriber first receives the current
//! live window.

use super::barrel::{closed_queue, BarrelLimits, SubscriberQueue};
use super::engine::BarrelMap;
use super::{telemetry, MessageStore, MonitorData, StoreContext, StoreKind};
use crate::message::MessageEnvelope;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STORE: &str = "read";

#[derive(Debug, Clone)]
pub struct ReadStoreConfig {
    /// Live window per key
    pub cache_count: usize,
    /// Outbound queue capacity per subscriber
    pub subscriber_queue: usize,
    /// Idle window before a key without subscribers is evicted
    pub idle_timeout: Duration,
    /// GC sweep interval
    pub gc_interval: Duration,
    /// Recycled barrels kept for reuse
    pub pool_size: usize,
}

impl Default for ReadStoreConfig {
    fn default() -> Self {
        Self {
            cache_count: 256,
            subscriber_queue: 64,
            idle_timeout: Duration::from_secs(120),
            gc_interval: Duration::from_secs(30),
            pool_size: 128,
        }
    }
}

pub struct ReadStore {
    config: ReadStoreConfig,
    map: BarrelMap,
    instance_id: String,
    shutdown: CancellationToken,
}

impl ReadStore {
    pub fn new(config: ReadStoreConfig, context: StoreContext) -> Self {
        let limits = BarrelLimits {
            cache_count: config.cache_count,
            subscriber_queue: config.subscriber_queue,
        };
        Self {
            map: BarrelMap::new(STORE, limits, config.pool_size, None, context.spill.clone()),
            instance_id: context.instance_id,
            shutdown: context.shutdown.child_token(),
            config,
        }
    }

    /// Insert an envelope already shared with another store.
    pub fn insert_shared(&self, envelope: Arc<MessageEnvelope>) {
        if !envelope.has_stream_key() {
            telemetry::record_malformed(STORE);
            warn!(store = STORE, "Dropping envelope without stream key");
            return;
        }
        let barrel = self.map.get_or_allocate(&envelope.stream_key);
        let outcome = barrel.insert(envelope, false);
        self.map.record_lines(1);
        telemetry::record_insert(STORE);
        telemetry::record_subscriber_drops(STORE, outcome.delivery.dropped as u64);
    }

    pub fn resident(&self, key: &str) -> bool {
        self.map.contains(key)
    }

    /// One GC pass as of `now`.
    pub async fn sweep_at(&self, now: Instant) -> Vec<String> {
        self.map.sweep(now, self.config.idle_timeout).await
    }
}

#[async_trait]
impl MessageStore for ReadStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Read
    }

    fn insert_message(&self, envelope: MessageEnvelope) {
        self.insert_shared(Arc::new(envelope));
    }

    fn sub_chan(&self, key: &str, subscriber_id: &str) -> SubscriberQueue {
        if key.trim().is_empty() {
            return closed_queue();
        }
        debug!(store = STORE, key = %key, subscriber = %subscriber_id, "Subscriber attached");
        self.map.get_or_allocate(key).subscribe(subscriber_id, true)
    }

    fn release_sub_chan(&self, key: &str, subscriber_id: &str) {
        if let Some(barrel) = self.map.get(key) {
            barrel.unsubscribe(subscriber_id);
        }
    }

    async fn get_history_message(&self, key: &str, length: usize) -> Vec<String> {
        self.map
            .get(key)
            .map(|barrel| barrel.history(length).iter().map(|e| e.render()).collect())
            .unwrap_or_default()
    }

    fn get_monitor_data(&self) -> MonitorData {
        MonitorData {
            instance_id: self.instance_id.clone(),
            service_size: self.map.len() as u64,
            log_size_per_minute: self.map.lines_per_minute(),
        }
    }

    async fn run(&self) {
        let mut gc = tokio::time::interval(self.config.gc_interval);
        gc.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = gc.tick() => {
                    self.sweep_at(Instant::now()).await;
                }
                _ = self.shutdown.cancelled() => {
                    info!(store = STORE, "Read store sweep stopped");
                    return;
                }
            }
        }
    }

    async fn stop(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ReadStore {
        ReadStore::new(
            ReadStoreConfig::default(),
            StoreContext::new("node-1", CancellationToken::new()),
        )
    }

    #[tokio::test]
    async fn test_subscriber_gets_replay_then_live() {
        let store = store();
        store.insert_message(MessageEnvelope::new("evt-1", "queued"));
        let mut rx = store.sub_chan("evt-1", "dash");
        store.insert_message(MessageEnvelope::new("evt-1", "running"));

        assert_eq!(rx.recv().await.unwrap().message, "queued");
        assert_eq!(rx.recv().await.unwrap().message, "running");
    }

    #[tokio::test]
    async fn test_idle_eviction_after_two_minutes() {
        let store = store();
        store.insert_message(MessageEnvelope::new("evt-1", "a"));

        assert!(store
            .sweep_at(Instant::now() + Duration::from_secs(60))
            .await
            .is_empty());
        let evicted = store.sweep_at(Instant::now() + Duration::from_secs(121)).await;
        assert_eq!(evicted, vec!["evt-1".to_string()]);
        assert!(store.get_history_message("evt-1", 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_released_subscriber_allows_eviction() {
        let store = store();
        let _rx = store.sub_chan("evt-1", "dash");
        let later = Instant::now() + Duration::from_secs(300);
        assert!(store.sweep_at(later).await.is_empty());

        store.release_sub_chan("evt-1", "dash");
        assert_eq!(store.sweep_at(later).await.len(), 1);
    }

    #[test]
    fn test_blank_key_is_dropped() {
        let store = store();
        store.insert_message(MessageEnvelope::new("", "orphan"));
        assert_eq!(store.get_monitor_data().service_size, 0);
    }
}
