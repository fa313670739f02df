//! Monitor-sample store
//!
//! Keyed by ServiceID. The live window holds the latest sample per reporting
//! host: a host's new sample replaces its previous one. Every insert merges
//! the window across hosts and pushes the merged snapshot to subscribers.
//! Samples are transient and never persisted.

use super::barrel::{closed_queue, BarrelLimits, SubscriberQueue};
use super::engine::BarrelMap;
use super::{telemetry, MessageStore, MonitorData, StoreContext, StoreKind};
use crate::message::{MessageEnvelope, MonitorEntry, MonitorSample};
use async_trait::async_trait;
use bytes::Bytes;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const STORE: &str = "monitor";

#[derive(Debug, Clone)]
pub struct MonitorStoreConfig {
    /// Reporting hosts tracked per service
    pub max_hosts: usize,
    /// Entries kept in a merged snapshot, by cumulative time
    pub top_n: usize,
    /// Outbound queue capacity per subscriber
    pub subscriber_queue: usize,
    /// Idle window before a service without subscribers is evicted
    pub idle_timeout: Duration,
    /// GC sweep interval
    pub gc_interval: Duration,
    /// Recycled barrels kept for reuse
    pub pool_size: usize,
}

impl Default for MonitorStoreConfig {
    fn default() -> Self {
        Self {
            max_hosts: 64,
            top_n: 20,
            subscriber_queue: 16,
            idle_timeout: Duration::from_secs(180),
            gc_interval: Duration::from_secs(30),
            pool_size: 64,
        }
    }
}

/// Merge samples from several hosts into one list keyed by entry key.
///
/// Counts and cumulative times are summed, average latency is weighted by
/// count and max latency is the max across hosts. The result is sorted by
/// cumulative time, largest first, and cut to `top_n`.
pub fn merge_samples<'a, I>(samples: I, top_n: usize) -> Vec<MonitorEntry>
where
    I: IntoIterator<Item = &'a MonitorSample>,
{
    let mut merged: Vec<MonitorEntry> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for sample in samples {
        for entry in &sample.entries {
            match index.get(&entry.key) {
                Some(&idx) => merge_entry(&mut merged[idx], entry),
                None => {
                    index.insert(entry.key.clone(), merged.len());
                    merged.push(entry.clone());
                }
            }
        }
    }

    merged.sort_by(|a, b| {
        b.cumulative_time
            .partial_cmp(&a.cumulative_time)
            .unwrap_or(Ordering::Equal)
    });
    merged.truncate(top_n);
    merged
}

fn merge_entry(into: &mut MonitorEntry, other: &MonitorEntry) {
    let total = into.count + other.count;
    into.average_time = if total == 0 {
        (into.average_time + other.average_time) / 2.0
    } else {
        (into.average_time * into.count as f64 + other.average_time * other.count as f64)
            / total as f64
    };
    into.count = total;
    into.abnormal_count += other.abnormal_count;
    into.max_time = into.max_time.max(other.max_time);
    into.cumulative_time += other.cumulative_time;
}

fn snapshot_envelope(key: &str, entries: Vec<MonitorEntry>) -> MessageEnvelope {
    let content = serde_json::to_vec(&entries).map(Bytes::from).unwrap_or_default();
    MessageEnvelope {
        stream_key: key.to_string(),
        time: chrono::Utc::now().to_rfc3339(),
        content,
        monitor: Some(MonitorSample { entries }),
        ..Default::default()
    }
}

pub struct MonitorStore {
    config: MonitorStoreConfig,
    map: BarrelMap,
    instance_id: String,
    shutdown: CancellationToken,
}

impl MonitorStore {
    pub fn new(config: MonitorStoreConfig, context: StoreContext) -> Self {
        let limits = BarrelLimits {
            cache_count: config.max_hosts,
            subscriber_queue: config.subscriber_queue,
        };
        Self {
            map: BarrelMap::new(STORE, limits, config.pool_size, None, context.spill.clone()),
            instance_id: context.instance_id,
            shutdown: context.shutdown.child_token(),
            config,
        }
    }

    /// Current merged view for `key`.
    pub fn snapshot(&self, key: &str) -> Vec<MonitorEntry> {
        match self.map.get(key) {
            Some(barrel) => {
                let window = barrel.history(0);
                merge_samples(
                    window.iter().filter_map(|e| e.monitor.as_ref()),
                    self.config.top_n,
                )
            }
            None => Vec::new(),
        }
    }

    pub async fn sweep_at(&self, now: Instant) -> Vec<String> {
        self.map.sweep(now, self.config.idle_timeout).await
    }
}

#[async_trait]
impl MessageStore for MonitorStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Monitor
    }

    fn insert_message(&self, envelope: MessageEnvelope) {
        if !envelope.has_stream_key() || envelope.monitor.is_none() {
            telemetry::record_malformed(STORE);
            warn!(store = STORE, key = %envelope.stream_key, "Dropping envelope without monitor sample");
            return;
        }
        let key = envelope.stream_key.clone();
        let host = envelope.host_name.clone();
        let top_n = self.config.top_n;

        let barrel = self.map.get_or_allocate(&key);
        let delivery = barrel.upsert(
            Arc::new(envelope),
            |existing| existing.host_name == host,
            |window| {
                let merged = merge_samples(window.iter().filter_map(|e| e.monitor.as_ref()), top_n);
                Some(Arc::new(snapshot_envelope(&key, merged)))
            },
        );
        self.map.record_lines(1);
        telemetry::record_insert(STORE);
        telemetry::record_subscriber_drops(STORE, delivery.dropped as u64);
    }

    fn sub_chan(&self, key: &str, subscriber_id: &str) -> SubscriberQueue {
        if key.trim().is_empty() {
            return closed_queue();
        }
        let barrel = self.map.get_or_allocate(key);
        let queue = barrel.subscribe(subscriber_id, false);
        let current = self.snapshot(key);
        if !current.is_empty() {
            barrel.publish_to(subscriber_id, Arc::new(snapshot_envelope(key, current)));
        }
        queue
    }

    fn release_sub_chan(&self, key: &str, subscriber_id: &str) {
        if let Some(barrel) = self.map.get(key) {
            barrel.unsubscribe(subscriber_id);
        }
    }

    /// One JSON line per merged entry.
    async fn get_history_message(&self, key: &str, length: usize) -> Vec<String> {
        let entries = self.snapshot(key);
        let lines: Vec<String> = entries
            .iter()
            .filter_map(|entry| serde_json::to_string(entry).ok())
            .collect();
        crate::persist::tail(lines, length)
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
                    info!(store = STORE, "Monitor store sweep stopped");
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

    fn entry(key: &str, count: u64, avg: f64, max: f64, cumulative: f64) -> MonitorEntry {
        MonitorEntry {
            key: key.to_string(),
            count,
            abnormal_count: 0,
            average_time: avg,
            max_time: max,
            cumulative_time: cumulative,
        }
    }

    fn store() -> MonitorStore {
        MonitorStore::new(
            MonitorStoreConfig::default(),
            StoreContext::new("node-1", CancellationToken::new()),
        )
    }

    #[test]
    fn test_merge_weights_average_by_count() {
        let a = MonitorSample {
            entries: vec![entry("/api", 1, 10.0, 10.0, 10.0)],
        };
        let b = MonitorSample {
            entries: vec![entry("/api", 3, 30.0, 50.0, 90.0)],
        };
        let merged = merge_samples([&a, &b], 20);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].count, 4);
        assert_eq!(merged[0].average_time, 25.0);
        assert_eq!(merged[0].max_time, 50.0);
        assert_eq!(merged[0].cumulative_time, 100.0);
    }

    #[test]
    fn test_merge_keeps_top_n_by_cumulative_time() {
        let sample = MonitorSample {
            entries: vec![
                entry("/slow", 1, 1.0, 1.0, 500.0),
                entry("/fast", 1, 1.0, 1.0, 5.0),
                entry("/mid", 1, 1.0, 1.0, 50.0),
            ],
        };
        let merged = merge_samples([&sample], 2);
        let keys: Vec<_> = merged.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["/slow", "/mid"]);
    }

    #[tokio::test]
    async fn test_cross_host_merge_pushed_to_subscribers() {
        let store = store();
        let mut rx = store.sub_chan("svc-1", "dash");
        store.insert_message(MessageEnvelope::monitor_sample(
            "svc-1",
            "host-a",
            vec![entry("/api", 2, 5.0, 8.0, 10.0)],
        ));
        store.insert_message(MessageEnvelope::monitor_sample(
            "svc-1",
            "host-b",
            vec![entry("/api", 2, 15.0, 20.0, 30.0)],
        ));

        let _first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let entries = &second.monitor.as_ref().unwrap().entries;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].count, 4);
        assert_eq!(entries[0].average_time, 10.0);
        let decoded: Vec<MonitorEntry> = serde_json::from_slice(&second.content).unwrap();
        assert_eq!(&decoded, entries);
    }

    #[test]
    fn test_sample_without_payload_is_dropped() {
        let store = store();
        store.insert_message(MessageEnvelope::new("svc-1", "not a sample"));
        assert!(store.snapshot("svc-1").is_empty());
        assert_eq!(store.get_monitor_data().service_size, 0);
    }

    #[tokio::test]
    async fn test_idle_after_three_minutes() {
        let store = store();
        store.insert_message(MessageEnvelope::monitor_sample(
            "svc-1",
            "host-a",
            vec![entry("/api", 1, 1.0, 1.0, 1.0)],
        ));
        assert!(store
            .sweep_at(Instant::now() + Duration::from_secs(121))
            .await
            .is_empty());
        assert_eq!(
            store.sweep_at(Instant::now() + Duration::from_secs(181)).await.len(),
            1
        );
    }
}
