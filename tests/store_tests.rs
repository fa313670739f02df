//! Integration tests for the message store engine
//!
//! Bounded windows, eviction with persistence, subscriber isolation,
//! history ordering, monitor merging and the failure spill.

use async_trait::async_trait;
use logbarrel::message::{MessageEnvelope, MonitorEntry};
use logbarrel::persist::{FilePersister, MemoryStatusSink, MessagePersister};
use logbarrel::store::{
    ContainerStore, ContainerStoreConfig, EventStore, EventStoreConfig, GarbageSpill,
    MessageStore, MonitorStore, MonitorStoreConfig, ReadStore, ReadStoreConfig, SpillConfig,
    StoreContext,
};
use logbarrel::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Records every save call; can be switched to fail.
#[derive(Default)]
struct RecordingPersister {
    calls: Mutex<Vec<Vec<String>>>,
    failing: AtomicBool,
}

impl RecordingPersister {
    fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl MessagePersister for RecordingPersister {
    async fn save_message(&self, envelopes: &[Arc<MessageEnvelope>]) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Persistence("disk full".to_string()));
        }
        self.calls
            .lock()
            .push(envelopes.iter().map(|e| e.message.clone()).collect());
        Ok(())
    }

    async fn get_messages(
        &self,
        _key: &str,
        _level: Option<logbarrel::message::Level>,
        _length: usize,
    ) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn context() -> StoreContext {
    StoreContext::new("node-1", CancellationToken::new())
}

fn container_store(
    config: ContainerStoreConfig,
    context: StoreContext,
) -> (ContainerStore, Arc<RecordingPersister>) {
    let persister = Arc::new(RecordingPersister::default());
    (
        ContainerStore::new(config, context, persister.clone()),
        persister,
    )
}

#[tokio::test]
async fn test_live_window_keeps_newest() {
    let store = ReadStore::new(
        ReadStoreConfig {
            cache_count: 4,
            ..Default::default()
        },
        context(),
    );
    for i in 0..9 {
        store.insert_message(MessageEnvelope::new("evt-1", format!("line {i}")));
    }

    let history = store.get_history_message("evt-1", 100).await;
    assert_eq!(history.len(), 4);
    for (line, expected) in history.iter().zip(5..9) {
        assert!(line.ends_with(&format!("line {expected}")), "{line}");
    }
}

#[tokio::test]
async fn test_idle_eviction_persists_exactly_once() {
    let (store, persister) = container_store(ContainerStoreConfig::default(), context());
    for i in 0..3 {
        store.insert_message(MessageEnvelope::new("svc-1", format!("line {i}")));
    }

    // Not idle yet
    assert!(store.sweep_at(Instant::now()).await.is_empty());
    assert!(persister.calls().is_empty());

    let later = Instant::now() + Duration::from_secs(61);
    assert_eq!(store.sweep_at(later).await, vec!["svc-1".to_string()]);
    assert!(!store.resident("svc-1"));
    assert_eq!(
        persister.calls(),
        vec![vec![
            "line 0".to_string(),
            "line 1".to_string(),
            "line 2".to_string()
        ]]
    );

    store.sweep_at(later + Duration::from_secs(61)).await;
    assert_eq!(persister.calls().len(), 1);
}

#[tokio::test]
async fn test_subscribed_barrel_survives_idle_sweep() {
    let (store, persister) = container_store(ContainerStoreConfig::default(), context());
    store.insert_message(MessageEnvelope::new("svc-1", "hello"));
    let _tail = store.sub_chan("svc-1", "dash");

    let later = Instant::now() + Duration::from_secs(120);
    assert!(store.sweep_at(later).await.is_empty());
    assert!(store.resident("svc-1"));
    assert!(persister.calls().is_empty());

    store.release_sub_chan("svc-1", "dash");
    assert_eq!(store.sweep_at(later).await, vec!["svc-1".to_string()]);
    assert_eq!(persister.calls().len(), 1);
}

#[tokio::test]
async fn test_full_subscriber_does_not_block_others() {
    let (store, _) = container_store(
        ContainerStoreConfig {
            subscriber_queue: 1,
            ..Default::default()
        },
        context(),
    );
    let mut slow = store.sub_chan("svc-1", "slow");
    let mut fast = store.sub_chan("svc-1", "fast");

    store.insert_message(MessageEnvelope::new("svc-1", "first"));
    assert_eq!(fast.recv().await.unwrap().message, "first");

    // `slow` still holds "first", so its queue is full
    store.insert_message(MessageEnvelope::new("svc-1", "second"));
    assert_eq!(fast.recv().await.unwrap().message, "second");

    assert_eq!(slow.recv().await.unwrap().message, "first");
    assert!(slow.try_recv().is_err());
}

#[tokio::test]
async fn test_history_round_trip_in_order() {
    let dir = TempDir::new().unwrap();
    let store = EventStore::new(
        EventStoreConfig::default(),
        context(),
        Arc::new(FilePersister::open(dir.path()).unwrap()),
        Arc::new(MemoryStatusSink::new()),
    );
    for i in 0..10 {
        store.insert_message(MessageEnvelope::new("evt-1", format!("step {i}")));
    }

    let history = store.get_history_message("evt-1", 10).await;
    assert_eq!(history.len(), 10);
    for (i, line) in history.iter().enumerate() {
        assert!(line.ends_with(&format!("step {i}")), "{line}");
    }
}

#[tokio::test]
async fn test_event_history_beyond_default_window() {
    let store = EventStore::new(
        EventStoreConfig::default(),
        context(),
        Arc::new(RecordingPersister::default()),
        Arc::new(MemoryStatusSink::new()),
    );
    for i in 0..600 {
        store.insert_message(MessageEnvelope::new("evt-1", format!("step {i}")));
    }

    let history = store.get_history_message("evt-1", 600).await;
    assert_eq!(history.len(), 600);
    assert!(history[0].ends_with("step 0"), "{}", history[0]);
    assert!(history[599].ends_with("step 599"), "{}", history[599]);
}

#[tokio::test]
async fn test_event_idle_eviction_persists_exactly_once() {
    let persister = Arc::new(RecordingPersister::default());
    let store = EventStore::new(
        EventStoreConfig::default(),
        context(),
        persister.clone(),
        Arc::new(MemoryStatusSink::new()),
    );
    store.insert_message(MessageEnvelope::new("evt-1", "compile"));
    store.insert_message(MessageEnvelope::new("evt-1", "link"));

    assert!(store.sweep_at(Instant::now()).await.is_empty());
    let later = Instant::now() + Duration::from_secs(31);
    assert_eq!(store.sweep_at(later).await, vec!["evt-1".to_string()]);
    assert!(!store.resident("evt-1"));
    assert_eq!(
        persister.calls(),
        vec![vec!["compile".to_string(), "link".to_string()]]
    );

    store.sweep_at(later + Duration::from_secs(31)).await;
    store.stop().await;
    assert_eq!(persister.calls().len(), 1);
}

#[tokio::test]
async fn test_monitor_same_host_sample_is_replaced() {
    let store = MonitorStore::new(MonitorStoreConfig::default(), context());
    let entries = vec![
        MonitorEntry {
            key: "/api/orders".to_string(),
            count: 10,
            abnormal_count: 1,
            average_time: 12.0,
            max_time: 40.0,
            cumulative_time: 120.0,
        },
        MonitorEntry {
            key: "/api/users".to_string(),
            count: 4,
            abnormal_count: 0,
            average_time: 5.0,
            max_time: 9.0,
            cumulative_time: 20.0,
        },
    ];

    let sample = MessageEnvelope::monitor_sample("svc-1", "host-a", entries.clone());
    store.insert_message(sample.clone());
    store.insert_message(sample);

    let snapshot = store.snapshot("svc-1");
    assert_eq!(snapshot, entries);
}

#[tokio::test]
async fn test_monitor_cross_host_samples_aggregate() {
    let store = MonitorStore::new(MonitorStoreConfig::default(), context());
    let entry = |count, average_time: f64, max_time| MonitorEntry {
        key: "/api/orders".to_string(),
        count,
        abnormal_count: 1,
        average_time,
        max_time,
        cumulative_time: count as f64 * average_time,
    };
    store.insert_message(MessageEnvelope::monitor_sample(
        "svc-1",
        "host-a",
        vec![entry(10, 10.0, 30.0)],
    ));
    store.insert_message(MessageEnvelope::monitor_sample(
        "svc-1",
        "host-b",
        vec![entry(30, 20.0, 50.0)],
    ));

    let snapshot = store.snapshot("svc-1");
    assert_eq!(snapshot.len(), 1);
    let merged = &snapshot[0];
    assert_eq!(merged.count, 40);
    assert_eq!(merged.abnormal_count, 2);
    assert_eq!(merged.max_time, 50.0);
    assert!((merged.average_time - 17.5).abs() < 1e-9);
    assert!((merged.cumulative_time - 700.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_malformed_envelope_never_allocates() {
    let (store, _) = container_store(ContainerStoreConfig::default(), context());
    store.insert_message(MessageEnvelope::new("", "orphan"));
    store.insert_message(MessageEnvelope::new("   ", "orphan"));
    assert_eq!(store.get_monitor_data().service_size, 0);
}

#[tokio::test]
async fn test_failed_persistence_spills_to_file() {
    let dir = TempDir::new().unwrap();
    let spill = Arc::new(GarbageSpill::new(SpillConfig {
        path: Some(dir.path().join("spill.log")),
        ..Default::default()
    }));
    let (store, persister) = container_store(
        ContainerStoreConfig::default(),
        context().with_spill(spill.clone()),
    );
    persister.failing.store(true, Ordering::SeqCst);

    store.insert_message(MessageEnvelope::new("svc-1", "a"));
    store.insert_message(MessageEnvelope::new("svc-1", "b"));
    let later = Instant::now() + Duration::from_secs(61);
    assert_eq!(store.sweep_at(later).await, vec!["svc-1".to_string()]);
    assert_eq!(spill.len(), 2);

    assert_eq!(spill.flush().await.unwrap(), 2);
    assert!(spill.is_empty());
    let recovered = spill.file().unwrap().read_all().unwrap();
    let messages: Vec<_> = recovered.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, vec!["a", "b"]);
}

#[tokio::test]
async fn test_stop_persists_everything() {
    let (store, persister) = container_store(ContainerStoreConfig::default(), context());
    store.insert_message(MessageEnvelope::new("svc-1", "a"));
    store.insert_message(MessageEnvelope::new("svc-2", "b"));

    store.stop().await;
    let mut saved: Vec<String> = persister.calls().into_iter().flatten().collect();
    saved.sort();
    assert_eq!(saved, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn test_evicted_barrel_starts_clean_when_key_returns() {
    let (store, _) = container_store(ContainerStoreConfig::default(), context());
    store.insert_message(MessageEnvelope::new("svc-1", "old"));
    store
        .sweep_at(Instant::now() + Duration::from_secs(61))
        .await;

    // The recycled barrel must not leak the previous contents
    store.insert_message(MessageEnvelope::new("svc-2", "new"));
    let history = store.get_history_message("svc-2", 0).await;
    assert_eq!(history.len(), 1);
    assert!(history[0].ends_with("new"));
}
