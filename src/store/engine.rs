//! Keyed barrel map shared by every store variant.
//!
//! Inserts look the key up under the read lock and only take the write lock
//! to allocate. Two concurrent first inserts for the same key may both
//! allocate; the later map insert wins and the displaced barrel is handed to
//! the next sweep, which persists and recycles it like any evicted barrel.

use super::barrel::{Barrel, BarrelLimits, PersistOutcome};
use super::pool::BarrelPool;
use super::rate::RollingCounter;
use super::spill::GarbageSpill;
use super::telemetry;
use crate::persist::MessagePersister;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

pub struct BarrelMap {
    store: &'static str,
    barrels: RwLock<HashMap<String, Arc<Barrel>>>,
    displaced: Mutex<Vec<Arc<Barrel>>>,
    pool: BarrelPool,
    persister: Option<Arc<dyn MessagePersister>>,
    spill: Arc<GarbageSpill>,
    rate: Mutex<RollingCounter>,
}

impl BarrelMap {
    pub fn new(
        store: &'static str,
        limits: BarrelLimits,
        pool_size: usize,
        persister: Option<Arc<dyn MessagePersister>>,
        spill: Arc<GarbageSpill>,
    ) -> Self {
        Self {
            store,
            barrels: RwLock::new(HashMap::new()),
            displaced: Mutex::new(Vec::new()),
            pool: BarrelPool::new(limits, pool_size),
            persister,
            spill,
            rate: Mutex::new(RollingCounter::per_minute()),
        }
    }

    pub fn persister(&self) -> Option<&Arc<dyn MessagePersister>> {
        self.persister.as_ref()
    }

    pub fn pool(&self) -> &BarrelPool {
        &self.pool
    }

    pub fn get(&self, key: &str) -> Option<Arc<Barrel>> {
        self.barrels.read().get(key).cloned()
    }

    pub fn get_or_allocate(&self, key: &str) -> Arc<Barrel> {
        if let Some(barrel) = self.barrels.read().get(key) {
            return barrel.clone();
        }
        self.allocate(key)
    }

    /// Allocate after a lookup miss. A barrel inserted for `key` since the
    /// miss is displaced, not merged.
    fn allocate(&self, key: &str) -> Arc<Barrel> {
        let barrel = Arc::new(self.pool.acquire(key));
        telemetry::record_barrel_allocated(self.store);
        let displaced = self.barrels.write().insert(key.to_string(), barrel.clone());
        if let Some(old) = displaced {
            debug!(store = self.store, key = %key, "Concurrent allocation displaced a barrel");
            self.displaced.lock().push(old);
        }
        barrel
    }

    pub fn len(&self) -> usize {
        self.barrels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.barrels.read().is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.barrels.read().contains_key(key)
    }

    pub fn snapshot(&self) -> Vec<Arc<Barrel>> {
        self.barrels.read().values().cloned().collect()
    }

    pub fn record_lines(&self, n: u64) {
        self.rate.lock().add(n);
    }

    pub fn lines_per_minute(&self) -> u64 {
        self.rate.lock().total()
    }

    /// Write one barrel's persistence sub-buffer. Failed batches go to the
    /// garbage buffer. Returns the number of envelopes written.
    pub async fn persist_barrel(&self, barrel: &Barrel) -> usize {
        let Some(persister) = &self.persister else {
            return 0;
        };
        let start = Instant::now();
        match barrel.persist(persister.as_ref()).await {
            PersistOutcome::Empty => 0,
            PersistOutcome::Saved(n) => {
                telemetry::record_persist(
                    self.store,
                    "success",
                    start.elapsed().as_secs_f64(),
                    n as u64,
                );
                debug!(store = self.store, key = %barrel.key(), rows = n, "Persisted barrel");
                n
            }
            PersistOutcome::Failed(batch, e) => {
                telemetry::record_persist(
                    self.store,
                    "error",
                    start.elapsed().as_secs_f64(),
                    batch.len() as u64,
                );
                error!(
                    store = self.store,
                    key = %barrel.key(),
                    rows = batch.len(),
                    error = %e,
                    "Persistence failed, moving envelopes to garbage buffer"
                );
                self.spill.push(batch);
                0
            }
        }
    }

    pub async fn persist_key(&self, key: &str) -> usize {
        match self.get(key) {
            Some(barrel) => self.persist_barrel(&barrel).await,
            None => 0,
        }
    }

    /// Persist every barrel selected by `pred`, scanning under the read lock
    /// and writing after it is released.
    pub async fn persist_where<F>(&self, pred: F) -> usize
    where
        F: Fn(&Barrel) -> bool,
    {
        let selected: Vec<Arc<Barrel>> = self
            .barrels
            .read()
            .values()
            .filter(|barrel| barrel.needs_persistence() && pred(barrel))
            .cloned()
            .collect();
        let mut written = 0;
        for barrel in selected {
            written += self.persist_barrel(&barrel).await;
        }
        written
    }

    /// Persist everything, including displaced barrels.
    pub async fn persist_all(&self) -> usize {
        let displaced: Vec<Arc<Barrel>> = self.displaced.lock().clone();
        let mut written = 0;
        for barrel in displaced {
            written += self.persist_barrel(&barrel).await;
        }
        written + self.persist_where(|_| true).await
    }

    /// Evict barrels with no subscribers and no update within `idle` as of
    /// `now`. Each barrel's persistence sub-buffer is written before it is
    /// removed. Returns the evicted keys.
    pub async fn sweep(&self, now: Instant, idle: Duration) -> Vec<String> {
        self.collect_displaced().await;

        let candidates: Vec<(String, Arc<Barrel>, Instant)> = self
            .barrels
            .read()
            .iter()
            .filter(|(_, barrel)| barrel.is_idle(now, idle))
            .map(|(key, barrel)| (key.clone(), barrel.clone(), barrel.last_update()))
            .collect();

        let mut evicted = Vec::new();
        for (key, barrel, seen) in candidates {
            self.persist_barrel(&barrel).await;

            let removed = {
                let mut map = self.barrels.write();
                let unchanged = map
                    .get(&key)
                    .map(|current| Arc::ptr_eq(current, &barrel))
                    .unwrap_or(false)
                    && barrel.last_update() == seen
                    && barrel.subscriber_count() == 0
                    && !barrel.needs_persistence();
                if unchanged {
                    map.remove(&key)
                } else {
                    None
                }
            };

            if let Some(removed) = removed {
                drop(barrel);
                telemetry::record_barrel_evicted(self.store);
                self.recycle(removed);
                evicted.push(key);
            }
        }

        if !evicted.is_empty() {
            info!(store = self.store, evicted = evicted.len(), "Evicted idle barrels");
        }
        evicted
    }

    async fn collect_displaced(&self) {
        let displaced = std::mem::take(&mut *self.displaced.lock());
        for barrel in displaced {
            self.persist_barrel(&barrel).await;
            self.recycle(barrel);
        }
    }

    /// Return a removed barrel to the pool. A barrel still referenced by an
    /// in-flight caller is kept for the next sweep instead.
    fn recycle(&self, barrel: Arc<Barrel>) {
        match Arc::try_unwrap(barrel) {
            Ok(barrel) => self.pool.release(barrel),
            Err(shared) => self.displaced.lock().push(shared),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageEnvelope;
    use crate::persist::MessagePersister;
    use crate::{Error, Result};
    use async_trait::async_trait;
    use crate::message::Level;

    #[derive(Default)]
    struct Recording {
        saved: Mutex<Vec<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl MessagePersister for Recording {
        async fn save_message(&self, envelopes: &[Arc<MessageEnvelope>]) -> Result<()> {
            if self.fail {
                return Err(Error::Persistence("disk full".to_string()));
            }
            self.saved
                .lock()
                .push(envelopes.iter().map(|e| e.message.clone()).collect());
            Ok(())
        }

        async fn get_messages(&self, _: &str, _: Option<Level>, _: usize) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn map_with(persister: Arc<Recording>, spill: Arc<GarbageSpill>) -> BarrelMap {
        BarrelMap::new(
            "test",
            BarrelLimits::default(),
            4,
            Some(persister as Arc<dyn MessagePersister>),
            spill,
        )
    }

    #[tokio::test]
    async fn test_sweep_persists_before_removal() {
        let persister = Arc::new(Recording::default());
        let map = map_with(persister.clone(), Arc::new(GarbageSpill::in_memory()));
        let barrel = map.get_or_allocate("evt");
        barrel.insert(Arc::new(MessageEnvelope::new("evt", "a")), true);
        barrel.insert(Arc::new(MessageEnvelope::new("evt", "b")), true);
        drop(barrel);

        let evicted = map
            .sweep(Instant::now() + Duration::from_secs(31), Duration::from_secs(30))
            .await;
        assert_eq!(evicted, vec!["evt".to_string()]);
        assert!(!map.contains("evt"));
        assert_eq!(persister.saved.lock().clone(), vec![vec!["a", "b"]]);
        assert_eq!(map.pool().idle(), 1);
    }

    #[tokio::test]
    async fn test_subscribed_barrel_survives_sweep() {
        let persister = Arc::new(Recording::default());
        let map = map_with(persister, Arc::new(GarbageSpill::in_memory()));
        let barrel = map.get_or_allocate("evt");
        let _rx = barrel.subscribe("tail", false);
        drop(barrel);

        let evicted = map
            .sweep(Instant::now() + Duration::from_secs(600), Duration::from_secs(30))
            .await;
        assert!(evicted.is_empty());
        assert!(map.contains("evt"));
    }

    #[tokio::test]
    async fn test_failed_persist_goes_to_spill() {
        let persister = Arc::new(Recording {
            fail: true,
            ..Default::default()
        });
        let spill = Arc::new(GarbageSpill::in_memory());
        let map = map_with(persister, spill.clone());
        let barrel = map.get_or_allocate("evt");
        barrel.insert(Arc::new(MessageEnvelope::new("evt", "a")), true);

        assert_eq!(map.persist_key("evt").await, 0);
        assert_eq!(spill.len(), 1);
        assert!(!barrel.needs_persistence());
    }

    #[tokio::test]
    async fn test_in_flight_barrel_is_recycled_later() {
        let persister = Arc::new(Recording::default());
        let map = map_with(persister, Arc::new(GarbageSpill::in_memory()));
        let held = map.get_or_allocate("evt");

        let evicted = map
            .sweep(Instant::now() + Duration::from_secs(31), Duration::from_secs(30))
            .await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(map.pool().idle(), 0);

        drop(held);
        map.sweep(Instant::now(), Duration::from_secs(30)).await;
        assert_eq!(map.pool().idle(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_insert_keeps_last_allocation() {
        let persister = Arc::new(Recording::default());
        let map = map_with(persister.clone(), Arc::new(GarbageSpill::in_memory()));

        // Both inserts missed the lookup; the second allocation lands last
        let loser = map.get_or_allocate("evt");
        loser.insert(Arc::new(MessageEnvelope::new("evt", "a")), true);
        let winner = map.allocate("evt");
        winner.insert(Arc::new(MessageEnvelope::new("evt", "b")), true);

        let current = map.get("evt").unwrap();
        assert!(Arc::ptr_eq(&current, &winner));
        assert_eq!(map.len(), 1);
        drop((current, loser, winner));

        // The next sweep writes and recycles the displaced barrel only
        let evicted = map.sweep(Instant::now(), Duration::from_secs(30)).await;
        assert!(evicted.is_empty());
        assert_eq!(persister.saved.lock().clone(), vec![vec!["a"]]);
        assert_eq!(map.pool().idle(), 1);
        assert!(map.contains("evt"));

        let evicted = map
            .sweep(Instant::now() + Duration::from_secs(31), Duration::from_secs(30))
            .await;
        assert_eq!(evicted, vec!["evt".to_string()]);
        assert_eq!(persister.saved.lock().clone(), vec![vec!["a"], vec!["b"]]);
    }

    #[tokio::test]
    async fn test_displaced_barrel_written_on_persist_all() {
        let persister = Arc::new(Recording::default());
        let map = map_with(persister.clone(), Arc::new(GarbageSpill::in_memory()));
        let loser = map.get_or_allocate("evt");
        loser.insert(Arc::new(MessageEnvelope::new("evt", "a")), true);
        map.allocate("evt");

        assert_eq!(map.persist_all().await, 1);
        assert_eq!(persister.saved.lock().clone(), vec![vec!["a"]]);
    }
}
