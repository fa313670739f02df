//! Distribution router
//!
//! Decides which instance should collect a stream. A sticky assignment keeps
//! a stream on its first collector while that collector is healthy; new
//! streams go to the peer with the lowest load score. Peers are known only
//! through their broadcast load samples, so the view is eventually
//! consistent: during a partition two nodes may both claim a stream.

use super::coordination::{sticky_key, with_retry, CoordinationStore, STICKY_PREFIX};
use super::registry::{HealthStatus, Instance, InstanceRegistry};
use crate::store::MonitorData;
use crate::Result;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Health sweep interval
    pub health_interval: Duration,
    /// Silence after which a peer is health-checked
    pub silence_timeout: Duration,
    /// Per-call timeout for sticky lookups and writes
    pub coordination_timeout: Duration,
    /// Attempts for sticky lookups and writes
    pub coordination_retries: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(5),
            silence_timeout: Duration::from_secs(10),
            coordination_timeout: Duration::from_secs(3),
            coordination_retries: 2,
        }
    }
}

#[derive(Debug, Clone)]
struct PeerEntry {
    data: MonitorData,
    last_update: Instant,
    abnormal: bool,
    first_seen: u64,
}

/// Public view of a peer's last load sample
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerLoad {
    pub data: MonitorData,
    pub abnormal: bool,
    pub score: u64,
}

pub struct DistributionRouter {
    registry: Arc<InstanceRegistry>,
    coordination: Arc<dyn CoordinationStore>,
    peers: RwLock<HashMap<String, PeerEntry>>,
    sticky: DashMap<String, String>,
    next_seen: AtomicU64,
    config: RouterConfig,
}

impl DistributionRouter {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        coordination: Arc<dyn CoordinationStore>,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            coordination,
            peers: RwLock::new(HashMap::new()),
            sticky: DashMap::new(),
            next_seen: AtomicU64::new(0),
            config,
        }
    }

    /// Load existing sticky assignments into the local cache.
    pub async fn start(&self) -> Result<()> {
        let coordination = self.coordination.clone();
        let records = with_retry(
            "sticky.list",
            self.config.coordination_retries,
            self.config.coordination_timeout,
            || {
                let coordination = coordination.clone();
                async move { coordination.list_prefix(STICKY_PREFIX).await }
            },
        )
        .await?;
        for (key, owner) in records {
            if let Some(stream) = key.strip_prefix(STICKY_PREFIX) {
                self.sticky.insert(stream.to_string(), owner);
            }
        }
        info!(sticky = self.sticky.len(), "Distribution router started");
        Ok(())
    }

    /// Instance that should collect `stream_key`.
    ///
    /// Never fails: an unreachable coordination store or an empty peer view
    /// routes to the current instance.
    pub async fn get_suitable_instance(&self, stream_key: &str) -> Instance {
        let current = self.registry.current_instance();

        let sticky = match self.lookup_sticky(stream_key).await {
            Ok(sticky) => sticky,
            Err(e) => {
                warn!(key = %stream_key, error = %e, "Sticky lookup failed, routing to self");
                return current;
            }
        };
        if let Some(owner) = sticky {
            if self.is_selectable(&owner) {
                if let Some(instance) = self.registry.get(&owner).await {
                    debug!(key = %stream_key, instance_id = %owner, "Sticky route");
                    return instance;
                }
            }
        }

        if self.peers.read().is_empty() {
            return current;
        }

        for candidate in self.ranked_candidates() {
            if let Some(instance) = self.registry.get(&candidate).await {
                self.write_sticky(stream_key, &candidate).await;
                debug!(key = %stream_key, instance_id = %candidate, "Scored route");
                return instance;
            }
        }
        current
    }

    async fn lookup_sticky(&self, stream_key: &str) -> Result<Option<String>> {
        if let Some(owner) = self.sticky.get(stream_key) {
            return Ok(Some(owner.clone()));
        }
        let key = sticky_key(stream_key);
        let coordination = self.coordination.clone();
        let owner = with_retry(
            "sticky.get",
            self.config.coordination_retries,
            self.config.coordination_timeout,
            || {
                let coordination = coordination.clone();
                let key = key.clone();
                async move { coordination.get(&key).await }
            },
        )
        .await?;
        if let Some(owner) = &owner {
            self.sticky.insert(stream_key.to_string(), owner.clone());
        }
        Ok(owner)
    }

    async fn write_sticky(&self, stream_key: &str, owner: &str) {
        self.sticky.insert(stream_key.to_string(), owner.to_string());
        let key = sticky_key(stream_key);
        let coordination = self.coordination.clone();
        let result = with_retry(
            "sticky.put",
            self.config.coordination_retries,
            self.config.coordination_timeout,
            || {
                let coordination = coordination.clone();
                let key = key.clone();
                let owner = owner.to_string();
                async move { coordination.put(&key, &owner).await }
            },
        )
        .await;
        if let Err(e) = result {
            warn!(key = %stream_key, instance_id = %owner, error = %e, "Sticky write failed");
        }
    }

    fn is_selectable(&self, instance_id: &str) -> bool {
        self.peers
            .read()
            .get(instance_id)
            .map(|peer| !peer.abnormal)
            .unwrap_or(false)
    }

    /// Non-abnormal peers by ascending load score, ties by first-seen order.
    fn ranked_candidates(&self) -> Vec<String> {
        let peers = self.peers.read();
        let mut ranked: Vec<(u64, u64, &String)> = peers
            .iter()
            .filter(|(_, peer)| !peer.abnormal)
            .map(|(id, peer)| (peer.data.load_score(), peer.first_seen, id))
            .collect();
        ranked.sort();
        ranked.into_iter().map(|(_, _, id)| id.clone()).collect()
    }

    /// Record a load sample from `data.instance_id`. A fresh sample clears
    /// the abnormal mark.
    pub async fn update_monitor(&self, data: MonitorData) {
        let id = data.instance_id.clone();
        if id.is_empty() {
            return;
        }
        {
            let mut peers = self.peers.write();
            let now = Instant::now();
            match peers.get_mut(&id) {
                Some(peer) => {
                    if peer.abnormal {
                        info!(instance_id = %id, "Peer sample received, clearing abnormal");
                    }
                    peer.data = data;
                    peer.last_update = now;
                    peer.abnormal = false;
                }
                None => {
                    let first_seen = self.next_seen.fetch_add(1, Ordering::Relaxed);
                    debug!(instance_id = %id, "New peer");
                    peers.insert(
                        id.clone(),
                        PeerEntry {
                            data,
                            last_update: now,
                            abnormal: false,
                            first_seen,
                        },
                    );
                }
            }
        }
        if !self.registry.heartbeat(&id).await {
            if let Err(e) = self.registry.discover().await {
                warn!(instance_id = %id, error = %e, "Discovery after unknown peer failed");
            }
        }
    }

    /// One health pass as of `now`. Returns the purged peer ids.
    pub async fn sweep_health_at(&self, now: Instant) -> Vec<String> {
        let self_id = self.registry.current_instance().host_id;
        let silent: Vec<String> = self
            .peers
            .read()
            .iter()
            .filter(|(id, peer)| {
                **id != self_id
                    && now.saturating_duration_since(peer.last_update) > self.config.silence_timeout
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut purged = Vec::new();
        for id in silent {
            match self.registry.check_health_at(&id, now).await {
                HealthStatus::Deleted => {
                    self.peers.write().remove(&id);
                    self.sticky.retain(|_, owner| *owner != id);
                    warn!(instance_id = %id, "Peer deleted, purged from routing");
                    purged.push(id);
                }
                HealthStatus::Abnormal => {
                    if let Some(peer) = self.peers.write().get_mut(&id) {
                        peer.abnormal = true;
                    }
                }
                HealthStatus::Healthy => {}
            }
        }
        purged
    }

    /// Run the health sweep until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.health_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_health_at(Instant::now()).await;
                }
                _ = shutdown.cancelled() => {
                    debug!("Router health sweep stopped");
                    return;
                }
            }
        }
    }

    pub fn peer(&self, instance_id: &str) -> Option<PeerLoad> {
        self.peers.read().get(instance_id).map(|peer| PeerLoad {
            data: peer.data.clone(),
            abnormal: peer.abnormal,
            score: peer.data.load_score(),
        })
    }

    pub fn sticky_owner(&self, stream_key: &str) -> Option<String> {
        self.sticky.get(stream_key).map(|owner| owner.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::coordination::MemoryCoordinationStore;
    use crate::cluster::registry::{HealthProbe, RegistryConfig};
    use async_trait::async_trait;

    struct Reachable;

    #[async_trait]
    impl HealthProbe for Reachable {
        async fn probe(&self, _instance: &Instance) -> bool {
            true
        }
    }

    fn load(id: &str, service_size: u64, log: u64) -> MonitorData {
        MonitorData {
            instance_id: id.to_string(),
            service_size,
            log_size_per_minute: log,
        }
    }

    async fn router() -> (DistributionRouter, Arc<MemoryCoordinationStore>) {
        let coordination = Arc::new(MemoryCoordinationStore::new());
        let registry = Arc::new(InstanceRegistry::new(
            Instance::new("self", "127.0.0.1"),
            coordination.clone(),
            Arc::new(Reachable),
            RegistryConfig::default(),
        ));
        for id in ["a", "b"] {
            registry.register(Instance::new(id, "10.0.0.1")).await;
        }
        let router = DistributionRouter::new(registry, coordination.clone(), RouterConfig::default());
        (router, coordination)
    }

    #[tokio::test]
    async fn test_bootstrap_routes_to_self() {
        let (router, _) = router().await;
        assert_eq!(router.get_suitable_instance("svc-1").await.host_id, "self");
    }

    #[tokio::test]
    async fn test_lowest_score_wins_and_sticks() {
        let (router, coordination) = router().await;
        router.update_monitor(load("a", 2, 100)).await;
        router.update_monitor(load("b", 1, 50)).await;

        assert_eq!(router.get_suitable_instance("svc-1").await.host_id, "b");
        assert_eq!(
            coordination.get(&sticky_key("svc-1")).await.unwrap().as_deref(),
            Some("b")
        );

        // Load shifts but the sticky owner is kept
        router.update_monitor(load("b", 50, 5000)).await;
        assert_eq!(router.get_suitable_instance("svc-1").await.host_id, "b");
        assert_eq!(router.get_suitable_instance("svc-2").await.host_id, "a");
    }

    #[tokio::test]
    async fn test_ties_break_by_first_seen() {
        let (router, _) = router().await;
        router.update_monitor(load("b", 1, 10)).await;
        router.update_monitor(load("a", 1, 10)).await;
        assert_eq!(router.get_suitable_instance("svc-1").await.host_id, "b");
    }

    #[tokio::test]
    async fn test_coordination_outage_routes_to_self() {
        let (router, coordination) = router().await;
        router.update_monitor(load("a", 0, 0)).await;
        coordination.set_available(false);
        assert_eq!(router.get_suitable_instance("svc-1").await.host_id, "self");
    }

    #[tokio::test]
    async fn test_abnormal_peer_excluded_until_next_sample() {
        let (router, _) = router().await;
        router.update_monitor(load("a", 0, 0)).await;
        router.update_monitor(load("b", 5, 500)).await;

        let later = Instant::now() + Duration::from_secs(11);
        assert!(router.sweep_health_at(later).await.is_empty());
        assert!(router.peer("a").unwrap().abnormal);
        assert!(router.peer("b").unwrap().abnormal);
        assert_eq!(router.get_suitable_instance("svc-1").await.host_id, "self");

        router.update_monitor(load("a", 0, 0)).await;
        assert!(!router.peer("a").unwrap().abnormal);
        assert_eq!(router.get_suitable_instance("svc-1").await.host_id, "a");
    }
}
