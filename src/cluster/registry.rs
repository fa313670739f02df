//! Instance registry for tracking cluster members
//!
//! Members publish a presence record under the configured home path in the
//! coordination store. The registry rebuilds its view from those records on
//! start and keeps per-member recency from received load samples.

use super::coordination::{with_retry, CoordinationStore};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Status carried on an instance record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    #[default]
    Healthy,
    Abnormal,
}

/// Result of a health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Heard from within the heartbeat window
    Healthy,
    /// Missed its push interval; kept but excluded from selection
    Abnormal,
    /// Missed checks exceeded half the cluster size; removed
    Deleted,
}

/// A cluster member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub host_id: String,
    pub host_ip: String,
    /// Pub/sub port
    pub pub_port: u16,
    /// Log ingestion port
    pub log_port: u16,
    /// HTTP port, also used for out-of-band health probes
    pub web_port: u16,
    pub host_name: String,
    #[serde(default)]
    pub status: InstanceStatus,
    /// Consecutive failed health checks
    #[serde(default)]
    pub tag_number: u32,
    #[serde(skip, default = "Instant::now")]
    pub last_seen: Instant,
}

impl Instance {
    pub fn new(host_id: impl Into<String>, host_ip: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            host_ip: host_ip.into(),
            pub_port: 6362,
            log_port: 6363,
            web_port: 6364,
            host_name: String::new(),
            status: InstanceStatus::Healthy,
            tag_number: 0,
            last_seen: Instant::now(),
        }
    }

    pub fn with_ports(mut self, pub_port: u16, log_port: u16, web_port: u16) -> Self {
        self.pub_port = pub_port;
        self.log_port = log_port;
        self.web_port = web_port;
        self
    }

    pub fn with_host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = host_name.into();
        self
    }

    pub fn web_addr(&self) -> String {
        format!("{}:{}", self.host_ip, self.web_port)
    }

    pub fn is_healthy(&self) -> bool {
        self.status == InstanceStatus::Healthy
    }
}

/// Out-of-band reachability check for a silent member
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, instance: &Instance) -> bool;
}

/// Probe that opens a TCP connection to the member's web port.
#[derive(Debug, Clone, Default)]
pub struct TcpHealthProbe;

#[async_trait]
impl HealthProbe for TcpHealthProbe {
    async fn probe(&self, instance: &Instance) -> bool {
        tokio::net::TcpStream::connect(instance.web_addr())
            .await
            .is_ok()
    }
}

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Coordination-store prefix for presence records
    pub home_path: String,
    /// Silence after which a member is health-checked
    pub heartbeat_timeout: Duration,
    /// Per-probe timeout
    pub probe_timeout: Duration,
    /// Per-call timeout for coordination-store operations
    pub coordination_timeout: Duration,
    /// Attempts before a coordination-store call is given up
    pub coordination_retries: usize,
    /// Presence refresh and rediscovery interval
    pub refresh_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            home_path: "home/logbarrel/instances/".to_string(),
            heartbeat_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            coordination_timeout: Duration::from_secs(3),
            coordination_retries: 3,
            refresh_interval: Duration::from_secs(30),
        }
    }
}

/// Registry of cluster members
pub struct InstanceRegistry {
    current: Instance,
    instances: Arc<RwLock<HashMap<String, Instance>>>,
    coordination: Arc<dyn CoordinationStore>,
    probe: Arc<dyn HealthProbe>,
    config: RegistryConfig,
}

impl InstanceRegistry {
    pub fn new(
        current: Instance,
        coordination: Arc<dyn CoordinationStore>,
        probe: Arc<dyn HealthProbe>,
        config: RegistryConfig,
    ) -> Self {
        let mut instances = HashMap::new();
        instances.insert(current.host_id.clone(), current.clone());
        Self {
            current,
            instances: Arc::new(RwLock::new(instances)),
            coordination,
            probe,
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn presence_key(&self, host_id: &str) -> String {
        format!("{}{}", self.config.home_path, host_id)
    }

    /// Publish this instance's presence record and load the member list.
    ///
    /// Fails once the coordination store stays unreachable past the retry
    /// budget.
    pub async fn start(&self) -> Result<()> {
        self.publish_presence().await?;
        let members = self.discover().await?;
        info!(
            instance_id = %self.current.host_id,
            members,
            "Instance registry started"
        );
        Ok(())
    }

    /// Withdraw this instance's presence record.
    pub async fn stop(&self) -> Result<()> {
        self.withdraw_presence(&self.current.host_id).await?;
        info!(instance_id = %self.current.host_id, "Instance registry stopped");
        Ok(())
    }

    async fn withdraw_presence(&self, host_id: &str) -> Result<()> {
        let key = self.presence_key(host_id);
        let coordination = self.coordination.clone();
        with_retry(
            "presence.delete",
            self.config.coordination_retries,
            self.config.coordination_timeout,
            || {
                let coordination = coordination.clone();
                let key = key.clone();
                async move { coordination.delete(&key).await }
            },
        )
        .await
    }

    async fn publish_presence(&self) -> Result<()> {
        let key = self.presence_key(&self.current.host_id);
        let value = serde_json::to_string(&self.current)?;
        let coordination = self.coordination.clone();
        with_retry(
            "presence.put",
            self.config.coordination_retries,
            self.config.coordination_timeout,
            || {
                let coordination = coordination.clone();
                let key = key.clone();
                let value = value.clone();
                async move { coordination.put(&key, &value).await }
            },
        )
        .await
    }

    /// Load presence records. Members already known keep their recency.
    /// Returns the number of known members.
    pub async fn discover(&self) -> Result<usize> {
        let prefix = self.config.home_path.clone();
        let coordination = self.coordination.clone();
        let records = with_retry(
            "presence.list",
            self.config.coordination_retries,
            self.config.coordination_timeout,
            || {
                let coordination = coordination.clone();
                let prefix = prefix.clone();
                async move { coordination.list_prefix(&prefix).await }
            },
        )
        .await?;

        let mut instances = self.instances.write().await;
        for (key, value) in records {
            match parse_presence(&value) {
                Ok(instance) => {
                    if !instances.contains_key(&instance.host_id) {
                        debug!(instance_id = %instance.host_id, "Discovered instance");
                        instances.insert(instance.host_id.clone(), instance);
                    }
                }
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable presence record"),
            }
        }
        Ok(instances.len())
    }

    /// Refresh presence and rediscover members until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.refresh_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.publish_presence().await {
                        warn!(error = %e, "Presence refresh failed");
                    }
                    if let Err(e) = self.discover().await {
                        warn!(error = %e, "Instance discovery failed");
                    }
                }
                _ = shutdown.cancelled() => return,
            }
        }
    }

    pub fn current_instance(&self) -> Instance {
        self.current.clone()
    }

    pub async fn get(&self, host_id: &str) -> Option<Instance> {
        self.instances.read().await.get(host_id).cloned()
    }

    pub async fn all(&self) -> Vec<Instance> {
        self.instances.read().await.values().cloned().collect()
    }

    pub async fn all_healthy(&self) -> Vec<Instance> {
        self.instances
            .read()
            .await
            .values()
            .filter(|i| i.is_healthy())
            .cloned()
            .collect()
    }

    pub async fn cluster_size(&self) -> usize {
        self.instances.read().await.len()
    }

    /// Register or replace a member.
    pub async fn register(&self, mut instance: Instance) {
        instance.last_seen = Instant::now();
        info!(instance_id = %instance.host_id, addr = %instance.web_addr(), "Registering instance");
        self.instances
            .write()
            .await
            .insert(instance.host_id.clone(), instance);
    }

    /// Record that `host_id` was heard from. Returns false for unknown members.
    pub async fn heartbeat(&self, host_id: &str) -> bool {
        let mut instances = self.instances.write().await;
        match instances.get_mut(host_id) {
            Some(instance) => {
                instance.last_seen = Instant::now();
                instance.tag_number = 0;
                if instance.status == InstanceStatus::Abnormal {
                    instance.status = InstanceStatus::Healthy;
                    info!(instance_id = %host_id, "Instance recovered");
                }
                true
            }
            None => false,
        }
    }

    pub async fn check_health(&self, host_id: &str) -> HealthStatus {
        self.check_health_at(host_id, Instant::now()).await
    }

    /// Classify `host_id` as of `now`.
    ///
    /// A member heard from within the heartbeat window is healthy. A silent
    /// member is probed: a member that still answers is abnormal, one that
    /// does not gains a tag, and once its tags exceed half the cluster size
    /// it is removed together with its presence record, so discovery does
    /// not bring it back until it publishes again.
    pub async fn check_health_at(&self, host_id: &str, now: Instant) -> HealthStatus {
        if host_id == self.current.host_id {
            return HealthStatus::Healthy;
        }
        let Some(instance) = self.get(host_id).await else {
            return HealthStatus::Deleted;
        };
        if now.saturating_duration_since(instance.last_seen) <= self.config.heartbeat_timeout {
            return HealthStatus::Healthy;
        }

        let reachable = tokio::time::timeout(self.config.probe_timeout, self.probe.probe(&instance))
            .await
            .unwrap_or(false);

        {
            let mut instances = self.instances.write().await;
            let cluster_size = instances.len();
            let Some(instance) = instances.get_mut(host_id) else {
                return HealthStatus::Deleted;
            };
            instance.status = InstanceStatus::Abnormal;
            if reachable {
                debug!(instance_id = %host_id, "Silent instance still reachable");
                return HealthStatus::Abnormal;
            }

            instance.tag_number += 1;
            let tags = instance.tag_number;
            if tags as usize <= cluster_size / 2 {
                warn!(instance_id = %host_id, tags, cluster_size, "Instance unreachable");
                return HealthStatus::Abnormal;
            }
            instances.remove(host_id);
            warn!(instance_id = %host_id, tags, cluster_size, "Instance unreachable, removing");
        }

        if let Err(e) = self.withdraw_presence(host_id).await {
            warn!(instance_id = %host_id, error = %e, "Failed to withdraw presence of removed instance");
        }
        HealthStatus::Deleted
    }
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("current", &self.current.host_id)
            .finish()
    }
}

/// Parse a presence record, mapping failures to a coordination error.
pub fn parse_presence(value: &str) -> Result<Instance> {
    serde_json::from_str(value).map_err(|e| Error::Coordination(format!("bad presence record: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::coordination::MemoryCoordinationStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Switch(AtomicBool);

    #[async_trait]
    impl HealthProbe for Switch {
        async fn probe(&self, _instance: &Instance) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn registry(reachable: bool) -> (InstanceRegistry, Arc<Switch>) {
        let probe = Arc::new(Switch(AtomicBool::new(reachable)));
        let registry = InstanceRegistry::new(
            Instance::new("self", "127.0.0.1"),
            Arc::new(MemoryCoordinationStore::new()),
            probe.clone(),
            RegistryConfig::default(),
        );
        (registry, probe)
    }

    #[tokio::test]
    async fn test_start_publishes_and_discovers() {
        let coordination = Arc::new(MemoryCoordinationStore::new());
        let a = InstanceRegistry::new(
            Instance::new("a", "10.0.0.1"),
            coordination.clone(),
            Arc::new(TcpHealthProbe),
            RegistryConfig::default(),
        );
        let b = InstanceRegistry::new(
            Instance::new("b", "10.0.0.2"),
            coordination.clone(),
            Arc::new(TcpHealthProbe),
            RegistryConfig::default(),
        );
        a.start().await.unwrap();
        b.start().await.unwrap();

        assert!(b.get("a").await.is_some());
        assert_eq!(a.discover().await.unwrap(), 2);

        b.stop().await.unwrap();
        assert_eq!(coordination.len(), 1);
    }

    #[tokio::test]
    async fn test_start_fails_without_coordination() {
        let coordination = Arc::new(MemoryCoordinationStore::new());
        coordination.set_available(false);
        let registry = InstanceRegistry::new(
            Instance::new("a", "10.0.0.1"),
            coordination,
            Arc::new(TcpHealthProbe),
            RegistryConfig {
                coordination_retries: 2,
                ..Default::default()
            },
        );
        assert!(matches!(registry.start().await, Err(Error::TooManyRetries)));
    }

    #[tokio::test]
    async fn test_silent_but_reachable_is_abnormal() {
        let (registry, _) = registry(true);
        registry.register(Instance::new("peer", "10.0.0.2")).await;

        let later = Instant::now() + Duration::from_secs(11);
        assert_eq!(registry.check_health_at("peer", later).await, HealthStatus::Abnormal);
        assert!(registry.all_healthy().await.iter().all(|i| i.host_id != "peer"));

        assert!(registry.heartbeat("peer").await);
        assert_eq!(registry.check_health("peer").await, HealthStatus::Healthy);
        assert!(registry.get("peer").await.unwrap().is_healthy());
    }

    #[tokio::test]
    async fn test_unreachable_removed_past_half_cluster() {
        let (registry, _) = registry(false);
        registry.register(Instance::new("peer", "10.0.0.2")).await;
        registry.register(Instance::new("other", "10.0.0.3")).await;
        let later = Instant::now() + Duration::from_secs(11);

        // Cluster of three: removal once tags exceed 1
        assert_eq!(registry.check_health_at("peer", later).await, HealthStatus::Abnormal);
        assert_eq!(registry.check_health_at("peer", later).await, HealthStatus::Deleted);
        assert!(registry.get("peer").await.is_none());
    }

    #[tokio::test]
    async fn test_removed_instance_not_rediscovered() {
        let coordination = Arc::new(MemoryCoordinationStore::new());
        let me = InstanceRegistry::new(
            Instance::new("me", "127.0.0.1"),
            coordination.clone(),
            Arc::new(Switch(AtomicBool::new(false))),
            RegistryConfig::default(),
        );
        let peer = InstanceRegistry::new(
            Instance::new("peer", "10.0.0.2"),
            coordination.clone(),
            Arc::new(TcpHealthProbe),
            RegistryConfig::default(),
        );
        peer.start().await.unwrap();
        me.start().await.unwrap();
        assert!(me.get("peer").await.is_some());

        // The peer crashed without withdrawing its presence
        let later = Instant::now() + Duration::from_secs(11);
        assert_eq!(me.check_health_at("peer", later).await, HealthStatus::Abnormal);
        assert_eq!(me.check_health_at("peer", later).await, HealthStatus::Deleted);

        assert_eq!(me.discover().await.unwrap(), 1);
        assert!(me.get("peer").await.is_none());
        assert!(me.all_healthy().await.iter().all(|i| i.host_id != "peer"));
        assert!(coordination.get("home/logbarrel/instances/peer").await.unwrap().is_none());

        // A restarted peer publishes again and is picked up
        peer.start().await.unwrap();
        me.discover().await.unwrap();
        assert!(me.get("peer").await.unwrap().is_healthy());
    }

    #[tokio::test]
    async fn test_self_is_always_healthy() {
        let (registry, _) = registry(false);
        let later = Instant::now() + Duration::from_secs(3600);
        assert_eq!(registry.check_health_at("self", later).await, HealthStatus::Healthy);
    }
}
