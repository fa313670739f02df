//! Node configuration and component factory
//!
//! External collaborators (persistence backend, coordination store, cluster
//! broadcaster) are chosen by name so the same binary runs against
//! in-process fakes during development.

use crate::cluster::{
    ClusterBroadcaster, ClusterConfig, ClusterCoordinator, CoordinationStore, DistributionRouter,
    Instance, InstanceRegistry, LocalPubSub, MemoryCoordinationStore, TcpHealthProbe,
};
use crate::persist::{MemoryStatusSink, MessagePersister, PersisterKind};
use crate::store::{GarbageSpill, SpillConfig, StoreContext, StoreSet, StoreSetConfig};
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Everything needed to assemble one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub instance: Instance,
    /// Root for persisted streams; event and container logs get subdirectories.
    pub data_dir: PathBuf,
    pub event_persister: PersisterKind,
    pub container_persister: PersisterKind,
    pub cluster: ClusterConfig,
    pub stores: StoreSetConfig,
    pub spill: SpillConfig,
}

impl NodeConfig {
    pub fn new(instance: Instance, data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let spill = SpillConfig {
            path: Some(data_dir.join("spill.log")),
            ..Default::default()
        };
        Self {
            instance,
            data_dir,
            event_persister: PersisterKind::EventFile,
            container_persister: PersisterKind::File,
            cluster: ClusterConfig::default(),
            stores: StoreSetConfig::default(),
            spill,
        }
    }
}

pub struct ComponentFactory;

impl ComponentFactory {
    /// Open a persistence backend by name (`file`, `eventfile`) under `dir`.
    pub fn create_persister(name: &str, dir: &Path) -> Result<Arc<dyn MessagePersister>> {
        let kind: PersisterKind = name.parse()?;
        info!(persister = kind.as_str(), dir = %dir.display(), "Opening persister");
        kind.open(dir)
    }

    /// Coordination store by backend name. Only `memory` ships in-tree.
    pub fn create_coordination_store(backend: &str) -> Result<Arc<dyn CoordinationStore>> {
        match backend.trim().to_ascii_lowercase().as_str() {
            "memory" => {
                info!("Using in-memory coordination store (single process)");
                Ok(Arc::new(MemoryCoordinationStore::new()))
            }
            other => Err(Error::Config(format!(
                "Unknown COORDINATION_BACKEND: {}. Use 'memory'",
                other
            ))),
        }
    }

    /// Environment variables:
    /// - COORDINATION_BACKEND: "memory" (default)
    pub fn coordination_store_from_env() -> Result<Arc<dyn CoordinationStore>> {
        let backend =
            std::env::var("COORDINATION_BACKEND").unwrap_or_else(|_| "memory".to_string());
        Self::create_coordination_store(&backend)
    }

    /// Cluster broadcaster by backend name. Only `local` ships in-tree.
    pub fn create_broadcaster(
        backend: &str,
        capacity: usize,
    ) -> Result<Arc<dyn ClusterBroadcaster>> {
        match backend.trim().to_ascii_lowercase().as_str() {
            "local" => {
                info!(capacity, "Using in-process cluster broadcaster");
                Ok(Arc::new(LocalPubSub::new(capacity)))
            }
            other => Err(Error::Config(format!(
                "Unknown BROADCAST_BACKEND: {}. Use 'local'",
                other
            ))),
        }
    }

    /// Environment variables:
    /// - BROADCAST_BACKEND: "local" (default)
    pub fn broadcaster_from_env(capacity: usize) -> Result<Arc<dyn ClusterBroadcaster>> {
        let backend = std::env::var("BROADCAST_BACKEND").unwrap_or_else(|_| "local".to_string());
        Self::create_broadcaster(&backend, capacity)
    }

    /// Assemble stores, registry, router and coordinator for one node.
    pub fn build_coordinator(
        config: NodeConfig,
        coordination: Arc<dyn CoordinationStore>,
        broadcaster: Arc<dyn ClusterBroadcaster>,
    ) -> Result<Arc<ClusterCoordinator>> {
        let event_persister = config
            .event_persister
            .open(&config.data_dir.join("events"))?;
        let container_persister = config
            .container_persister
            .open(&config.data_dir.join("containers"))?;

        let shutdown = CancellationToken::new();
        let spill = Arc::new(GarbageSpill::new(config.spill));
        let context =
            StoreContext::new(config.instance.host_id.clone(), shutdown.clone()).with_spill(spill);
        let stores = Arc::new(StoreSet::new(
            config.stores,
            context,
            event_persister,
            container_persister,
            Arc::new(MemoryStatusSink::new()),
        ));

        let registry = Arc::new(InstanceRegistry::new(
            config.instance,
            coordination.clone(),
            Arc::new(TcpHealthProbe),
            config.cluster.registry.clone(),
        ));
        let router = Arc::new(DistributionRouter::new(
            registry.clone(),
            coordination,
            config.cluster.router.clone(),
        ));

        Ok(Arc::new(ClusterCoordinator::new(
            config.cluster,
            registry,
            router,
            broadcaster,
            stores,
            shutdown,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::CoordinatorState;
    use tempfile::TempDir;

    #[test]
    fn test_unknown_backends_rejected() {
        assert!(matches!(
            ComponentFactory::create_coordination_store("etcd"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ComponentFactory::create_broadcaster("redis", 16),
            Err(Error::Config(_))
        ));
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            ComponentFactory::create_persister("mongo", dir.path()),
            Err(Error::UnknownPersister(_))
        ));
    }

    #[test]
    fn test_known_backends() {
        let dir = TempDir::new().unwrap();
        assert!(ComponentFactory::create_coordination_store("Memory").is_ok());
        assert!(ComponentFactory::create_broadcaster("local", 16).is_ok());
        assert!(ComponentFactory::create_persister("file", dir.path()).is_ok());
        assert!(ComponentFactory::create_persister("eventfile", dir.path()).is_ok());
    }

    #[tokio::test]
    async fn test_build_coordinator() {
        let dir = TempDir::new().unwrap();
        let config = NodeConfig::new(Instance::new("node-a", "127.0.0.1"), dir.path());
        assert_eq!(config.spill.path, Some(dir.path().join("spill.log")));

        let coordinator = ComponentFactory::build_coordinator(
            config,
            ComponentFactory::create_coordination_store("memory").unwrap(),
            ComponentFactory::create_broadcaster("local", 16).unwrap(),
        )
        .unwrap();
        assert_eq!(coordinator.state(), CoordinatorState::Created);
        assert_eq!(coordinator.registry().current_instance().host_id, "node-a");
        assert!(dir.path().join("events").is_dir());
        assert!(dir.path().join("containers").is_dir());
    }
}
