//! Cluster coordination for a horizontally scaled log pipeline
//!
//! Every node runs the same stores; this module decides which node collects
//! which stream and keeps the nodes informed of each other's load.

pub mod coordination;
pub mod coordinator;
pub mod distribution;
pub mod pubsub;
pub mod registry;

pub use coordination::{sticky_key, CoordinationStore, MemoryCoordinationStore};
pub use coordinator::{ClusterCoordinator, CoordinatorState};
pub use distribution::{DistributionRouter, PeerLoad, RouterConfig};
pub use pubsub::{ClusterBroadcaster, ClusterMessage, LocalPubSub};
pub use registry::{
    HealthProbe, HealthStatus, Instance, InstanceRegistry, InstanceStatus, RegistryConfig,
    TcpHealthProbe,
};

use std::time::Duration;

/// Cluster configuration
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Load sampling and broadcast interval
    pub monitor_interval: Duration,
    /// Pub/sub channel capacity
    pub pubsub_capacity: usize,
    pub registry: RegistryConfig,
    pub router: RouterConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(5),
            pubsub_capacity: 256,
            registry: RegistryConfig::default(),
            router: RouterConfig::default(),
        }
    }
}
