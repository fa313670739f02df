//! # logbarrel
//!
//! Cluster-aware log and event buffering for a multi-tenant PaaS.
//!
//! Application instances ship build/deploy events, container stdout and
//! performance samples to a cluster of logbarrel nodes. Every node buffers
//! streams in memory per key, persists them before eviction and serves live
//! tails and history. Each stream is collected by exactly one node, chosen by
//! load and pinned through the coordination store.
//!
//! ## Architecture
//!
//! - **Stores**: four variants (event, read, container, monitor) over a shared
//!   barrel engine with pooled allocation and idle eviction
//! - **Cluster**: instance registry, load-aware distribution router and the
//!   coordinator that broadcasts load samples between nodes
//! - **Persist**: pluggable durable sinks invoked before eviction

pub mod api;
pub mod cluster;
pub mod config;
pub mod message;
pub mod persist;
pub mod store;
pub mod telemetry;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::cluster::{ClusterCoordinator, DistributionRouter, Instance, InstanceRegistry};
    pub use crate::config::{ComponentFactory, NodeConfig};
    pub use crate::message::{Level, MessageEnvelope};
    pub use crate::store::{MessageStore, MonitorData, StoreKind, StoreSet};
    pub use crate::{Error, Result};
}
