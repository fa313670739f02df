//! Cluster coordinator
//!
//! Composes the registry, the broadcaster and the router into one lifecycle
//! (`Created -> Started -> Running -> Stopping -> Stopped`) and runs the load
//! feed: every monitor tick the node's store load is broadcast to peers and
//! fed into the local router.

use super::distribution::DistributionRouter;
use super::pubsub::{ClusterBroadcaster, ClusterMessage};
use super::registry::InstanceRegistry;
use super::ClusterConfig;
use crate::store::{MonitorData, StoreSet};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Created,
    Started,
    Running,
    Stopping,
    Stopped,
}

impl CoordinatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinatorState::Created => "created",
            CoordinatorState::Started => "started",
            CoordinatorState::Running => "running",
            CoordinatorState::Stopping => "stopping",
            CoordinatorState::Stopped => "stopped",
        }
    }
}

pub struct ClusterCoordinator {
    config: ClusterConfig,
    registry: Arc<InstanceRegistry>,
    router: Arc<DistributionRouter>,
    broadcaster: Arc<dyn ClusterBroadcaster>,
    stores: Arc<StoreSet>,
    state: Mutex<CoordinatorState>,
    shutdown: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterCoordinator {
    /// `shutdown` must be the token the stores were built with.
    pub fn new(
        config: ClusterConfig,
        registry: Arc<InstanceRegistry>,
        router: Arc<DistributionRouter>,
        broadcaster: Arc<dyn ClusterBroadcaster>,
        stores: Arc<StoreSet>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            registry,
            router,
            broadcaster,
            stores,
            state: Mutex::new(CoordinatorState::Created),
            shutdown,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.lock()
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<DistributionRouter> {
        &self.router
    }

    pub fn stores(&self) -> &Arc<StoreSet> {
        &self.stores
    }

    fn transition(&self, from: CoordinatorState, to: CoordinatorState) -> Result<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(Error::InvalidState {
                expected: from.as_str(),
                actual: state.as_str(),
            });
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: CoordinatorState) {
        *self.state.lock() = to;
    }

    /// Bring up the registry, the broadcaster and the router in that order,
    /// then start the background tasks. The first failing component aborts
    /// the start: later components are left untouched and the ones already
    /// started are stopped again.
    pub async fn start(&self) -> Result<()> {
        self.transition(CoordinatorState::Created, CoordinatorState::Started)?;
        let instance_id = self.registry.current_instance().host_id;

        if let Err(e) = self.registry.start().await {
            self.abort_start(false).await;
            return Err(e);
        }
        if let Err(e) = self.broadcaster.start().await {
            self.abort_start(false).await;
            return Err(e);
        }
        if let Err(e) = self.router.start().await {
            self.abort_start(true).await;
            return Err(e);
        }

        let mut tasks = self.stores.spawn();

        let registry = self.registry.clone();
        let shutdown = self.shutdown.clone();
        tasks.push(tokio::spawn(async move { registry.run(shutdown).await }));

        let router = self.router.clone();
        let shutdown = self.shutdown.clone();
        tasks.push(tokio::spawn(async move { router.run(shutdown).await }));

        tasks.push(tokio::spawn(monitor_loop(
            self.stores.clone(),
            self.router.clone(),
            self.broadcaster.clone(),
            self.config.monitor_interval,
            self.shutdown.clone(),
        )));

        tasks.push(tokio::spawn(receive_loop(
            self.broadcaster.subscribe(),
            self.router.clone(),
            instance_id.clone(),
            self.shutdown.clone(),
        )));

        self.tasks.lock().await.extend(tasks);
        self.transition(CoordinatorState::Started, CoordinatorState::Running)?;
        info!(instance_id = %instance_id, "Cluster coordinator running");
        Ok(())
    }

    /// Undo a partial start. The registry may have published presence even
    /// when its own start failed, so it is always withdrawn.
    async fn abort_start(&self, broadcaster_started: bool) {
        warn!("Cluster coordinator start failed, rolling back");
        if broadcaster_started {
            if let Err(e) = self.broadcaster.stop().await {
                warn!(error = %e, "Broadcaster stop failed");
            }
        }
        if let Err(e) = self.registry.stop().await {
            warn!(error = %e, "Registry stop failed");
        }
        self.shutdown.cancel();
        self.set_state(CoordinatorState::Stopped);
    }

    /// Cancel background work, persist every store, then stop the
    /// broadcaster and finally the registry.
    pub async fn stop(&self) -> Result<()> {
        self.transition(CoordinatorState::Running, CoordinatorState::Stopping)?;
        info!("Cluster coordinator stopping");

        self.shutdown.cancel();
        self.stores.stop().await;
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        if let Err(e) = self.broadcaster.stop().await {
            warn!(error = %e, "Broadcaster stop failed");
        }
        if let Err(e) = self.registry.stop().await {
            warn!(error = %e, "Registry stop failed");
        }

        self.set_state(CoordinatorState::Stopped);
        info!("Cluster coordinator stopped");
        Ok(())
    }

    /// Sample the node's load, feed the local router and broadcast it.
    pub async fn publish_load(&self) -> MonitorData {
        publish_load(&self.stores, &self.router, self.broadcaster.as_ref()).await
    }
}

async fn publish_load(
    stores: &StoreSet,
    router: &DistributionRouter,
    broadcaster: &dyn ClusterBroadcaster,
) -> MonitorData {
    let data = stores.monitor_data();
    router.update_monitor(data.clone()).await;
    match broadcaster.send(ClusterMessage::monitor(&data)).await {
        Ok(receivers) => debug!(receivers, "Broadcast load sample"),
        Err(e) => warn!(error = %e, "Load broadcast failed"),
    }
    data
}

async fn monitor_loop(
    stores: Arc<StoreSet>,
    router: Arc<DistributionRouter>,
    broadcaster: Arc<dyn ClusterBroadcaster>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                publish_load(&stores, &router, broadcaster.as_ref()).await;
            }
            _ = shutdown.cancelled() => return,
        }
    }
}

async fn receive_loop(
    mut rx: broadcast::Receiver<ClusterMessage>,
    router: Arc<DistributionRouter>,
    self_id: String,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(message) if message.is_monitor() => match message.decode_monitor() {
                    Ok(data) if data.instance_id == self_id => {}
                    Ok(data) => router.update_monitor(data).await,
                    Err(e) => warn!(error = %e, "Dropping bad load sample"),
                },
                Ok(message) => debug!(mode = %message.mode, "Ignoring cluster message"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Cluster receiver lagged");
                }
                Err(RecvError::Closed) => return,
            },
            _ = shutdown.cancelled() => return,
        }
    }
}
