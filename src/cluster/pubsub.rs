//! Cluster pub/sub for load samples
//!
//! Each node broadcasts `{mode: "monitor", payload: "instanceID,serviceSize,logSizePerMinute"}`
//! on every monitor tick. Receivers feed the sample into their router.

use crate::store::MonitorData;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Mode tag for load samples
pub const MODE_MONITOR: &str = "monitor";

/// Logical message exchanged between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMessage {
    pub mode: String,
    pub payload: String,
}

impl ClusterMessage {
    pub fn monitor(data: &MonitorData) -> Self {
        Self {
            mode: MODE_MONITOR.to_string(),
            payload: format!(
                "{},{},{}",
                data.instance_id, data.service_size, data.log_size_per_minute
            ),
        }
    }

    pub fn is_monitor(&self) -> bool {
        self.mode == MODE_MONITOR
    }

    /// Decode a monitor payload. The two numeric fields are taken from the
    /// right so an instance id containing a comma still parses.
    pub fn decode_monitor(&self) -> Result<MonitorData> {
        if !self.is_monitor() {
            return Err(Error::Serialization(format!(
                "not a monitor message: {}",
                self.mode
            )));
        }
        let mut parts = self.payload.rsplitn(3, ',');
        let log_size = parts.next();
        let service_size = parts.next();
        let instance_id = parts.next();
        match (instance_id, service_size, log_size) {
            (Some(id), Some(service), Some(log)) if !id.is_empty() => {
                let service_size = service.trim().parse::<u64>().map_err(|e| {
                    Error::Serialization(format!("bad service size '{service}': {e}"))
                })?;
                let log_size_per_minute = log.trim().parse::<u64>().map_err(|e| {
                    Error::Serialization(format!("bad log size '{log}': {e}"))
                })?;
                Ok(MonitorData {
                    instance_id: id.to_string(),
                    service_size,
                    log_size_per_minute,
                })
            }
            _ => Err(Error::Serialization(format!(
                "bad monitor payload: {}",
                self.payload
            ))),
        }
    }
}

/// Best-effort cluster broadcast transport
#[async_trait]
pub trait ClusterBroadcaster: Send + Sync {
    async fn start(&self) -> Result<()>;

    /// Send to every peer. Returns the number of receivers reached.
    async fn send(&self, message: ClusterMessage) -> Result<usize>;

    fn subscribe(&self) -> broadcast::Receiver<ClusterMessage>;

    async fn stop(&self) -> Result<()>;
}

/// In-process broadcast bus. Clones share the same bus, so several nodes in
/// one process see each other's messages.
#[derive(Debug, Clone)]
pub struct LocalPubSub {
    sender: broadcast::Sender<ClusterMessage>,
    running: Arc<AtomicBool>,
}

impl LocalPubSub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A handle on the same bus with its own lifecycle.
    pub fn attach(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for LocalPubSub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl ClusterBroadcaster for LocalPubSub {
    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!("Local pub/sub started");
        Ok(())
    }

    async fn send(&self, message: ClusterMessage) -> Result<usize> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::Broadcast("broadcaster not running".to_string()));
        }
        match self.sender.send(message) {
            Ok(n) => Ok(n),
            Err(_) => {
                debug!("No pub/sub receivers");
                Ok(0)
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ClusterMessage> {
        self.sender.subscribe()
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        info!("Local pub/sub stopped");
        Ok(())
    }
}
