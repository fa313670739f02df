//! Terminal status sink for operation events

use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Final state recorded for an operation event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedEvent {
    pub event_id: String,
    pub status: String,
    pub message: String,
}

/// Backing datastore that records the terminal status of an operation event.
#[async_trait]
pub trait EventStatusSink: Send + Sync {
    async fn finalize(&self, event_id: &str, status: &str, message: &str) -> Result<()>;
}

/// In-memory status sink for development and tests
#[derive(Debug, Default)]
pub struct MemoryStatusSink {
    events: RwLock<HashMap<String, FinalizedEvent>>,
}

impl MemoryStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, event_id: &str) -> Option<FinalizedEvent> {
        self.events.read().get(event_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

#[async_trait]
impl EventStatusSink for MemoryStatusSink {
    async fn finalize(&self, event_id: &str, status: &str, message: &str) -> Result<()> {
        self.events.write().insert(
            event_id.to_string(),
            FinalizedEvent {
                event_id: event_id.to_string(),
                status: status.to_string(),
                message: message.to_string(),
            },
        );
        Ok(())
    }
}
