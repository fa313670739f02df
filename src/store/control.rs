//! Bounded control queue for persist-now and finalize operations.
//!
//! Control operations are requested on the insert path and executed by the
//! owning store's run loop. Submission never blocks: a full queue drops the
//! operation with a warning.

use crate::store::telemetry;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOp {
    /// Write the key's persistence sub-buffer now
    Persist { key: String },
    /// Record the terminal status of an operation event
    Finalize {
        event_id: String,
        status: String,
        message: String,
    },
}

impl ControlOp {
    pub fn name(&self) -> &'static str {
        match self {
            ControlOp::Persist { .. } => "persist",
            ControlOp::Finalize { .. } => "finalize",
        }
    }
}

/// Sending half of a control queue.
#[derive(Debug, Clone)]
pub struct ControlQueue {
    tx: mpsc::Sender<ControlOp>,
}

impl ControlQueue {
    /// Create a queue with room for `capacity` pending operations.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ControlOp>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue without waiting. Returns false when the operation was dropped.
    pub fn submit(&self, op: ControlOp) -> bool {
        match self.tx.try_send(op) {
            Ok(()) => true,
            Err(TrySendError::Full(op)) => {
                telemetry::record_control_drop(op.name());
                warn!(op = op.name(), "Control queue full, dropping operation");
                false
            }
            Err(TrySendError::Closed(op)) => {
                telemetry::record_control_drop(op.name());
                warn!(op = op.name(), "Control queue closed, dropping operation");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_queue_drops() {
        let (queue, mut rx) = ControlQueue::channel(1);
        assert!(queue.submit(ControlOp::Persist { key: "a".into() }));
        assert!(!queue.submit(ControlOp::Persist { key: "b".into() }));
        assert_eq!(
            rx.try_recv().unwrap(),
            ControlOp::Persist { key: "a".into() }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_queue_drops() {
        let (queue, rx) = ControlQueue::channel(4);
        drop(rx);
        assert!(!queue.submit(ControlOp::Finalize {
            event_id: "e".into(),
            status: "success".into(),
            message: String::new(),
        }));
    }
}
