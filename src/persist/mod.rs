//! Persistence plugins
//!
//! Durable sinks invoked by the stores before a barrel is evicted or on a
//! periodic flush. Implementations must be safe to call concurrently for
//! different keys; ordering is only required within one key (append-only).

mod event_file;
mod file;
mod status;

pub use event_file::EventFilePersister;
pub use file::FilePersister;
pub use status::{EventStatusSink, FinalizedEvent, MemoryStatusSink};

use crate::message::{Level, MessageEnvelope};
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Durable sink for evicted or flushed envelopes
#[async_trait]
pub trait MessagePersister: Send + Sync {
    /// Append envelopes. Envelopes for one key arrive in insertion order.
    async fn save_message(&self, envelopes: &[Arc<MessageEnvelope>]) -> Result<()>;

    /// Read the newest `length` rendered lines for `key`, oldest first.
    async fn get_messages(
        &self,
        key: &str,
        level: Option<Level>,
        length: usize,
    ) -> Result<Vec<String>>;

    /// Flush and release resources.
    async fn close(&self) -> Result<()>;
}

/// Persistence backend selectable by configuration name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersisterKind {
    /// Raw per-stream log lines
    File,
    /// Structured per-event JSON lines
    EventFile,
}

impl PersisterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::EventFile => "eventfile",
        }
    }

    /// Open the backend rooted at `dir`.
    pub fn open(&self, dir: &Path) -> Result<Arc<dyn MessagePersister>> {
        Ok(match self {
            Self::File => Arc::new(FilePersister::open(dir)?),
            Self::EventFile => Arc::new(EventFilePersister::open(dir)?),
        })
    }
}

impl std::str::FromStr for PersisterKind {
    type Err = Error;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "eventfile" => Ok(Self::EventFile),
            other => Err(Error::UnknownPersister(other.to_string())),
        }
    }
}

/// Map a stream key to a file name that cannot escape the base directory.
pub(crate) fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

/// Keep only the newest `length` items. A zero length keeps everything.
pub(crate) fn tail<T>(mut items: Vec<T>, length: usize) -> Vec<T> {
    if length > 0 && items.len() > length {
        items.drain(..items.len() - length);
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_str() {
        assert_eq!("file".parse::<PersisterKind>().unwrap(), PersisterKind::File);
        assert_eq!(
            "EventFile".parse::<PersisterKind>().unwrap(),
            PersisterKind::EventFile
        );
        let err = "mysql".parse::<PersisterKind>().unwrap_err();
        assert!(format!("{err}").contains("mysql"));
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_key("evt-123_a"), "evt-123_a");
    }

    #[test]
    fn test_tail() {
        assert_eq!(tail(vec![1, 2, 3, 4], 2), vec![3, 4]);
        assert_eq!(tail(vec![1, 2], 5), vec![1, 2]);
        assert_eq!(tail(vec![1, 2], 0), vec![1, 2]);
    }
}
