//! Structured per-event log files (`eventfile` persister)

use super::{sanitize_key, tail, MessagePersister};
use crate::message::{Level, MessageEnvelope};
use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

const FILE_SUFFIX: &str = ".event.jsonl";

/// Writes each envelope as a JSON line so history can be filtered by level.
pub struct EventFilePersister {
    dir: PathBuf,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl EventFilePersister {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            key_locks: DashMap::new(),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}", sanitize_key(key), FILE_SUFFIX))
    }
}

#[async_trait]
impl MessagePersister for EventFilePersister {
    async fn save_message(&self, envelopes: &[Arc<MessageEnvelope>]) -> Result<()> {
        let mut by_key: BTreeMap<&str, Vec<u8>> = BTreeMap::new();
        for env in envelopes {
            let buf = by_key.entry(env.stream_key.as_str()).or_default();
            serde_json::to_writer(&mut *buf, &**env)?;
            buf.push(b'\n');
        }

        for (key, payload) in by_key {
            let lock = self
                .key_locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            let _guard = lock.lock().await;
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path_for(key))
                .await?;
            file.write_all(&payload).await?;
            file.flush().await?;
        }
        Ok(())
    }

    /// Lines at or above `level` are returned; `None` returns every level.
    async fn get_messages(
        &self,
        key: &str,
        level: Option<Level>,
        length: usize,
    ) -> Result<Vec<String>> {
        let raw = match fs::read_to_string(self.path_for(key)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut lines = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let env: MessageEnvelope = match serde_json::from_str(line) {
                Ok(env) => env,
                Err(e) => {
                    warn!(key = %key, line = idx, error = %e, "Skipping unreadable event line");
                    continue;
                }
            };
            if level.map_or(true, |min| env.level >= min) {
                lines.push(env.render());
            }
        }
        Ok(tail(lines, length))
    }

    async fn close(&self) -> Result<()> {
        self.key_locks.clear();
        Ok(())
    }
}
