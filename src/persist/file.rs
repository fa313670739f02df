//! Raw per-stream log files (`file` persister)

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
use tracing::debug;

const FILE_SUFFIX: &str = ".log";

/// Appends one rendered line per envelope to `<dir>/<key>.log`.
pub struct FilePersister {
    dir: PathBuf,
    /// Serializes appends per key across concurrent callers
    key_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FilePersister {
    /// Open the persister, creating the base directory if needed.
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

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl MessagePersister for FilePersister {
    async fn save_message(&self, envelopes: &[Arc<MessageEnvelope>]) -> Result<()> {
        // BTreeMap keeps the write order deterministic; per-key order is preserved.
        let mut by_key: BTreeMap<&str, String> = BTreeMap::new();
        for env in envelopes {
            let buf = by_key.entry(env.stream_key.as_str()).or_default();
            buf.push_str(&env.render().replace('\n', " "));
            buf.push('\n');
        }

        for (key, lines) in by_key {
            let lock = self.lock_for(key);
            let _guard = lock.lock().await;
            let path = self.path_for(key);
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(lines.as_bytes()).await?;
            file.flush().await?;
            debug!(key = %key, path = ?path, "Appended log lines");
        }
        Ok(())
    }

    async fn get_messages(
        &self,
        key: &str,
        _level: Option<Level>,
        length: usize,
    ) -> Result<Vec<String>> {
        let raw = match fs::read_to_string(self.path_for(key)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let lines = raw.lines().map(str::to_string).collect();
        Ok(tail(lines, length))
    }

    async fn close(&self) -> Result<()> {
        self.key_locks.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let persister = FilePersister::open(dir.path()).unwrap();

        let batch: Vec<_> = (0..5)
            .map(|i| Arc::new(MessageEnvelope::with_content("svc-a", format!("line {i}"))))
            .collect();
        persister.save_message(&batch[..3]).await.unwrap();
        persister.save_message(&batch[3..]).await.unwrap();

        let all = persister.get_messages("svc-a", None, 0).await.unwrap();
        assert_eq!(all, vec!["line 0", "line 1", "line 2", "line 3", "line 4"]);

        let last_two = persister.get_messages("svc-a", None, 2).await.unwrap();
        assert_eq!(last_two, vec!["line 3", "line 4"]);
    }

    #[tokio::test]
    async fn test_missing_key_is_empty() {
        let dir = TempDir::new().unwrap();
        let persister = FilePersister::open(dir.path()).unwrap();
        assert!(persister
            .get_messages("nothing", None, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_mixed_keys_split_files() {
        let dir = TempDir::new().unwrap();
        let persister = FilePersister::open(dir.path()).unwrap();
        let batch = vec![
            Arc::new(MessageEnvelope::with_content("a", "a1")),
            Arc::new(MessageEnvelope::with_content("b", "b1")),
            Arc::new(MessageEnvelope::with_content("a", "a2")),
        ];
        persister.save_message(&batch).await.unwrap();

        assert_eq!(
            persister.get_messages("a", None, 0).await.unwrap(),
            vec!["a1", "a2"]
        );
        assert_eq!(persister.get_messages("b", None, 0).await.unwrap(), vec!["b1"]);
    }
}
