//! Coordination store client
//!
//! The coordination store is an etcd-style key/value service holding sticky
//! stream assignments and instance presence records. Only the operations the
//! cluster needs are abstracted here.

use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

/// Key prefix for sticky stream assignments
pub const STICKY_PREFIX: &str = "home/dockerloginstance/";

/// Coordination-store key holding the sticky owner of `stream_key`.
pub fn sticky_key(stream_key: &str) -> String {
    format!("{STICKY_PREFIX}{stream_key}")
}

/// Key/value coordination backend
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn put(&self, key: &str, value: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`, ordered by key.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;
}

/// In-process coordination store for single-node deployments and tests.
///
/// It can be switched to an unavailable state to exercise the fallback paths.
#[derive(Debug, Default)]
pub struct MemoryCoordinationStore {
    entries: RwLock<BTreeMap<String, String>>,
    unavailable: AtomicBool,
}

impl MemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Coordination("store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        self.entries.write().remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        self.check()?;
        Ok(self
            .entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Run `op` with a per-attempt timeout, retrying up to `attempts` times.
pub async fn with_retry<T, F, Fut>(
    what: &'static str,
    attempts: usize,
    timeout: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 1..=attempts.max(1) {
        let outcome = tokio::time::timeout(timeout, op())
            .await
            .map_err(Error::from)
            .and_then(|result| result);
        match outcome {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(
                    op = what,
                    attempt,
                    timeout_ms = timeout.as_millis() as u64,
                    error = %e,
                    "Coordination call failed"
                );
            }
        }
        if attempt < attempts {
            tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
        }
    }
    Err(Error::TooManyRetries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_prefix_listing() {
        let store = MemoryCoordinationStore::new();
        store.put(&sticky_key("svc-1"), "node-a").await.unwrap();
        store.put(&sticky_key("svc-2"), "node-b").await.unwrap();
        store.put("other/key", "x").await.unwrap();

        let sticky = store.list_prefix(STICKY_PREFIX).await.unwrap();
        assert_eq!(sticky.len(), 2);
        assert_eq!(sticky[0].0, "home/dockerloginstance/svc-1");
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = MemoryCoordinationStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get("k").await,
            Err(Error::Coordination(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_budget() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<()> = with_retry("probe", 3, Duration::from_millis(100), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Coordination("down".to_string()))
        })
        .await;
        assert!(matches!(result, Err(Error::TooManyRetries)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let ok = with_retry("probe", 3, Duration::from_millis(100), || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(ok, 7);
    }

    #[tokio::test]
    async fn test_slow_call_times_out_each_attempt() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<()> = with_retry("probe", 2, Duration::from_millis(20), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::TooManyRetries)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_elapsed_maps_to_timeout() {
        let elapsed = tokio::time::timeout(
            Duration::from_millis(1),
            tokio::time::sleep(Duration::from_secs(1)),
        )
        .await
        .unwrap_err();
        assert!(matches!(Error::from(elapsed), Error::Timeout));
    }
}
