//! Request-level timeouts for store calls

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::{KeyValueStore, StoreError};

/// Wraps a store so that no call can block longer than `timeout`
pub struct TimeoutStore {
    inner: Arc<dyn KeyValueStore>,
    timeout: Duration,
}

impl TimeoutStore {
    pub fn new(inner: Arc<dyn KeyValueStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                let after_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(op, after_ms, "Store call timed out");
                Err(StoreError::Timeout { op, after_ms })
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for TimeoutStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.bounded("get", self.inner.get(key)).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.bounded("set", self.inner.set_with_ttl(key, value, ttl))
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.bounded("delete", self.inner.delete(key)).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
    ) -> Result<bool, StoreError> {
        self.bounded("compare_and_swap", self.inner.compare_and_swap(key, expected, new))
            .await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.bounded("compare_and_delete", self.inner.compare_and_delete(key, expected))
            .await
    }

    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        self.bounded("increment", self.inner.increment_with_ttl(key, ttl))
            .await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        self.bounded("ttl", self.inner.ttl(key)).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.bounded("scan", self.inner.scan_prefix(prefix)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryStore;

    /// Store whose reads never complete
    struct StalledStore;

    #[async_trait]
    impl KeyValueStore for StalledStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            std::future::pending().await
        }
        async fn set_with_ttl(&self, _: &str, _: &str, _: Duration) -> Result<(), StoreError> {
            Ok(())
        }
        async fn delete(&self, _: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn compare_and_swap(&self, _: &str, _: &str, _: &str) -> Result<bool, StoreError> {
            std::future::pending().await
        }
        async fn compare_and_delete(&self, _: &str, _: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn increment_with_ttl(&self, _: &str, _: Duration) -> Result<u64, StoreError> {
            Ok(1)
        }
        async fn ttl(&self, _: &str) -> Result<Option<Duration>, StoreError> {
            Ok(None)
        }
        async fn scan_prefix(&self, _: &str) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_stalled_call_times_out() {
        let store = TimeoutStore::new(Arc::new(StalledStore), Duration::from_millis(20));

        let result = store.get("k").await;
        assert!(matches!(
            result,
            Err(StoreError::Timeout { op: "get", after_ms: 20 })
        ));
        assert!(store.delete("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_passes_through() {
        let store = TimeoutStore::new(Arc::new(InMemoryStore::new()), Duration::from_secs(1));
        store
            .set_with_ttl("k", "v", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
