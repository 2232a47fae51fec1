use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{Medium, MediumEvent};
use crate::util::{retry_io, RetryPolicy};
use crate::Result;

/// Wraps a medium so every operation retries transient I/O errors.
///
/// Exhausted retries surface as `Error::Medium`, which callers report as an
/// infrastructure failure rather than a timeout.
pub struct RetryingMedium {
    inner: Arc<dyn Medium>,
    policy: RetryPolicy,
}

impl RetryingMedium {
    pub fn new(inner: Arc<dyn Medium>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl Medium for RetryingMedium {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        retry_io(&self.policy, "put", key, || self.inner.put(key, data.clone())).await
    }

    async fn create(&self, key: &str, data: Vec<u8>) -> Result<bool> {
        retry_io(&self.policy, "create", key, || self.inner.create(key, data.clone())).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        retry_io(&self.policy, "get", key, || self.inner.get(key)).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        retry_io(&self.policy, "delete", key, || self.inner.delete(key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        retry_io(&self.policy, "list", prefix, || self.inner.list(prefix)).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        new: Option<Vec<u8>>,
    ) -> Result<bool> {
        retry_io(&self.policy, "compare_and_swap", key, || {
            self.inner.compare_and_swap(key, expected, new.clone())
        })
        .await
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<MediumEvent>> {
        self.inner.subscribe()
    }
}
