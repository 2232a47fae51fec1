//! Shared utility functions.

use std::future::Future;
use std::time::{Duration, SystemTime};

use tokio::task::spawn_blocking;

use crate::{hlog_warn, Error, Result};

pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Bounded retry schedule for shared-medium I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// No retries and no sleeping; useful for tests and one-shot tools.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run a medium operation, retrying transient I/O errors with exponential
/// backoff. Exhaustion is reported as `Error::Medium`; non-I/O errors are
/// returned immediately.
pub async fn retry_io<F, Fut, T>(
    policy: &RetryPolicy,
    operation: &str,
    key: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient_io() && attempts <= policy.max_retries => {
                let delay = policy.backoff(attempts) + jitter(policy.base_delay);
                hlog_warn!(
                    "{} {} failed (attempt {}): {}; retrying in {:?}",
                    operation,
                    key,
                    attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_transient_io() => {
                return Err(Error::Medium {
                    operation: operation.to_string(),
                    key: key.to_string(),
                    attempts,
                    message: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }
}

/// Up to half of `base` worth of jitter, seeded from the clock.
fn jitter(base: Duration) -> Duration {
    let span = (base.as_millis() as u64) / 2;
    if span == 0 {
        return Duration::ZERO;
    }
    let seed = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    Duration::from_millis(seed % span)
}
