//! In-memory shared medium for tests and single-process use.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{ChangeKind, Medium, MediumEvent};
use crate::{Error, Result};

const EVENT_CAPACITY: usize = 1024;

/// Thread-safe map of blobs with change notifications.
///
/// `fail_next` makes the next operations fail with an I/O error, which is how
/// tests drive the medium-failure paths.
#[derive(Debug)]
pub struct MemoryMedium {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
    events: broadcast::Sender<MediumEvent>,
    failures: AtomicU32,
}

impl Default for MemoryMedium {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMedium {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            blobs: Mutex::new(BTreeMap::new()),
            events,
            failures: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` operations with a transient I/O error.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_fault(&self, operation: &str, key: &str) -> Result<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("injected failure: {} {}", operation, key),
            )));
        }
        Ok(())
    }

    fn blobs(&self) -> Result<MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.blobs
            .lock()
            .map_err(|_| Error::Validation("memory medium lock poisoned".to_string()))
    }

    fn notify(&self, key: &str, kind: ChangeKind) {
        let _ = self.events.send(MediumEvent {
            key: key.to_string(),
            kind,
        });
    }
}

#[async_trait]
impl Medium for MemoryMedium {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.check_fault("put", key)?;
        self.blobs()?.insert(key.to_string(), data);
        self.notify(key, ChangeKind::Written);
        Ok(())
    }

    async fn create(&self, key: &str, data: Vec<u8>) -> Result<bool> {
        self.check_fault("create", key)?;
        {
            let mut blobs = self.blobs()?;
            if blobs.contains_key(key) {
                return Ok(false);
            }
            blobs.insert(key.to_string(), data);
        }
        self.notify(key, ChangeKind::Written);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_fault("get", key)?;
        Ok(self.blobs()?.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_fault("delete", key)?;
        let existed = self.blobs()?.remove(key).is_some();
        if existed {
            self.notify(key, ChangeKind::Removed);
        }
        Ok(existed)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_fault("list", prefix)?;
        Ok(self
            .blobs()?
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        new: Option<Vec<u8>>,
    ) -> Result<bool> {
        self.check_fault("compare_and_swap", key)?;
        let kind = {
            let mut blobs = self.blobs()?;
            if blobs.get(key).map(Vec::as_slice) != Some(expected) {
                return Ok(false);
            }
            match new {
                Some(data) => {
                    blobs.insert(key.to_string(), data);
                    ChangeKind::Written
                }
                None => {
                    blobs.remove(key);
                    ChangeKind::Removed
                }
            }
        };
        self.notify(key, kind);
        Ok(true)
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<MediumEvent>> {
        Some(self.events.subscribe())
    }
}
