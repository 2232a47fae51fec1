//! Shared medium abstraction.
//!
//! Orchestrator and workers share no memory; every interaction is a named
//! blob on a medium both sides can see. The contract is small:
//! - `put` publishes atomically (readers see the old blob, the new blob, or
//!   nothing; never a partial write)
//! - `create` is an atomic exclusive create
//! - `compare_and_swap` replaces or deletes a blob only if it still holds
//!   the expected bytes
//! - `subscribe` optionally delivers change notifications; polling stays
//!   the correctness baseline
//!
//! Keys are `"<namespace>/<name>"`. See [`keys`] for the layout.

mod fs;
pub mod keys;
mod memory;
mod retry;
mod watch;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::Result;

pub use fs::FsMedium;
pub use memory::MemoryMedium;
pub use retry::RetryingMedium;
pub use watch::{ChangeWaiter, WaitOutcome};

/// Directory roles on the shared medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Published task descriptors.
    Pending,
    /// Worker result artifacts.
    Results,
    /// Lock tokens and queue tickets.
    Locks,
    /// Worker claim markers.
    Claims,
    /// Persisted ledger entries.
    Ledger,
    /// Archived (terminal, observed) ledger entries.
    Archive,
}

impl Namespace {
    pub const ALL: [Namespace; 6] = [
        Namespace::Pending,
        Namespace::Results,
        Namespace::Locks,
        Namespace::Claims,
        Namespace::Ledger,
        Namespace::Archive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Pending => "pending",
            Namespace::Results => "results",
            Namespace::Locks => "locks",
            Namespace::Claims => "claims",
            Namespace::Ledger => "ledger",
            Namespace::Archive => "archive",
        }
    }

    /// Prefix that lists every key in this namespace.
    pub fn prefix(&self) -> String {
        format!("{}/", self.as_str())
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Written,
    Removed,
}

/// Change notification delivered by backends that support it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediumEvent {
    pub key: String,
    pub kind: ChangeKind,
}

/// Storage contract for the shared medium.
///
/// All backends (filesystem, memory) implement this trait.
#[async_trait]
pub trait Medium: Send + Sync + 'static {
    /// Atomically publish `data` under `key`, replacing any previous blob.
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;

    /// Atomically create `key`. Returns `false` if it already exists.
    async fn create(&self, key: &str, data: Vec<u8>) -> Result<bool>;

    /// Read a blob. Returns `None` if it does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete a blob. Returns whether it existed. Idempotent.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// List keys starting with `prefix`, sorted ascending.
    ///
    /// The prefix must contain a namespace (`"locks/"`, `"locks/gpu.queue."`).
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Replace (`Some`) or delete (`None`) `key` only if it currently holds
    /// exactly `expected`. Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        new: Option<Vec<u8>>,
    ) -> Result<bool>;

    /// Subscribe to change notifications, if the backend supports them.
    fn subscribe(&self) -> Option<broadcast::Receiver<MediumEvent>> {
        None
    }
}
