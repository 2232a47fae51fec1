//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Opening in-memory and filesystem media
//! - Building coordinators and dispatchers with fast timings
//! - Running reference workers with scripted behavior
//! - Watching `pending/` for the one-live-descriptor invariant

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use handoff::core::{RequestId, TaskDescriptor};
use handoff::ledger::Ledger;
use handoff::medium::{FsMedium, Medium, MemoryMedium, Namespace};
use handoff::orchestration::{
    Coordinator, DispatchEvent, DispatchSettings, FallbackDispatcher, PolicyTable, Provider,
    ProviderChain,
};
use handoff::util::RetryPolicy;
use handoff::worker::{TaskHandler, Worker, WorkerHandle};

pub const POLL: Duration = Duration::from_millis(10);

/// A medium plus whatever keeps it alive (the temp dir for `FsMedium`).
pub struct TestMedium {
    pub medium: Arc<dyn Medium>,
    _dir: Option<TempDir>,
}

impl TestMedium {
    pub fn memory() -> Self {
        Self {
            medium: Arc::new(MemoryMedium::new()),
            _dir: None,
        }
    }

    /// Filesystem medium in a fresh temp dir, polling only.
    pub fn fs() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let medium = FsMedium::open(dir.path()).expect("Failed to open medium");
        Self {
            medium: Arc::new(medium),
            _dir: Some(dir),
        }
    }

    /// Both backends, for tests that must hold on either.
    pub fn both() -> Vec<Self> {
        vec![Self::memory(), Self::fs()]
    }

    pub async fn count(&self, ns: Namespace) -> usize {
        self.medium.list(&ns.prefix()).await.expect("list").len()
    }
}

pub fn settings() -> DispatchSettings {
    DispatchSettings {
        poll_interval: POLL,
        resource_id: "accelerator".to_string(),
        lease_ttl: Duration::from_secs(10),
        acquire_timeout: Duration::from_secs(3),
        ticket_ttl: Duration::from_secs(1),
        retry: RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        },
    }
}

pub fn rid(s: &str) -> RequestId {
    RequestId::parse(s).expect("valid request id")
}

/// A dispatcher over `medium` plus its event stream.
pub fn dispatcher(
    medium: &Arc<dyn Medium>,
    policy: PolicyTable,
) -> (FallbackDispatcher, mpsc::UnboundedReceiver<DispatchEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let coordinator =
        Coordinator::new(medium.clone(), Arc::new(Ledger::new()), settings()).with_events(tx);
    (FallbackDispatcher::new(Arc::new(coordinator), policy), rx)
}

/// Policy with one capability served by `primary` then optionally `secondary`.
pub fn policy(primary: Provider, secondary: Option<Provider>) -> PolicyTable {
    let mut table = PolicyTable::new();
    table.insert(ProviderChain { primary, secondary });
    table
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<DispatchEvent>) -> Vec<DispatchEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Handler with a fixed delay and outcome that counts its calls and how
/// many of them ever ran at once.
#[derive(Default)]
pub struct ScriptedHandler {
    pub delay: Duration,
    pub fail: bool,
    pub calls: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedHandler {
    pub fn answering_after(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Default::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for ScriptedHandler {
    async fn handle(&self, descriptor: &TaskDescriptor) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        if self.fail {
            Err(format!("{} crashed", descriptor.provider))
        } else {
            Ok(format!("/out/{}.{}.wav", descriptor.task_id, descriptor.provider))
        }
    }
}

/// Start a reference worker for `provider`.
pub fn start_worker(
    medium: &Arc<dyn Medium>,
    provider: &str,
    handler: Arc<ScriptedHandler>,
    verify_before_commit: bool,
) -> WorkerHandle {
    Worker::new(medium.clone(), provider, handler)
        .with_interval(POLL)
        .with_verify_before_commit(verify_before_commit)
        .spawn()
}

/// Samples `pending/` until stopped, remembering the largest count seen.
pub struct PendingMonitor {
    stop: Arc<AtomicBool>,
    max_seen: Arc<AtomicUsize>,
    join: tokio::task::JoinHandle<()>,
}

impl PendingMonitor {
    pub fn start(medium: &Arc<dyn Medium>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let join = {
            let (medium, stop, max_seen) = (medium.clone(), stop.clone(), max_seen.clone());
            tokio::spawn(async move {
                while !stop.load(Ordering::SeqCst) {
                    if let Ok(keys) = medium.list(&Namespace::Pending.prefix()).await {
                        max_seen.fetch_max(keys.len(), Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        };
        Self {
            stop,
            max_seen,
            join,
        }
    }

    pub async fn finish(self) -> usize {
        self.stop.store(true, Ordering::SeqCst);
        self.join.await.expect("monitor task");
        self.max_seen.load(Ordering::SeqCst)
    }
}
