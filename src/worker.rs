//! Reference worker: the worker-side half of the handshake.
//!
//! Polls `pending/` for descriptors addressed to its provider, claims each
//! with an exclusive `claims/<task_id>.claim`, runs the handler, and writes
//! the artifact atomically to `results/`. Claims are left in place after the
//! work is done so the same task is never processed twice; the sweeper
//! removes them once the descriptor is gone.
//!
//! With `verify_before_commit` the worker re-checks, right before writing,
//! that the descriptor still exists and its deadline has not passed, and
//! drops the result otherwise. This narrows the ghost-result window from the
//! worker side; the orchestrator never relies on it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{ResultArtifact, TaskDescriptor, TaskId};
use crate::medium::{keys, ChangeKind, ChangeWaiter, Medium, Namespace, WaitOutcome};
use crate::{hlog, hlog_debug, hlog_error, hlog_warn, Result};

const WORKER_INTERVAL: Duration = Duration::from_millis(500);

/// The actual inference work. `Ok` carries the output payload reference,
/// `Err` a failure message for the artifact.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, descriptor: &TaskDescriptor) -> std::result::Result<String, String>;
}

/// Handler that answers after a fixed delay, echoing the payload reference.
#[derive(Debug, Clone, Default)]
pub struct EchoHandler {
    pub delay: Duration,
    pub fail: bool,
}

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, descriptor: &TaskDescriptor) -> std::result::Result<String, String> {
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(format!("{} refused {}", descriptor.provider, descriptor.payload_ref));
        }
        Ok(format!("{}.{}.out", descriptor.payload_ref, descriptor.provider))
    }
}

/// Marker written to `claims/` by the worker that took a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub task_id: TaskId,
    pub worker: String,
    pub claimed_at: DateTime<Utc>,
}

/// What happened to one claimed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// An artifact was written (`ok` or `error`).
    Committed { task_id: TaskId, ok: bool },
    /// The orchestrator moved on; nothing was written.
    Aborted { task_id: TaskId, reason: String },
}

pub struct Worker {
    medium: Arc<dyn Medium>,
    provider: String,
    handler: Arc<dyn TaskHandler>,
    worker_id: String,
    interval: Duration,
    verify_before_commit: bool,
}

impl Worker {
    pub fn new(medium: Arc<dyn Medium>, provider: &str, handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            medium,
            provider: provider.to_string(),
            handler,
            worker_id: format!("{}@{}", provider, std::process::id()),
            interval: WORKER_INTERVAL,
            verify_before_commit: true,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_verify_before_commit(mut self, verify: bool) -> Self {
        self.verify_before_commit = verify;
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// One scan of `pending/`: claim and process every task for our provider.
    pub async fn run_once(&self) -> Result<Vec<TaskOutcome>> {
        let mut outcomes = Vec::new();
        for key in self.medium.list(&Namespace::Pending.prefix()).await? {
            let Some(bytes) = self.medium.get(&key).await? else {
                continue;
            };
            let descriptor = match TaskDescriptor::from_bytes(&bytes) {
                Ok(d) => d,
                Err(e) => {
                    hlog_warn!("Skipping unreadable descriptor {}: {}", key, e);
                    continue;
                }
            };
            if descriptor.provider != self.provider {
                continue;
            }
            if let Some(outcome) = self.process(&descriptor).await? {
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }

    async fn process(&self, descriptor: &TaskDescriptor) -> Result<Option<TaskOutcome>> {
        let task_id = descriptor.task_id;
        if self.medium.get(&keys::result(&task_id)).await?.is_some() {
            return Ok(None);
        }
        let claim = Claim {
            task_id,
            worker: self.worker_id.clone(),
            claimed_at: Utc::now(),
        };
        if !self
            .medium
            .create(&keys::claim(&task_id), serde_json::to_vec(&claim)?)
            .await?
        {
            // Someone else has it.
            return Ok(None);
        }

        if self.verify_before_commit && descriptor.is_expired() {
            return Ok(Some(self.aborted(task_id, "deadline passed before start")));
        }

        hlog!("{} processing task {}", self.worker_id, task_id.short());
        let artifact = match self.handler.handle(descriptor).await {
            Ok(payload_ref) => ResultArtifact::ok(task_id, &payload_ref),
            Err(message) => {
                hlog_warn!("Task {} failed: {}", task_id.short(), message);
                ResultArtifact::failed(task_id, &message)
            }
        };

        if self.verify_before_commit {
            if self.medium.get(&keys::pending(&task_id)).await?.is_none() {
                return Ok(Some(self.aborted(task_id, "descriptor withdrawn")));
            }
            if descriptor.is_expired() {
                return Ok(Some(self.aborted(task_id, "deadline passed")));
            }
        }

        self.medium
            .put(&keys::result(&task_id), artifact.to_bytes()?)
            .await?;
        hlog!(
            "Task {} committed ({})",
            task_id.short(),
            artifact.status
        );
        Ok(Some(TaskOutcome::Committed {
            task_id,
            ok: artifact.is_ok(),
        }))
    }

    fn aborted(&self, task_id: TaskId, reason: &str) -> TaskOutcome {
        hlog!("Task {} aborted: {}", task_id.short(), reason);
        TaskOutcome::Aborted {
            task_id,
            reason: reason.to_string(),
        }
    }

    /// Run the scan loop in the background until the handle is shut down.
    pub fn spawn(self) -> WorkerHandle {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        hlog_debug!("Worker::spawn provider={}", self.provider);

        let join = tokio::spawn(async move {
            let mut waiter = ChangeWaiter::new(self.medium.as_ref(), self.interval);
            loop {
                if let Err(e) = self.run_once().await {
                    hlog_error!("Worker {} scan failed: {}", self.worker_id, e);
                }
                let outcome = waiter
                    .wait(self.interval, &cancel_clone, |event| {
                        event.kind == ChangeKind::Written && event.key.starts_with("pending/")
                    })
                    .await;
                if outcome == WaitOutcome::Cancelled {
                    hlog_debug!("Worker {} cancelled", self.worker_id);
                    break;
                }
            }
        });

        WorkerHandle { cancel, join }
    }
}

/// Handle to a running worker loop.
pub struct WorkerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Shut down and wait for the loop to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            hlog_error!("Worker task ended abnormally: {}", e);
        }
    }
}
