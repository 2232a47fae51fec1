//! Handshake Coordinator: publish a descriptor, await its artifact.
//!
//! One attempt looks like this:
//!
//! ```text
//! begin_attempt (ledger CAS, one live task per request)
//!   -> [AWAITING_LOCK -> acquire accelerator]
//!   -> put pending/<task>.task
//!   -> poll results/<task>.result until the deadline
//!        (renewing the lease, discarding ghosts of abandoned tasks)
//!   -> on deadline: delete descriptor, re-check once, else ABANDONED
//!   -> release accelerator
//! ```
//!
//! Deadlines are enforced here with the orchestrator's clock; nothing waits
//! on a worker behaving well.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::events::DispatchEvent;
use super::policy::Provider;
use crate::config::Config;
use crate::core::{RequestId, ResultArtifact, TaskDescriptor, TaskId};
use crate::ledger::{AttemptOutcome, Ledger, RequestState};
use crate::lock::{HardwareLock, LockToken};
use crate::medium::{keys, ChangeKind, ChangeWaiter, Medium, RetryingMedium, WaitOutcome};
use crate::util::RetryPolicy;
use crate::{hlog, hlog_debug, hlog_error, hlog_warn, Error, Result};

/// Timing and lock parameters for dispatch flows.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub poll_interval: Duration,
    pub resource_id: String,
    pub lease_ttl: Duration,
    pub acquire_timeout: Duration,
    pub ticket_ttl: Duration,
    pub retry: RetryPolicy,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            resource_id: config.lock.resource_id.clone(),
            lease_ttl: config.lease_ttl(),
            acquire_timeout: config.acquire_timeout(),
            ticket_ttl: config.ticket_ttl(),
            retry: RetryPolicy {
                max_retries: config.coordinator.io_retries,
                base_delay: Duration::from_millis(config.coordinator.io_backoff_ms),
                max_delay: Duration::from_millis(config.coordinator.io_backoff_max_ms),
            },
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Which half of a logical request an attempt serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Primary,
    Fallback,
}

impl Phase {
    /// (state the attempt starts from, state while the task is live)
    fn states(&self) -> (RequestState, RequestState) {
        match self {
            Phase::Primary => (RequestState::Pending, RequestState::Dispatched),
            Phase::Fallback => (
                RequestState::FallbackDispatched,
                RequestState::FallbackDispatched,
            ),
        }
    }
}

pub struct Coordinator {
    medium: Arc<dyn Medium>,
    ledger: Arc<Ledger>,
    lock: HardwareLock,
    settings: DispatchSettings,
    events: Option<mpsc::UnboundedSender<DispatchEvent>>,
}

impl Coordinator {
    /// All medium access goes through bounded retry per `settings.retry`.
    pub fn new(medium: Arc<dyn Medium>, ledger: Arc<Ledger>, settings: DispatchSettings) -> Self {
        let medium: Arc<dyn Medium> = Arc::new(RetryingMedium::new(medium, settings.retry));
        let lock = HardwareLock::new(medium.clone(), settings.poll_interval)
            .with_ticket_ttl(settings.ticket_ttl);
        Self {
            medium,
            ledger,
            lock,
            settings,
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<DispatchEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn lock(&self) -> &HardwareLock {
        &self.lock
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Run one primary attempt for `request_id`, creating its ledger entry
    /// if needed.
    pub async fn dispatch(
        &self,
        request_id: &RequestId,
        provider: &Provider,
        payload_ref: &str,
        deadline: Duration,
    ) -> Result<ResultArtifact> {
        let cancel = CancellationToken::new();
        self.dispatch_with_cancel(request_id, provider, payload_ref, deadline, &cancel)
            .await
    }

    pub async fn dispatch_with_cancel(
        &self,
        request_id: &RequestId,
        provider: &Provider,
        payload_ref: &str,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<ResultArtifact> {
        match self.ledger.get(request_id).await {
            Ok(_) => {}
            Err(Error::RequestNotFound(_)) => {
                self.ledger.create(request_id).await?;
            }
            Err(e) => return Err(e),
        }
        self.run_attempt(request_id, provider, payload_ref, deadline, Phase::Primary, cancel)
            .await
    }

    pub(crate) async fn run_attempt(
        &self,
        request_id: &RequestId,
        provider: &Provider,
        payload_ref: &str,
        deadline: Duration,
        phase: Phase,
        cancel: &CancellationToken,
    ) -> Result<ResultArtifact> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let (start, live) = phase.states();
        let mut descriptor =
            TaskDescriptor::new(&provider.capability, &provider.name, payload_ref, deadline);
        let task_id = descriptor.task_id;

        let mut token = None;
        if provider.requires_accelerator {
            self.ledger
                .begin_attempt(request_id, start, RequestState::AwaitingLock, task_id, &provider.name)
                .await?;
            token = Some(self.take_accelerator(request_id, task_id, cancel).await?);
            if let Err(e) = self
                .ledger
                .transition(request_id, RequestState::AwaitingLock, live)
                .await
            {
                self.release_accelerator(request_id, token.take()).await;
                self.end_quietly(request_id, task_id, RequestState::AwaitingLock, AttemptOutcome::MediumFailed)
                    .await;
                return Err(e);
            }
        } else {
            self.ledger
                .begin_attempt(request_id, start, live, task_id, &provider.name)
                .await?;
        }

        let result = self
            .handshake(request_id, &mut descriptor, live, deadline, &mut token, cancel)
            .await;
        self.release_accelerator(request_id, token).await;
        result
    }

    async fn take_accelerator(
        &self,
        request_id: &RequestId,
        task_id: TaskId,
        cancel: &CancellationToken,
    ) -> Result<LockToken> {
        let acquired = self
            .lock
            .acquire_with_cancel(
                &self.settings.resource_id,
                &task_id.to_string(),
                self.settings.lease_ttl,
                self.settings.acquire_timeout,
                cancel,
            )
            .await;
        match acquired {
            Ok(token) => {
                self.emit(DispatchEvent::LockAcquired {
                    request_id: request_id.clone(),
                    resource_id: token.resource_id.clone(),
                    generation: token.generation,
                });
                Ok(token)
            }
            Err(e) => {
                let outcome = match e {
                    Error::LockTimeout { .. } => AttemptOutcome::LockTimedOut,
                    Error::Cancelled => AttemptOutcome::Cancelled,
                    _ => AttemptOutcome::MediumFailed,
                };
                self.end_quietly(request_id, task_id, RequestState::AwaitingLock, outcome)
                    .await;
                Err(e)
            }
        }
    }

    async fn release_accelerator(&self, request_id: &RequestId, token: Option<LockToken>) {
        let Some(token) = token else {
            return;
        };
        match self.lock.release(&token).await {
            Ok(()) => self.emit(DispatchEvent::LockReleased {
                request_id: request_id.clone(),
                resource_id: token.resource_id,
            }),
            // The lease runs out on its own.
            Err(e) => hlog_error!("Failed to release {}: {}", token.resource_id, e),
        }
    }

    async fn handshake(
        &self,
        request_id: &RequestId,
        descriptor: &mut TaskDescriptor,
        live: RequestState,
        deadline: Duration,
        token: &mut Option<LockToken>,
        cancel: &CancellationToken,
    ) -> Result<ResultArtifact> {
        let task_id = descriptor.task_id;
        let pending_key = keys::pending(&task_id);
        let result_key = keys::result(&task_id);

        // The lock wait may have eaten into the deadline; both clocks start here.
        descriptor.restamp(deadline);
        let deadline_at = Instant::now() + deadline;
        let publish = match descriptor.to_bytes() {
            Ok(bytes) => self.medium.put(&pending_key, bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = publish {
            self.abort(request_id, task_id, live, AttemptOutcome::MediumFailed).await;
            return Err(e);
        }
        hlog!(
            "Published task {} for {} ({} / {}, deadline {:?})",
            task_id.short(),
            request_id,
            descriptor.capability,
            descriptor.provider,
            deadline
        );
        self.emit(DispatchEvent::Published {
            request_id: request_id.clone(),
            task_id,
            provider: descriptor.provider.clone(),
        });

        let mut waiter = ChangeWaiter::new(self.medium.as_ref(), self.settings.poll_interval);

        loop {
            self.discard_stale(request_id).await;

            match self.medium.get(&result_key).await {
                Ok(Some(bytes)) => {
                    return self.settle(request_id, descriptor, live, &bytes, false).await;
                }
                Ok(None) => {}
                Err(e) => {
                    self.abort(request_id, task_id, live, AttemptOutcome::MediumFailed).await;
                    return Err(e);
                }
            }

            let now = Instant::now();
            if now >= deadline_at {
                break;
            }
            let mut max = deadline_at - now;
            match self.keep_lease(token).await {
                Ok(Some(renew_in)) if !renew_in.is_zero() => max = max.min(renew_in),
                Ok(_) => {}
                Err(e) => {
                    // The worker may be on the accelerator without us holding it.
                    hlog_error!("{}; withdrawing task {}", e, task_id.short());
                    self.abort(request_id, task_id, live, AttemptOutcome::MediumFailed).await;
                    return Err(e);
                }
            }

            let outcome = waiter
                .wait(max, cancel, |event| {
                    event.key == result_key && event.kind == ChangeKind::Written
                })
                .await;
            if outcome == WaitOutcome::Cancelled {
                hlog!("Request {} cancelled; withdrawing task {}", request_id, task_id.short());
                self.abort(request_id, task_id, live, AttemptOutcome::Cancelled).await;
                return Err(Error::Cancelled);
            }
        }

        // Deadline passed: withdraw the descriptor, then look exactly once more.
        if let Err(e) = self.medium.delete(&pending_key).await {
            self.end_quietly(request_id, task_id, live, AttemptOutcome::MediumFailed).await;
            return Err(e);
        }
        match self.medium.get(&result_key).await {
            Ok(Some(bytes)) => return self.settle(request_id, descriptor, live, &bytes, true).await,
            Ok(None) => {}
            Err(e) => {
                self.end_quietly(request_id, task_id, live, AttemptOutcome::MediumFailed).await;
                return Err(e);
            }
        }

        self.ledger
            .end_attempt(request_id, task_id, live, RequestState::Abandoned, AttemptOutcome::TimedOut)
            .await?;
        hlog_warn!(
            "Task {} for {} abandoned: no answer from {} within {:?}",
            task_id.short(),
            request_id,
            descriptor.provider,
            deadline
        );
        self.emit(DispatchEvent::Abandoned {
            request_id: request_id.clone(),
            task_id,
        });
        Err(Error::Timeout { task_id, deadline })
    }

    /// Consume an artifact found for the live task.
    async fn settle(
        &self,
        request_id: &RequestId,
        descriptor: &TaskDescriptor,
        live: RequestState,
        bytes: &[u8],
        late: bool,
    ) -> Result<ResultArtifact> {
        let task_id = descriptor.task_id;
        // Descriptor first, so no worker picks the task up again.
        for key in [keys::pending(&task_id), keys::result(&task_id)] {
            if let Err(e) = self.medium.delete(&key).await {
                hlog_warn!("Failed to clean up {}: {}", key, e);
            }
        }

        let failure = match ResultArtifact::from_bytes(bytes) {
            Ok(artifact) if artifact.task_id != task_id => {
                format!("artifact under task {} answers task {}", task_id, artifact.task_id)
            }
            Ok(artifact) if artifact.is_ok() => {
                self.ledger
                    .end_attempt(
                        request_id,
                        task_id,
                        live,
                        RequestState::Completed,
                        AttemptOutcome::Succeeded,
                    )
                    .await?;
                if late {
                    hlog!("Late result for task {} honored", task_id.short());
                    self.emit(DispatchEvent::LateResultHonored {
                        request_id: request_id.clone(),
                        task_id,
                    });
                }
                hlog!(
                    "Request {} completed by {} (task {})",
                    request_id,
                    descriptor.provider,
                    task_id.short()
                );
                self.emit(DispatchEvent::Completed {
                    request_id: request_id.clone(),
                    task_id,
                });
                return Ok(artifact);
            }
            Ok(artifact) => artifact
                .error
                .unwrap_or_else(|| "worker reported failure".to_string()),
            Err(e) => format!("unreadable result: {}", e),
        };

        self.ledger
            .end_attempt(request_id, task_id, live, live, AttemptOutcome::ProviderFailed)
            .await?;
        hlog_warn!(
            "Provider {} failed task {}: {}",
            descriptor.provider,
            task_id.short(),
            failure
        );
        self.emit(DispatchEvent::ProviderFailed {
            request_id: request_id.clone(),
            task_id,
            message: failure.clone(),
        });
        Err(Error::ProviderError {
            task_id,
            provider: descriptor.provider.clone(),
            message: failure,
        })
    }

    /// Delete unread any results belonging to this request's abandoned tasks.
    async fn discard_stale(&self, request_id: &RequestId) {
        let Ok(entry) = self.ledger.get(request_id).await else {
            return;
        };
        for task_id in entry.abandoned_task_ids() {
            match self.medium.delete(&keys::result(&task_id)).await {
                Ok(true) => {
                    hlog_warn!(
                        "Discarded stale result for abandoned task {} of {}",
                        task_id.short(),
                        request_id
                    );
                    self.emit(DispatchEvent::StaleDiscarded {
                        request_id: request_id.clone(),
                        task_id,
                    });
                }
                Ok(false) => {}
                Err(e) => hlog_warn!("Failed to discard stale result {}: {}", task_id, e),
            }
        }
    }

    /// Renew the lease once less than half of it remains. Returns how long
    /// until the next renewal is due.
    ///
    /// Fails with `LeaseExpired` once the lease is lost; the token is dropped
    /// so nothing releases a lease someone else may now hold.
    async fn keep_lease(&self, token: &mut Option<LockToken>) -> Result<Option<Duration>> {
        let Some(held) = token.as_mut() else {
            return Ok(None);
        };
        let half = held.lease_ttl() / 2;
        if held.remaining() < half {
            match self.lock.renew(held).await {
                Ok(()) => hlog_debug!("Renewed {} until {}", held.resource_id, held.lease_expires_at),
                Err(e @ Error::LeaseExpired { .. }) => {
                    *token = None;
                    return Err(e);
                }
                Err(e) => hlog_warn!("Lease renewal failed: {}", e),
            }
        }
        Ok(token.as_ref().map(|t| t.remaining().saturating_sub(half)))
    }

    /// Withdraw a published task and mark it abandoned.
    async fn abort(&self, request_id: &RequestId, task_id: TaskId, live: RequestState, outcome: AttemptOutcome) {
        if let Err(e) = self.medium.delete(&keys::pending(&task_id)).await {
            hlog_warn!("Failed to withdraw task {}: {}", task_id, e);
        }
        self.end_quietly(request_id, task_id, live, outcome).await;
    }

    /// End the live attempt as ABANDONED, logging instead of failing.
    async fn end_quietly(&self, request_id: &RequestId, task_id: TaskId, from: RequestState, outcome: AttemptOutcome) {
        match self
            .ledger
            .end_attempt(request_id, task_id, from, RequestState::Abandoned, outcome)
            .await
        {
            Ok(_) => self.emit(DispatchEvent::Abandoned {
                request_id: request_id.clone(),
                task_id,
            }),
            Err(e) => hlog_error!("Could not record {} for task {}: {}", outcome, task_id, e),
        }
    }

    pub(crate) fn emit(&self, event: DispatchEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}
