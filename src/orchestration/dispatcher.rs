//! Fallback Dispatcher: primary first, secondary once, then give up.
//!
//! ```text
//! PRIMARY_ATTEMPT --ok--> DONE
//!        | Timeout / ProviderError (and a secondary exists)
//!        v
//! SECONDARY_ATTEMPT --ok--> DONE
//!        | anything else
//!        v
//!      FAILED
//! ```
//!
//! Only `Timeout` and `ProviderError` earn a second attempt. A busy
//! accelerator or a broken medium is surfaced to the caller as is.

use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use super::coordinator::{Coordinator, Phase};
use super::events::DispatchEvent;
use super::policy::PolicyTable;
use crate::core::{RequestId, ResultArtifact};
use crate::ledger::RequestState;
use crate::{hlog, hlog_error, hlog_warn, Error, Result};

/// One logical request for [`FallbackDispatcher::run_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub request_id: RequestId,
    pub capability: String,
    pub payload_ref: String,
}

impl DispatchRequest {
    pub fn new(request_id: RequestId, capability: &str, payload_ref: &str) -> Self {
        Self {
            request_id,
            capability: capability.to_string(),
            payload_ref: payload_ref.to_string(),
        }
    }
}

pub struct FallbackDispatcher {
    coordinator: Arc<Coordinator>,
    policy: PolicyTable,
}

impl FallbackDispatcher {
    pub fn new(coordinator: Arc<Coordinator>, policy: PolicyTable) -> Self {
        Self { coordinator, policy }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn policy(&self) -> &PolicyTable {
        &self.policy
    }

    /// Serve one logical request to completion or a single failure reason.
    pub async fn request(
        &self,
        request_id: &RequestId,
        capability: &str,
        payload_ref: &str,
    ) -> Result<ResultArtifact> {
        let cancel = CancellationToken::new();
        self.request_with_cancel(request_id, capability, payload_ref, &cancel)
            .await
    }

    pub async fn request_with_cancel(
        &self,
        request_id: &RequestId,
        capability: &str,
        payload_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<ResultArtifact> {
        let chain = self.policy.resolve(capability)?;
        let ledger = self.coordinator.ledger();
        ledger.create(request_id).await?;
        hlog!(
            "Request {} ({}) -> primary {}",
            request_id,
            capability,
            chain.primary.name
        );

        let primary = &chain.primary;
        let err = match self
            .coordinator
            .run_attempt(request_id, primary, payload_ref, primary.deadline, Phase::Primary, cancel)
            .await
        {
            Ok(artifact) => return Ok(artifact),
            Err(e) => e,
        };

        if !err.is_fallback_eligible() {
            return Err(self.fail(request_id, err).await);
        }
        let Some(secondary) = &chain.secondary else {
            hlog_warn!("Request {}: {} failed and no secondary is configured", request_id, primary.name);
            return Err(self.exhausted(request_id).await);
        };

        let Some(from) = primary_settled_in(&err) else {
            return Err(self.fail(request_id, err).await);
        };
        if let Err(e) = ledger
            .transition(request_id, from, RequestState::FallbackDispatched)
            .await
        {
            return Err(self.fail(request_id, e).await);
        }
        hlog!(
            "Request {}: {} ({}) -> falling back to {}",
            request_id,
            primary.name,
            err.failure_kind(),
            secondary.name
        );
        self.coordinator.emit(DispatchEvent::FallbackTriggered {
            request_id: request_id.clone(),
            from_provider: primary.name.clone(),
            to_provider: secondary.name.clone(),
        });

        match self
            .coordinator
            .run_attempt(
                request_id,
                secondary,
                payload_ref,
                secondary.deadline,
                Phase::Fallback,
                cancel,
            )
            .await
        {
            Ok(artifact) => Ok(artifact),
            Err(e) if e.is_fallback_eligible() => Err(self.exhausted(request_id).await),
            Err(e) => Err(self.fail(request_id, e).await),
        }
    }

    /// Dispatch many requests concurrently; outcomes come back in input order.
    pub async fn run_batch(&self, requests: &[DispatchRequest]) -> Vec<Result<ResultArtifact>> {
        join_all(
            requests
                .iter()
                .map(|r| self.request(&r.request_id, &r.capability, &r.payload_ref)),
        )
        .await
    }

    async fn exhausted(&self, request_id: &RequestId) -> Error {
        let attempts = match self.coordinator.ledger().get(request_id).await {
            Ok(entry) => entry.attempts.len(),
            Err(_) => 0,
        };
        self.fail(
            request_id,
            Error::ProvidersExhausted {
                request_id: request_id.clone(),
                attempts,
            },
        )
        .await
    }

    /// Settle the entry as FAILED and hand back the reason.
    async fn fail(&self, request_id: &RequestId, reason: Error) -> Error {
        let ledger = self.coordinator.ledger();
        match ledger.get(request_id).await {
            Ok(entry) if !entry.state.is_terminal() => {
                if let Err(e) = ledger
                    .transition(request_id, entry.state, RequestState::Failed)
                    .await
                {
                    hlog_error!("Could not mark {} failed: {}", request_id, e);
                }
            }
            Ok(_) => {}
            Err(e) => hlog_error!("Could not mark {} failed: {}", request_id, e),
        }
        hlog_warn!("Request {} failed ({}): {}", request_id, reason.failure_kind(), reason);
        self.coordinator.emit(DispatchEvent::Failed {
            request_id: request_id.clone(),
            kind: reason.failure_kind(),
        });
        reason
    }
}

/// Where a primary attempt that failed with `err` leaves the entry.
fn primary_settled_in(err: &Error) -> Option<RequestState> {
    match err {
        Error::Timeout { .. } => Some(RequestState::Abandoned),
        Error::ProviderError { .. } => Some(RequestState::Dispatched),
        _ => None,
    }
}
