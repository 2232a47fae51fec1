//! Ledger entry types and the request state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{RequestId, TaskId};
use crate::Result;

/// Lifecycle state of one logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Pending,
    Dispatched,
    AwaitingLock,
    Completed,
    Abandoned,
    FallbackDispatched,
    Failed,
}

impl RequestState {
    /// Check if moving from this state to `target` is allowed.
    ///
    /// - Pending -> Dispatched | AwaitingLock | Failed
    /// - AwaitingLock -> Dispatched | FallbackDispatched | Abandoned | Failed
    /// - Dispatched -> Completed | Abandoned | FallbackDispatched | Failed
    /// - Abandoned -> FallbackDispatched | Failed
    /// - FallbackDispatched -> AwaitingLock | Completed | Abandoned | Failed
    pub fn can_transition(&self, target: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, target),
            (Pending, Dispatched)
                | (Pending, AwaitingLock)
                | (Pending, Failed)
                | (AwaitingLock, Dispatched)
                | (AwaitingLock, FallbackDispatched)
                | (AwaitingLock, Abandoned)
                | (AwaitingLock, Failed)
                | (Dispatched, Completed)
                | (Dispatched, Abandoned)
                | (Dispatched, FallbackDispatched)
                | (Dispatched, Failed)
                | (Abandoned, FallbackDispatched)
                | (Abandoned, Failed)
                | (FallbackDispatched, AwaitingLock)
                | (FallbackDispatched, Completed)
                | (FallbackDispatched, Abandoned)
                | (FallbackDispatched, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Failed)
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestState::Pending => "PENDING",
            RequestState::Dispatched => "DISPATCHED",
            RequestState::AwaitingLock => "AWAITING_LOCK",
            RequestState::Completed => "COMPLETED",
            RequestState::Abandoned => "ABANDONED",
            RequestState::FallbackDispatched => "FALLBACK_DISPATCHED",
            RequestState::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

/// How a single task attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    ProviderFailed,
    TimedOut,
    LockTimedOut,
    Cancelled,
    MediumFailed,
}

impl AttemptOutcome {
    /// Whether a result for this attempt, should one still arrive, is a ghost.
    pub fn leaves_ghost(&self) -> bool {
        matches!(
            self,
            AttemptOutcome::TimedOut | AttemptOutcome::Cancelled | AttemptOutcome::MediumFailed
        )
    }
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AttemptOutcome::Succeeded => "succeeded",
            AttemptOutcome::ProviderFailed => "provider_failed",
            AttemptOutcome::TimedOut => "timed_out",
            AttemptOutcome::LockTimedOut => "lock_timed_out",
            AttemptOutcome::Cancelled => "cancelled",
            AttemptOutcome::MediumFailed => "medium_failed",
        };
        write!(f, "{}", s)
    }
}

/// One task tried on behalf of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub task_id: TaskId,
    pub provider: String,
    pub started_at: DateTime<Utc>,
    /// `None` while the attempt is still live.
    pub outcome: Option<AttemptOutcome>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A state change, kept for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: RequestState,
    pub to: RequestState,
    pub at: DateTime<Utc>,
    pub task_id: Option<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub request_id: RequestId,
    /// The live task, if an attempt is in flight.
    pub current_task_id: Option<TaskId>,
    pub state: RequestState,
    pub attempts: Vec<Attempt>,
    pub history: Vec<TransitionRecord>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            current_task_id: None,
            state: RequestState::Pending,
            attempts: Vec::new(),
            history: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Tasks whose late results must be discarded unread.
    pub fn abandoned_task_ids(&self) -> Vec<TaskId> {
        self.attempts
            .iter()
            .filter(|a| a.outcome.is_some_and(|o| o.leaves_ghost()))
            .map(|a| a.task_id)
            .collect()
    }

    pub fn is_live(&self, task_id: &TaskId) -> bool {
        self.current_task_id.as_ref() == Some(task_id)
    }

    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    pub(crate) fn record(&mut self, to: RequestState) {
        if self.state != to {
            self.history.push(TransitionRecord {
                from: self.state,
                to,
                at: Utc::now(),
                task_id: self.current_task_id,
            });
            self.state = to;
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
