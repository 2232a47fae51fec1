use crate::core::{RequestId, TaskId};
use crate::FailureKind;

/// Observable milestones of a dispatch flow.
///
/// Delivered on an optional unbounded channel; nothing in the protocol
/// depends on anyone listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    Published {
        request_id: RequestId,
        task_id: TaskId,
        provider: String,
    },
    LockAcquired {
        request_id: RequestId,
        resource_id: String,
        generation: u64,
    },
    LockReleased {
        request_id: RequestId,
        resource_id: String,
    },
    Completed {
        request_id: RequestId,
        task_id: TaskId,
    },
    ProviderFailed {
        request_id: RequestId,
        task_id: TaskId,
        message: String,
    },
    Abandoned {
        request_id: RequestId,
        task_id: TaskId,
    },
    /// A result that appeared right after the deadline, caught by the
    /// post-delete re-check.
    LateResultHonored {
        request_id: RequestId,
        task_id: TaskId,
    },
    /// A result for an abandoned task, deleted unread.
    StaleDiscarded {
        request_id: RequestId,
        task_id: TaskId,
    },
    FallbackTriggered {
        request_id: RequestId,
        from_provider: String,
        to_provider: String,
    },
    Failed {
        request_id: RequestId,
        kind: FailureKind,
    },
}

impl DispatchEvent {
    pub fn request_id(&self) -> &RequestId {
        match self {
            DispatchEvent::Published { request_id, .. }
            | DispatchEvent::LockAcquired { request_id, .. }
            | DispatchEvent::LockReleased { request_id, .. }
            | DispatchEvent::Completed { request_id, .. }
            | DispatchEvent::ProviderFailed { request_id, .. }
            | DispatchEvent::Abandoned { request_id, .. }
            | DispatchEvent::LateResultHonored { request_id, .. }
            | DispatchEvent::StaleDiscarded { request_id, .. }
            | DispatchEvent::FallbackTriggered { request_id, .. }
            | DispatchEvent::Failed { request_id, .. } => request_id,
        }
    }
}
