use std::time::Duration;

use thiserror::Error;

use crate::core::{RequestId, TaskId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task {task_id} got no answer within {deadline:?}")]
    Timeout { task_id: TaskId, deadline: Duration },

    #[error("Provider {provider} failed task {task_id}: {message}")]
    ProviderError {
        task_id: TaskId,
        provider: String,
        message: String,
    },

    #[error("Shared medium {operation} on {key} failed after {attempts} attempt(s): {message}")]
    Medium {
        operation: String,
        key: String,
        attempts: u32,
        message: String,
    },

    #[error("Resource {resource_id} busy: not acquired within {waited:?}")]
    LockTimeout {
        resource_id: String,
        waited: Duration,
    },

    #[error("Lease on {resource_id} held by {holder_id} has expired")]
    LeaseExpired {
        resource_id: String,
        holder_id: String,
    },

    #[error("Request {request_id} expected state {expected} but found {actual}")]
    Conflict {
        request_id: RequestId,
        expected: String,
        actual: String,
    },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    #[error("Request already exists: {0}")]
    RequestExists(RequestId),

    #[error("Request {request_id} failed on every provider ({attempts} attempt(s))")]
    ProvidersExhausted {
        request_id: RequestId,
        attempts: usize,
    },

    #[error("No provider policy for capability: {0}")]
    PolicyNotFound(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The one reason a request is reported as failed to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No answer within the deadline.
    Timeout,
    /// The worker reported a failure.
    ProviderError,
    /// The accelerator could not be acquired in time.
    Busy,
    /// The shared medium is unreadable or unwritable.
    Infrastructure,
    /// Both the primary and the secondary provider failed.
    ProvidersExhausted,
    /// The caller went away.
    Cancelled,
    /// Anything else (bad input, configuration, bugs).
    Internal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::ProviderError => write!(f, "provider_error"),
            FailureKind::Busy => write!(f, "busy"),
            FailureKind::Infrastructure => write!(f, "infrastructure"),
            FailureKind::ProvidersExhausted => write!(f, "providers_exhausted"),
            FailureKind::Cancelled => write!(f, "cancelled"),
            FailureKind::Internal => write!(f, "internal"),
        }
    }
}

impl Error {
    /// Classify this error for the caller.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::Timeout { .. } => FailureKind::Timeout,
            Error::ProviderError { .. } => FailureKind::ProviderError,
            Error::LockTimeout { .. } => FailureKind::Busy,
            Error::Medium { .. } | Error::Io(_) => FailureKind::Infrastructure,
            Error::ProvidersExhausted { .. } => FailureKind::ProvidersExhausted,
            Error::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Internal,
        }
    }

    /// Whether the fallback dispatcher may retry this with the secondary provider.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::ProviderError { .. })
    }

    /// Whether a shared-medium operation that produced this error may be retried.
    pub fn is_transient_io(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}
