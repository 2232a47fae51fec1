//! Wire records exchanged with workers through the shared medium.
//!
//! Field names are a stable schema: workers written in other languages read
//! and write these as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::TaskId;
use crate::Result;

/// A unit of work published to `pending/`. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: TaskId,
    pub capability: String,
    pub provider: String,
    /// Opaque reference to the input data (usually a path on the shared volume).
    pub payload_ref: String,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl TaskDescriptor {
    /// Create a descriptor with a fresh task id and `deadline` from now.
    pub fn new(capability: &str, provider: &str, payload_ref: &str, deadline: Duration) -> Self {
        let created_at = Utc::now();
        Self {
            task_id: TaskId::new(),
            capability: capability.to_string(),
            provider: provider.to_string(),
            payload_ref: payload_ref.to_string(),
            created_at,
            deadline: after(created_at, deadline),
        }
    }

    /// Restart the clock: `created_at` becomes now and `deadline` is
    /// `deadline` from now. Only valid before the descriptor is published.
    pub fn restamp(&mut self, deadline: Duration) {
        self.created_at = Utc::now();
        self.deadline = after(self.created_at, deadline);
    }

    /// Whether the wall-clock deadline has passed.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.deadline
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Outcome reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactStatus {
    Ok,
    Error,
}

impl std::fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactStatus::Ok => write!(f, "ok"),
            ArtifactStatus::Error => write!(f, "error"),
        }
    }
}

/// A worker's answer to one descriptor, written to `results/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultArtifact {
    pub task_id: TaskId,
    pub status: ArtifactStatus,
    pub payload_ref: String,
    pub completed_at: DateTime<Utc>,
    /// Worker-supplied failure detail when `status` is `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultArtifact {
    pub fn ok(task_id: TaskId, payload_ref: &str) -> Self {
        Self {
            task_id,
            status: ArtifactStatus::Ok,
            payload_ref: payload_ref.to_string(),
            completed_at: Utc::now(),
            error: None,
        }
    }

    pub fn failed(task_id: TaskId, message: &str) -> Self {
        Self {
            task_id,
            status: ArtifactStatus::Error,
            payload_ref: String::new(),
            completed_at: Utc::now(),
            error: Some(message.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ArtifactStatus::Ok
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Convert a std duration to chrono, saturating on overflow.
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// `at + d`, clamped to the latest representable instant.
pub(crate) fn after(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    at.checked_add_signed(to_chrono(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Time remaining until `at`, zero if it has passed.
pub(crate) fn until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}
