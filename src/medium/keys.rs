//! Key layout on the shared medium.
//!
//! ```text
//! pending/<task_id>.task                     TaskDescriptor
//! results/<task_id>.result                   ResultArtifact
//! locks/<resource_id>.lock                   LockToken
//! locks/<resource_id>.queue.<ticket>         QueueTicket
//! claims/<task_id>.claim                     worker claim marker
//! ledger/<request_id>.entry                  LedgerEntry
//! archive/<request_id>.entry                 archived LedgerEntry
//! ```

use crate::core::{RequestId, TaskId};

use super::Namespace;

pub const TASK_EXT: &str = ".task";
pub const RESULT_EXT: &str = ".result";
pub const CLAIM_EXT: &str = ".claim";

pub fn pending(task_id: &TaskId) -> String {
    format!("{}/{}{}", Namespace::Pending, task_id, TASK_EXT)
}

pub fn result(task_id: &TaskId) -> String {
    format!("{}/{}{}", Namespace::Results, task_id, RESULT_EXT)
}

pub fn claim(task_id: &TaskId) -> String {
    format!("{}/{}{}", Namespace::Claims, task_id, CLAIM_EXT)
}

pub fn lock(resource_id: &str) -> String {
    format!("{}/{}.lock", Namespace::Locks, resource_id)
}

/// Prefix shared by every queue ticket of `resource_id`.
pub fn queue_prefix(resource_id: &str) -> String {
    format!("{}/{}.queue.", Namespace::Locks, resource_id)
}

pub fn ticket(resource_id: &str, ticket: &str) -> String {
    format!("{}{}", queue_prefix(resource_id), ticket)
}

pub fn ledger(request_id: &RequestId) -> String {
    format!("{}/{}.entry", Namespace::Ledger, request_id)
}

pub fn archive(request_id: &RequestId) -> String {
    format!("{}/{}.entry", Namespace::Archive, request_id)
}

/// Extract the task id from a `pending/`, `results/` or `claims/` key.
pub fn task_id_of(key: &str) -> Option<TaskId> {
    let name = key.rsplit('/').next()?;
    let stem = name
        .strip_suffix(TASK_EXT)
        .or_else(|| name.strip_suffix(RESULT_EXT))
        .or_else(|| name.strip_suffix(CLAIM_EXT))?;
    stem.parse().ok()
}

/// Extract the resource id from a `locks/<resource>.lock` key.
pub fn resource_of_lock(key: &str) -> Option<&str> {
    key.strip_prefix("locks/")?.strip_suffix(".lock")
}

/// Split a key into its namespace directory and file name.
pub fn split(key: &str) -> Option<(&str, &str)> {
    let (dir, name) = key.split_once('/')?;
    if dir.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((dir, name))
}
