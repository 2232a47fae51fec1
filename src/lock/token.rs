use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{after, until};
use crate::Result;

/// Lease on a resource, stored at `locks/<resource_id>.lock`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken {
    pub resource_id: String,
    pub holder_id: String,
    /// Identifies this particular grant; renew and release match on it.
    pub lease_id: Uuid,
    /// Fencing counter, incremented on every expired-lease takeover.
    pub generation: u64,
    pub acquired_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
    pub lease_ttl_ms: u64,
}

impl LockToken {
    pub(crate) fn grant(resource_id: &str, holder_id: &str, lease_ttl: Duration, generation: u64) -> Self {
        let now = Utc::now();
        Self {
            resource_id: resource_id.to_string(),
            holder_id: holder_id.to_string(),
            lease_id: Uuid::new_v4(),
            generation,
            acquired_at: now,
            lease_expires_at: after(now, lease_ttl),
            lease_ttl_ms: u64::try_from(lease_ttl.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.lease_expires_at
    }

    /// Time left on the lease, zero once expired.
    pub fn remaining(&self) -> Duration {
        until(self.lease_expires_at)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A waiter's place in the FIFO queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueTicket {
    pub holder_id: String,
    pub enqueued_at: DateTime<Utc>,
    /// Waiters refresh this while they wait; a lapsed ticket is pruned.
    pub heartbeat_expires_at: DateTime<Utc>,
}

impl QueueTicket {
    pub fn is_dead(&self) -> bool {
        Utc::now() >= self.heartbeat_expires_at
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Ticket name whose lexical order is arrival order.
pub(crate) fn ticket_name(enqueued_at: DateTime<Utc>, holder_id: &str) -> String {
    let nanos = enqueued_at.timestamp_nanos_opt().unwrap_or(i64::MAX).max(0);
    let holder: String = holder_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(48)
        .collect();
    format!("{:020}-{}-{}", nanos, holder, &Uuid::new_v4().simple().to_string()[..8])
}
