//! Hardware Lock: a leased, FIFO mutual-exclusion broker over the medium.
//!
//! One lock record per resource (`locks/<resource>.lock`) holds the current
//! [`LockToken`]. Acquisition:
//!
//! 1. Enqueue a ticket `locks/<resource>.queue.<arrival>-<holder>-<nonce>`.
//! 2. Prune tickets whose heartbeat lapsed (crashed waiters).
//! 3. If our ticket is the head, take the lock: exclusive `create` when the
//!    record is absent, CAS takeover when its lease has expired.
//! 4. Otherwise wait for a change, the holder's lease expiry, or the timer.
//!
//! A holder that dies simply stops renewing; the next waiter takes over at
//! `lease_expires_at`. A late `release` on a superseded lease is a no-op
//! because release matches on `lease_id`.

mod token;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

pub use token::{LockToken, QueueTicket};

use crate::core::{after, until};
use crate::medium::{keys, ChangeKind, ChangeWaiter, Medium, WaitOutcome};
use crate::{hlog, hlog_debug, hlog_trace, hlog_warn, Error, Result};

/// Default heartbeat window for queue tickets.
pub const DEFAULT_TICKET_TTL: Duration = Duration::from_secs(5);

/// Slack added when sleeping until a lease expires.
const EXPIRY_SLACK: Duration = Duration::from_millis(1);

enum TakeOutcome {
    Taken(LockToken),
    /// Someone holds the lock; wake no later than its lease expiry.
    Held(Option<DateTime<Utc>>),
    NotHead,
}

pub struct HardwareLock {
    medium: Arc<dyn Medium>,
    poll_interval: Duration,
    ticket_ttl: Duration,
}

impl HardwareLock {
    pub fn new(medium: Arc<dyn Medium>, poll_interval: Duration) -> Self {
        Self {
            medium,
            poll_interval,
            ticket_ttl: DEFAULT_TICKET_TTL,
        }
    }

    pub fn with_ticket_ttl(mut self, ticket_ttl: Duration) -> Self {
        self.ticket_ttl = ticket_ttl;
        self
    }

    /// Acquire `resource_id`, waiting in FIFO order for up to `acquire_timeout`.
    pub async fn acquire(
        &self,
        resource_id: &str,
        holder_id: &str,
        lease_ttl: Duration,
        acquire_timeout: Duration,
    ) -> Result<LockToken> {
        let cancel = CancellationToken::new();
        self.acquire_with_cancel(resource_id, holder_id, lease_ttl, acquire_timeout, &cancel)
            .await
    }

    /// Like [`acquire`](Self::acquire), aborting with `Cancelled` when `cancel` fires.
    pub async fn acquire_with_cancel(
        &self,
        resource_id: &str,
        holder_id: &str,
        lease_ttl: Duration,
        acquire_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockToken> {
        let started = Instant::now();
        let enqueued_at = Utc::now();
        let ticket_key = keys::ticket(resource_id, &token::ticket_name(enqueued_at, holder_id));
        let mut ticket = QueueTicket {
            holder_id: holder_id.to_string(),
            enqueued_at,
            heartbeat_expires_at: after(enqueued_at, self.ticket_ttl),
        };
        self.medium.put(&ticket_key, ticket.to_bytes()?).await?;
        hlog_debug!("{} queued for {} as {}", holder_id, resource_id, ticket_key);

        let result = self
            .wait_for_turn(
                resource_id,
                holder_id,
                lease_ttl,
                acquire_timeout,
                started,
                &ticket_key,
                &mut ticket,
                cancel,
            )
            .await;

        // Holding the lock or giving up, the ticket has served its purpose.
        if let Err(e) = self.medium.delete(&ticket_key).await {
            hlog_warn!("Failed to remove queue ticket {}: {}", ticket_key, e);
        }

        match &result {
            Ok(token) => hlog!(
                "{} acquired {} (generation {}) after {:?}",
                holder_id,
                resource_id,
                token.generation,
                started.elapsed()
            ),
            Err(e) => hlog_warn!("{} did not acquire {}: {}", holder_id, resource_id, e),
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn wait_for_turn(
        &self,
        resource_id: &str,
        holder_id: &str,
        lease_ttl: Duration,
        acquire_timeout: Duration,
        started: Instant,
        ticket_key: &str,
        ticket: &mut QueueTicket,
        cancel: &CancellationToken,
    ) -> Result<LockToken> {
        let lock_key = keys::lock(resource_id);
        let queue_prefix = keys::queue_prefix(resource_id);
        let mut waiter = ChangeWaiter::new(self.medium.as_ref(), self.poll_interval);

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            self.heartbeat(ticket_key, ticket).await?;

            let wake_at = match self
                .try_take(resource_id, holder_id, lease_ttl, ticket_key, &queue_prefix)
                .await?
            {
                TakeOutcome::Taken(token) => return Ok(token),
                TakeOutcome::Held(expires_at) => expires_at,
                TakeOutcome::NotHead => None,
            };

            let waited = started.elapsed();
            if waited >= acquire_timeout {
                return Err(Error::LockTimeout {
                    resource_id: resource_id.to_string(),
                    waited,
                });
            }

            let mut max = acquire_timeout - waited;
            // Re-heartbeat before the ticket lapses.
            max = max.min(self.ticket_ttl / 2);
            if let Some(expires_at) = wake_at {
                max = max.min(until(expires_at) + EXPIRY_SLACK);
            }

            let outcome = waiter
                .wait(max, cancel, |event| {
                    event.key == lock_key
                        || (event.kind == ChangeKind::Removed && event.key.starts_with(&queue_prefix))
                })
                .await;
            if outcome == WaitOutcome::Cancelled {
                return Err(Error::Cancelled);
            }
        }
    }

    /// Refresh our ticket once half its heartbeat window is gone.
    ///
    /// Also re-publishes a ticket that was pruned while we stalled; the name
    /// still encodes the original arrival time, so the place is kept.
    async fn heartbeat(&self, ticket_key: &str, ticket: &mut QueueTicket) -> Result<()> {
        let stalled = until(ticket.heartbeat_expires_at) < self.ticket_ttl / 2;
        if stalled || self.medium.get(ticket_key).await?.is_none() {
            ticket.heartbeat_expires_at = after(Utc::now(), self.ticket_ttl);
            self.medium.put(ticket_key, ticket.to_bytes()?).await?;
        }
        Ok(())
    }

    async fn try_take(
        &self,
        resource_id: &str,
        holder_id: &str,
        lease_ttl: Duration,
        ticket_key: &str,
        queue_prefix: &str,
    ) -> Result<TakeOutcome> {
        let head = self.prune_and_find_head(queue_prefix, ticket_key).await?;
        if head.as_deref() != Some(ticket_key) {
            return Ok(TakeOutcome::NotHead);
        }

        let lock_key = keys::lock(resource_id);
        let Some(current) = self.medium.get(&lock_key).await? else {
            let token = LockToken::grant(resource_id, holder_id, lease_ttl, 1);
            if self.medium.create(&lock_key, token.to_bytes()?).await? {
                return Ok(TakeOutcome::Taken(token));
            }
            return Ok(TakeOutcome::Held(None));
        };

        let generation = match LockToken::from_bytes(&current) {
            Ok(held) if !held.is_expired() => {
                return Ok(TakeOutcome::Held(Some(held.lease_expires_at)));
            }
            Ok(expired) => {
                hlog_warn!(
                    "Lease on {} held by {} expired at {}; taking over",
                    resource_id,
                    expired.holder_id,
                    expired.lease_expires_at
                );
                expired.generation.saturating_add(1)
            }
            Err(e) => {
                hlog_warn!("Replacing unreadable lock record {}: {}", lock_key, e);
                1
            }
        };

        let token = LockToken::grant(resource_id, holder_id, lease_ttl, generation);
        if self
            .medium
            .compare_and_swap(&lock_key, &current, Some(token.to_bytes()?))
            .await?
        {
            Ok(TakeOutcome::Taken(token))
        } else {
            Ok(TakeOutcome::Held(None))
        }
    }

    /// Remove dead tickets and return the key of the first live one.
    async fn prune_and_find_head(&self, queue_prefix: &str, own_key: &str) -> Result<Option<String>> {
        for key in self.medium.list(queue_prefix).await? {
            let Some(bytes) = self.medium.get(&key).await? else {
                continue;
            };
            let dead = QueueTicket::from_bytes(&bytes).map_or(true, |t| t.is_dead());
            if dead && key != own_key {
                if self.medium.compare_and_swap(&key, &bytes, None).await? {
                    hlog_debug!("Pruned dead queue ticket {}", key);
                }
                continue;
            }
            return Ok(Some(key));
        }
        Ok(None)
    }

    /// Extend the lease by its original TTL.
    ///
    /// Fails with `LeaseExpired` if the lease already lapsed or was taken over.
    pub async fn renew(&self, token: &mut LockToken) -> Result<()> {
        let lock_key = keys::lock(&token.resource_id);
        let expired = || Error::LeaseExpired {
            resource_id: token.resource_id.clone(),
            holder_id: token.holder_id.clone(),
        };

        let Some(current) = self.medium.get(&lock_key).await? else {
            return Err(expired());
        };
        let stored = LockToken::from_bytes(&current)?;
        if stored.lease_id != token.lease_id || stored.is_expired() {
            return Err(expired());
        }

        let mut renewed = stored;
        renewed.lease_expires_at = after(Utc::now(), renewed.lease_ttl());
        if !self
            .medium
            .compare_and_swap(&lock_key, &current, Some(renewed.to_bytes()?))
            .await?
        {
            return Err(expired());
        }
        hlog_trace!(
            "{} renewed {} until {}",
            renewed.holder_id,
            renewed.resource_id,
            renewed.lease_expires_at
        );
        *token = renewed;
        Ok(())
    }

    /// Release the lease. A no-op if it was already taken over or released.
    pub async fn release(&self, token: &LockToken) -> Result<()> {
        let lock_key = keys::lock(&token.resource_id);
        let Some(current) = self.medium.get(&lock_key).await? else {
            return Ok(());
        };
        let ours = LockToken::from_bytes(&current).is_ok_and(|t| t.lease_id == token.lease_id);
        if ours && self.medium.compare_and_swap(&lock_key, &current, None).await? {
            hlog_debug!("{} released {}", token.holder_id, token.resource_id);
        } else {
            hlog_debug!(
                "{} release on {} ignored: lease no longer held",
                token.holder_id,
                token.resource_id
            );
        }
        Ok(())
    }

    /// The current unexpired lease on `resource_id`, if any.
    pub async fn holder(&self, resource_id: &str) -> Result<Option<LockToken>> {
        let Some(bytes) = self.medium.get(&keys::lock(resource_id)).await? else {
            return Ok(None);
        };
        Ok(LockToken::from_bytes(&bytes).ok().filter(|t| !t.is_expired()))
    }

    /// Live queue tickets for `resource_id`, in arrival order.
    pub async fn waiters(&self, resource_id: &str) -> Result<Vec<QueueTicket>> {
        let mut waiters = Vec::new();
        for key in self.medium.list(&keys::queue_prefix(resource_id)).await? {
            if let Some(bytes) = self.medium.get(&key).await? {
                if let Ok(ticket) = QueueTicket::from_bytes(&bytes) {
                    if !ticket.is_dead() {
                        waiters.push(ticket);
                    }
                }
            }
        }
        Ok(waiters)
    }
}
