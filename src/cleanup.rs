//! Sweeper for records left behind on the shared medium.
//!
//! Crashed orchestrators leave descriptors nobody waits for, crashed workers
//! leave claims, and dead lock holders leave expired leases and queue
//! tickets. The sweeper finds them and, when asked, removes them.
//!
//! # Orphan Detection
//!
//! A record is reported when:
//! - a descriptor is past its deadline by more than the grace period, or is
//!   older than the grace period and not live in the supplied ledger;
//! - a result has no descriptor, is not live in the supplied ledger, and was
//!   completed more than the grace period ago;
//! - a lock lease has expired;
//! - a queue ticket's heartbeat has lapsed;
//! - a claim's descriptor is gone.
//!
//! Locks and tickets are removed by compare-and-swap against the content
//! that was judged stale, so a fresh holder or waiter is never disturbed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::core::{after, ResultArtifact, TaskDescriptor, TaskId};
use crate::ledger::Ledger;
use crate::lock::{LockToken, QueueTicket};
use crate::medium::{keys, Medium, Namespace};
use crate::{hlog, hlog_debug, hlog_warn, Result};

/// Configuration for sweep behavior.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// How long past its deadline (or since creation) a record may linger.
    pub grace: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(30),
        }
    }
}

/// Report of detected and removed records, by medium key.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub orphaned_descriptors: Vec<String>,
    pub stale_results: Vec<String>,
    pub expired_locks: Vec<String>,
    pub dead_tickets: Vec<String>,
    pub dangling_claims: Vec<String>,
    /// Keys actually removed by `sweep`.
    pub removed: Vec<String>,
    /// Keys that could not be removed, with the reason.
    pub failed: Vec<(String, String)>,
}

impl SweepReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of detected records across all categories.
    pub fn detected_count(&self) -> usize {
        self.orphaned_descriptors.len()
            + self.stale_results.len()
            + self.expired_locks.len()
            + self.dead_tickets.len()
            + self.dangling_claims.len()
    }

    pub fn removed_count(&self) -> usize {
        self.removed.len()
    }

    pub fn is_clean(&self) -> bool {
        self.detected_count() == 0
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Merge another report into this one.
    pub fn merge(&mut self, other: SweepReport) {
        self.orphaned_descriptors.extend(other.orphaned_descriptors);
        self.stale_results.extend(other.stale_results);
        self.expired_locks.extend(other.expired_locks);
        self.dead_tickets.extend(other.dead_tickets);
        self.dangling_claims.extend(other.dangling_claims);
        self.removed.extend(other.removed);
        self.failed.extend(other.failed);
    }
}

pub struct Sweeper {
    medium: Arc<dyn Medium>,
    config: SweepConfig,
}

impl Sweeper {
    pub fn new(medium: Arc<dyn Medium>, config: SweepConfig) -> Self {
        Self { medium, config }
    }

    pub fn with_defaults(medium: Arc<dyn Medium>) -> Self {
        Self::new(medium, SweepConfig::default())
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Detect leftovers without touching anything.
    pub async fn scan(&self, ledger: Option<&Ledger>) -> Result<SweepReport> {
        let live: Option<HashSet<TaskId>> = match ledger {
            Some(l) => Some(l.live_task_ids().await.into_iter().collect()),
            None => None,
        };
        let is_live = |task_id: &TaskId| live.as_ref().is_some_and(|l| l.contains(task_id));
        let grace = self.config.grace;
        let now = Utc::now();

        let mut report = SweepReport::new();
        let mut pending = HashSet::new();

        for key in self.medium.list(&Namespace::Pending.prefix()).await? {
            let Some(bytes) = self.medium.get(&key).await? else {
                continue;
            };
            let orphaned = match TaskDescriptor::from_bytes(&bytes) {
                Ok(d) => {
                    pending.insert(d.task_id);
                    let overdue = now > after(d.deadline, grace);
                    let unowned =
                        live.is_some() && !is_live(&d.task_id) && now > after(d.created_at, grace);
                    overdue || unowned
                }
                Err(e) => {
                    hlog_warn!("Unreadable descriptor {}: {}", key, e);
                    true
                }
            };
            if orphaned {
                report.orphaned_descriptors.push(key);
            }
        }

        for key in self.medium.list(&Namespace::Results.prefix()).await? {
            let Some(task_id) = keys::task_id_of(&key) else {
                continue;
            };
            if pending.contains(&task_id) || is_live(&task_id) {
                continue;
            }
            let Some(bytes) = self.medium.get(&key).await? else {
                continue;
            };
            let settled = match ResultArtifact::from_bytes(&bytes) {
                Ok(a) => now > after(a.completed_at, grace),
                Err(_) => true,
            };
            if settled {
                report.stale_results.push(key);
            }
        }

        for key in self.medium.list(&Namespace::Locks.prefix()).await? {
            let Some(bytes) = self.medium.get(&key).await? else {
                continue;
            };
            if keys::resource_of_lock(&key).is_some() {
                if lock_is_stale(&bytes) {
                    report.expired_locks.push(key);
                }
            } else if ticket_is_dead(&bytes) {
                report.dead_tickets.push(key);
            }
        }

        for key in self.medium.list(&Namespace::Claims.prefix()).await? {
            let known = keys::task_id_of(&key).is_some_and(|id| pending.contains(&id));
            // A task published since the pending listing is not dangling.
            if !known && self.claim_is_dangling(&key).await? {
                report.dangling_claims.push(key);
            }
        }

        hlog_debug!(
            "Sweep scan found {} leftover record(s)",
            report.detected_count()
        );
        Ok(report)
    }

    /// Scan, then remove everything detected.
    pub async fn sweep(&self, ledger: Option<&Ledger>) -> Result<SweepReport> {
        let report = self.scan(ledger).await?;
        Ok(self.remove(report).await)
    }

    /// Remove what `scan` detected. Claims, locks and tickets are judged
    /// again first and left alone if they came back to life.
    pub async fn remove(&self, mut report: SweepReport) -> SweepReport {
        let plain = report
            .orphaned_descriptors
            .iter()
            .chain(&report.stale_results)
            .cloned()
            .collect::<Vec<_>>();
        for key in plain {
            match self.medium.delete(&key).await {
                Ok(_) => report.removed.push(key),
                Err(e) => report.failed.push((key, e.to_string())),
            }
        }

        for key in report.dangling_claims.clone() {
            match self.claim_is_dangling(&key).await {
                Ok(true) => match self.medium.delete(&key).await {
                    Ok(_) => report.removed.push(key),
                    Err(e) => report.failed.push((key, e.to_string())),
                },
                Ok(false) => hlog_debug!("{} has a task again; left alone", key),
                Err(e) => report.failed.push((key, e.to_string())),
            }
        }

        let guarded = report
            .expired_locks
            .iter()
            .map(|k| (k.clone(), lock_is_stale as fn(&[u8]) -> bool))
            .chain(
                report
                    .dead_tickets
                    .iter()
                    .map(|k| (k.clone(), ticket_is_dead as fn(&[u8]) -> bool)),
            )
            .collect::<Vec<_>>();
        for (key, still_stale) in guarded {
            match self.remove_if(&key, still_stale).await {
                Ok(true) => report.removed.push(key),
                Ok(false) => hlog_debug!("{} changed since the scan; left alone", key),
                Err(e) => report.failed.push((key, e.to_string())),
            }
        }

        if report.removed_count() > 0 {
            hlog!("Sweep removed {} record(s)", report.removed_count());
        }
        for (key, reason) in &report.failed {
            hlog_warn!("Sweep could not remove {}: {}", key, reason);
        }
        report
    }

    async fn claim_is_dangling(&self, claim_key: &str) -> Result<bool> {
        let Some(task_id) = keys::task_id_of(claim_key) else {
            return Ok(true);
        };
        Ok(self.medium.get(&keys::pending(&task_id)).await?.is_none())
    }

    /// Delete `key` only if its current content still satisfies `stale`.
    async fn remove_if(&self, key: &str, stale: fn(&[u8]) -> bool) -> Result<bool> {
        let Some(current) = self.medium.get(key).await? else {
            return Ok(false);
        };
        if !stale(&current) {
            return Ok(false);
        }
        self.medium.compare_and_swap(key, &current, None).await
    }
}

fn lock_is_stale(bytes: &[u8]) -> bool {
    LockToken::from_bytes(bytes).map_or(true, |t| t.is_expired())
}

fn ticket_is_dead(bytes: &[u8]) -> bool {
    QueueTicket::from_bytes(bytes).map_or(true, |t| t.is_dead())
}
