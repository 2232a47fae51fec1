//! Task Ledger: the authoritative state machine per logical request.
//!
//! Every mutation is a compare-and-swap on the entry's current state. That is
//! what keeps a late-arriving result and a deadline-driven abandonment from
//! both winning: whichever calls `end_attempt` second gets `Conflict`.
//!
//! The ledger lives in the orchestrating process. With a medium attached,
//! each entry is also persisted to `ledger/<request_id>.entry` so a restarted
//! orchestrator (and the sweeper) can see which tasks are still live.

mod entry;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

pub use entry::{Attempt, AttemptOutcome, LedgerEntry, RequestState, TransitionRecord};

use crate::core::{RequestId, TaskId};
use crate::medium::{keys, Medium, Namespace};
use crate::{hlog_debug, hlog_warn, Error, Result};

/// One entry behind its own lock, so persisting one request never stalls
/// another.
type Slot = Arc<Mutex<LedgerEntry>>;

pub struct Ledger {
    entries: Mutex<HashMap<RequestId, Slot>>,
    medium: Option<Arc<dyn Medium>>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    /// In-memory ledger.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            medium: None,
        }
    }

    /// Ledger that persists every entry to the medium.
    pub fn with_medium(medium: Arc<dyn Medium>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            medium: Some(medium),
        }
    }

    /// Restore the non-archived entries persisted on `medium`.
    pub async fn load(medium: Arc<dyn Medium>) -> Result<Self> {
        let mut entries = HashMap::new();
        for key in medium.list(&Namespace::Ledger.prefix()).await? {
            let Some(bytes) = medium.get(&key).await? else {
                continue;
            };
            match LedgerEntry::from_bytes(&bytes) {
                Ok(entry) => {
                    entries.insert(entry.request_id.clone(), Arc::new(Mutex::new(entry)));
                }
                Err(e) => hlog_warn!("Skipping unreadable ledger entry {}: {}", key, e),
            }
        }
        hlog_debug!("Loaded {} ledger entries", entries.len());
        Ok(Self {
            entries: Mutex::new(entries),
            medium: Some(medium),
        })
    }

    /// Register a new logical request in PENDING.
    pub async fn create(&self, request_id: &RequestId) -> Result<LedgerEntry> {
        let entry = LedgerEntry::new(request_id.clone());
        let slot: Slot = Arc::new(Mutex::new(entry.clone()));
        // Readers of the new entry wait until it is persisted.
        let _guard = slot.lock().await;
        {
            let mut entries = self.entries.lock().await;
            if entries.contains_key(request_id) {
                return Err(Error::RequestExists(request_id.clone()));
            }
            entries.insert(request_id.clone(), slot.clone());
        }
        if let Err(e) = self.persist(&entry).await {
            self.forget(request_id, &slot).await;
            return Err(e);
        }
        Ok(entry)
    }

    pub async fn get(&self, request_id: &RequestId) -> Result<LedgerEntry> {
        let slot = self.slot(request_id).await?;
        let entry = slot.lock().await.clone();
        Ok(entry)
    }

    /// All entries, ordered by creation time.
    pub async fn entries(&self) -> Vec<LedgerEntry> {
        let mut all = Vec::new();
        for slot in self.slots().await {
            all.push(slot.lock().await.clone());
        }
        all.sort_by_key(|e| e.created_at);
        all
    }

    /// Move `from` -> `to`, failing with `Conflict` if the entry is elsewhere.
    pub async fn transition(
        &self,
        request_id: &RequestId,
        from: RequestState,
        to: RequestState,
    ) -> Result<LedgerEntry> {
        self.mutate(request_id, |entry| {
            expect_state(entry, from)?;
            check_transition(from, to)?;
            entry.record(to);
            Ok(())
        })
        .await
    }

    /// Start a task attempt, making `task_id` the one live task.
    ///
    /// Fails with `Conflict` if another task is still live. `from == to`
    /// records the attempt without a state change.
    pub async fn begin_attempt(
        &self,
        request_id: &RequestId,
        from: RequestState,
        to: RequestState,
        task_id: TaskId,
        provider: &str,
    ) -> Result<LedgerEntry> {
        self.mutate(request_id, |entry| {
            expect_state(entry, from)?;
            if let Some(live) = entry.current_task_id {
                return Err(Error::Conflict {
                    request_id: entry.request_id.clone(),
                    expected: "no live task".to_string(),
                    actual: format!("live task {}", live),
                });
            }
            if from != to {
                check_transition(from, to)?;
            }
            entry.attempts.push(Attempt {
                task_id,
                provider: provider.to_string(),
                started_at: Utc::now(),
                outcome: None,
                ended_at: None,
            });
            entry.current_task_id = Some(task_id);
            entry.record(to);
            Ok(())
        })
        .await
    }

    /// End the live attempt `task_id` with `outcome`.
    ///
    /// Fails with `Conflict` if `task_id` is no longer live.
    pub async fn end_attempt(
        &self,
        request_id: &RequestId,
        task_id: TaskId,
        from: RequestState,
        to: RequestState,
        outcome: AttemptOutcome,
    ) -> Result<LedgerEntry> {
        self.mutate(request_id, |entry| {
            expect_state(entry, from)?;
            if !entry.is_live(&task_id) {
                return Err(Error::Conflict {
                    request_id: entry.request_id.clone(),
                    expected: format!("live task {}", task_id),
                    actual: match entry.current_task_id {
                        Some(live) => format!("live task {}", live),
                        None => "no live task".to_string(),
                    },
                });
            }
            if from != to {
                check_transition(from, to)?;
            }
            entry.record(to);
            entry.current_task_id = None;
            if let Some(attempt) = entry.attempts.iter_mut().rev().find(|a| a.task_id == task_id) {
                attempt.outcome = Some(outcome);
                attempt.ended_at = Some(Utc::now());
            }
            Ok(())
        })
        .await
    }

    /// Remove a terminal entry, moving it to `archive/` when persisted.
    pub async fn archive(&self, request_id: &RequestId) -> Result<LedgerEntry> {
        let slot = self.slot(request_id).await?;
        let entry = slot.lock().await;
        self.check_current(request_id, &slot).await?;
        if !entry.state.is_terminal() {
            return Err(Error::Validation(format!(
                "cannot archive {} in state {}",
                request_id, entry.state
            )));
        }
        if let Some(medium) = &self.medium {
            medium.put(&keys::archive(request_id), entry.to_bytes()?).await?;
            medium.delete(&keys::ledger(request_id)).await?;
        }
        self.forget(request_id, &slot).await;
        hlog_debug!("Archived request {} ({})", request_id, entry.state);
        Ok(entry.clone())
    }

    pub async fn is_live(&self, request_id: &RequestId, task_id: &TaskId) -> bool {
        let Ok(slot) = self.slot(request_id).await else {
            return false;
        };
        let entry = slot.lock().await;
        entry.is_live(task_id)
    }

    /// Every live task across all requests.
    pub async fn live_task_ids(&self) -> Vec<TaskId> {
        let mut live = Vec::new();
        for slot in self.slots().await {
            live.extend(slot.lock().await.current_task_id);
        }
        live
    }

    /// Every task whose late results are ghosts, across all requests.
    pub async fn abandoned_task_ids(&self) -> Vec<TaskId> {
        let mut abandoned = Vec::new();
        for slot in self.slots().await {
            abandoned.extend(slot.lock().await.abandoned_task_ids());
        }
        abandoned
    }

    async fn slot(&self, request_id: &RequestId) -> Result<Slot> {
        self.entries
            .lock()
            .await
            .get(request_id)
            .cloned()
            .ok_or_else(|| Error::RequestNotFound(request_id.clone()))
    }

    async fn slots(&self) -> Vec<Slot> {
        self.entries.lock().await.values().cloned().collect()
    }

    /// Fails with `RequestNotFound` if `slot` was archived while we waited
    /// for it. Lock order is always slot, then map.
    async fn check_current(&self, request_id: &RequestId, slot: &Slot) -> Result<()> {
        match self.entries.lock().await.get(request_id) {
            Some(current) if Arc::ptr_eq(current, slot) => Ok(()),
            _ => Err(Error::RequestNotFound(request_id.clone())),
        }
    }

    async fn forget(&self, request_id: &RequestId, slot: &Slot) {
        let mut entries = self.entries.lock().await;
        if entries.get(request_id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            entries.remove(request_id);
        }
    }

    async fn mutate<F>(&self, request_id: &RequestId, f: F) -> Result<LedgerEntry>
    where
        F: FnOnce(&mut LedgerEntry) -> Result<()>,
    {
        let slot = self.slot(request_id).await?;
        let mut current = slot.lock().await;
        self.check_current(request_id, &slot).await?;
        // Work on a copy so a failed persist leaves the entry untouched.
        let mut updated = current.clone();
        f(&mut updated)?;
        self.persist(&updated).await?;
        *current = updated.clone();
        Ok(updated)
    }

    async fn persist(&self, entry: &LedgerEntry) -> Result<()> {
        if let Some(medium) = &self.medium {
            medium.put(&keys::ledger(&entry.request_id), entry.to_bytes()?).await?;
        }
        Ok(())
    }
}

fn expect_state(entry: &LedgerEntry, expected: RequestState) -> Result<()> {
    if entry.state != expected {
        return Err(Error::Conflict {
            request_id: entry.request_id.clone(),
            expected: expected.to_string(),
            actual: entry.state.to_string(),
        });
    }
    Ok(())
}

fn check_transition(from: RequestState, to: RequestState) -> Result<()> {
    if !from.can_transition(to) {
        return Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    Ok(())
}
