use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use super::{Medium, MediumEvent};

/// Why a [`ChangeWaiter::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A relevant key changed (or notifications were lost).
    Changed,
    /// The timer fired.
    Elapsed,
    Cancelled,
}

/// Sleeps between polls, waking early on relevant medium changes.
///
/// Notifications are only a latency optimisation; every caller re-reads the
/// medium after waking, so a backend without notifications just polls.
pub struct ChangeWaiter {
    rx: Option<broadcast::Receiver<MediumEvent>>,
    poll_interval: Duration,
}

impl ChangeWaiter {
    pub fn new(medium: &dyn Medium, poll_interval: Duration) -> Self {
        Self {
            rx: medium.subscribe(),
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Wait for at most `min(poll_interval, max)`.
    pub async fn wait<F>(&mut self, max: Duration, cancel: &CancellationToken, interest: F) -> WaitOutcome
    where
        F: Fn(&MediumEvent) -> bool,
    {
        let sleep = tokio::time::sleep(self.poll_interval.min(max));
        tokio::pin!(sleep);

        loop {
            let Some(rx) = self.rx.as_mut() else {
                return tokio::select! {
                    biased;
                    _ = cancel.cancelled() => WaitOutcome::Cancelled,
                    _ = &mut sleep => WaitOutcome::Elapsed,
                };
            };

            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => return WaitOutcome::Cancelled,
                _ = &mut sleep => return WaitOutcome::Elapsed,
                msg = rx.recv() => msg,
            };

            match received {
                Ok(event) if interest(&event) => return WaitOutcome::Changed,
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => return WaitOutcome::Changed,
                Err(RecvError::Closed) => self.rx = None,
            }
        }
    }
}
