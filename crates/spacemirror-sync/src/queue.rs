//! Work queue feeding the reconciler workers
//!
//! The [`WorkQueue`] sits between the producers (loader walk, watcher
//! drain) and the reconciler workers.
//!
//! ## Guarantees
//!
//! - A path that is already pending is not queued twice.
//! - A path is never handed to two workers at once. While it is in flight
//!   a new request for it stays queued and is handed out after
//!   [`complete`](WorkQueue::complete).
//! - Failed paths go to a separate retry lane and become eligible again
//!   once their delay has elapsed, up to a bounded number of attempts.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Outcome of reporting a failed path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The path was put on the retry lane; this is its n-th retry
    Scheduled(u32),
    /// The retry budget is spent; the path was discarded
    Dropped,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<PathBuf>,
    queued: HashSet<PathBuf>,
    in_flight: HashSet<PathBuf>,
    retries: Vec<(Instant, PathBuf)>,
    attempts: HashMap<PathBuf, u32>,
}

impl QueueState {
    /// Moves every due retry to the back of the pending queue
    fn promote_due_retries(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.retries.len() {
            if self.retries[i].0 <= now {
                let (_, path) = self.retries.swap_remove(i);
                if self.queued.insert(path.clone()) {
                    self.pending.push_back(path);
                }
            } else {
                i += 1;
            }
        }
    }

    /// Earliest moment a retry becomes due
    fn next_retry(&self) -> Option<Instant> {
        self.retries.iter().map(|(at, _)| *at).min()
    }

    fn take_next(&mut self) -> Option<PathBuf> {
        let index = self
            .pending
            .iter()
            .position(|path| !self.in_flight.contains(path))?;
        let path = self.pending.remove(index)?;
        self.queued.remove(&path);
        self.in_flight.insert(path.clone());
        Some(path)
    }
}

/// Multi-producer, multi-consumer queue of paths to reconcile
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `path` unless it is already pending
    ///
    /// Returns true if the path was added.
    pub fn push(&self, path: PathBuf) -> bool {
        let added = {
            let mut state = self.lock();
            if state.queued.insert(path.clone()) {
                state.pending.push_back(path);
                true
            } else {
                false
            }
        };
        if added {
            self.notify.notify_one();
        }
        added
    }

    /// Hands out the next eligible path without waiting
    pub fn try_pop(&self) -> Option<PathBuf> {
        let mut state = self.lock();
        state.promote_due_retries(Instant::now());
        state.take_next()
    }

    /// Waits for the next eligible path
    ///
    /// Returns `None` once `cancel` fires. Wakes at least every `idle_poll`
    /// to pick up retries that became due.
    pub async fn pop(&self, cancel: &CancellationToken, idle_poll: Duration) -> Option<PathBuf> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(path) = self.try_pop() {
                return Some(path);
            }

            let wake_at = {
                let state = self.lock();
                let idle = Instant::now() + idle_poll;
                state.next_retry().map_or(idle, |at| at.min(idle))
            };
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    /// Marks a handed-out path as successfully processed
    pub fn complete(&self, path: &Path) {
        {
            let mut state = self.lock();
            state.in_flight.remove(path);
            state.attempts.remove(path);
        }
        // A request for the same path may have been waiting on it
        self.notify.notify_one();
    }

    /// Marks a handed-out path as failed and decides whether to retry it
    pub fn fail(&self, path: &Path, max_retries: u32, delay: Duration) -> RetryOutcome {
        let outcome = {
            let mut state = self.lock();
            state.in_flight.remove(path);
            let attempts = state.attempts.entry(path.to_path_buf()).or_insert(0);
            *attempts += 1;
            if *attempts > max_retries {
                state.attempts.remove(path);
                RetryOutcome::Dropped
            } else {
                let attempt = *attempts;
                state
                    .retries
                    .push((Instant::now() + delay, path.to_path_buf()));
                RetryOutcome::Scheduled(attempt)
            }
        };
        trace!(path = %path.display(), ?outcome, "Path failed");
        self.notify.notify_one();
        outcome
    }

    /// Paths waiting to be handed out, retries included
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.pending.len() + state.retries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Paths currently being processed
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Returns true when nothing is pending, retrying or in flight
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.pending.is_empty() && state.retries.is_empty() && state.in_flight.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
