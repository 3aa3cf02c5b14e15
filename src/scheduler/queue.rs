//! Priority queue of repos waiting for a fetch.
//!
//! Order: entries not yet dispatched first, then higher priority, then
//! insertion sequence. An entry stays in the queue, flagged `updating`, for
//! as long as its fetch is in flight.

use super::heap::{HeapItem, IndexedHeap};
use crate::types::{ConfiguredRepo, RepoId};
use metrics::gauge;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Fetch priority. Manual requests jump ahead of scheduled ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    High,
}

/// A queued fetch request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepoUpdate {
    pub repo: ConfiguredRepo,
    pub priority: Priority,
    /// Enqueue order; ties within a priority are served first-in first-out
    pub seq: u64,
    pub updating: bool,
}

impl HeapItem for RepoUpdate {
    type Key = RepoId;

    fn key(&self) -> RepoId {
        self.repo.id
    }

    fn less(&self, other: &Self) -> bool {
        if self.updating != other.updating {
            return other.updating;
        }
        if self.priority != other.priority {
            return self.priority > other.priority;
        }
        self.seq < other.seq
    }
}

/// Position of a repo in the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntryInfo {
    pub index: usize,
    pub total: usize,
    pub updating: bool,
    pub priority: Priority,
}

#[derive(Default)]
struct QueueState {
    heap: IndexedHeap<RepoUpdate>,
    seq: u64,
}

impl QueueState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

#[derive(Default)]
pub struct UpdateQueue {
    state: Mutex<QueueState>,
    enqueued: Notify,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `repo` at `priority`, or refreshes an existing idle entry.
    ///
    /// Returns `true` when an entry for the repo was already queued and not
    /// in flight. An existing entry is only ever promoted: a higher priority
    /// moves it behind every entry already at that priority, an equal or
    /// lower one leaves its position alone. Entries in flight are untouched.
    ///
    /// # Panics
    ///
    /// Panics if `repo.id` is zero.
    pub fn enqueue(&self, repo: ConfiguredRepo, priority: Priority) -> bool {
        assert!(!repo.id.is_zero(), "cannot enqueue repo {:?} with zero id", repo.name);

        let mut state = self.lock();
        let id = repo.id;
        let Some(existing) = state.heap.get(id) else {
            let seq = state.next_seq();
            state.heap.push(RepoUpdate {
                repo,
                priority,
                seq,
                updating: false,
            });
            report_len(state.heap.len());
            drop(state);
            self.enqueued.notify_one();
            return false;
        };

        if existing.updating {
            return false;
        }

        if priority <= existing.priority {
            state.heap.update(id, |update| update.repo = repo);
            return true;
        }

        let seq = state.next_seq();
        state.heap.update(id, |update| {
            update.repo = repo;
            update.priority = priority;
            update.seq = seq;
        });
        drop(state);
        self.enqueued.notify_one();
        true
    }

    /// Marks the front entry as in flight and returns it. Returns `None` when
    /// the queue is empty or everything in it is already in flight.
    pub fn acquire_next(&self) -> Option<ConfiguredRepo> {
        let mut state = self.lock();
        let front = state.heap.peek()?;
        if front.updating {
            return None;
        }
        let repo = front.repo.clone();
        state.heap.update(repo.id, |update| update.updating = true);
        Some(repo)
    }

    /// Removes the entry for `id` if its in-flight flag equals `updating`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is zero.
    pub fn remove(&self, id: RepoId, updating: bool) -> bool {
        assert!(!id.is_zero(), "cannot remove repo with zero id");

        let mut state = self.lock();
        let matches = state.heap.get(id).is_some_and(|u| u.updating == updating);
        if !matches {
            return false;
        }
        state.heap.remove(id);
        report_len(state.heap.len());
        true
    }

    /// Empties the queue and forgets any pending wakeup.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.heap.clear();
        state.seq = 0;
        report_len(0);
        super::drain_permit(&self.enqueued);
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn info(&self, id: RepoId) -> Option<QueueEntryInfo> {
        let state = self.lock();
        let update = state.heap.get(id)?;
        Some(QueueEntryInfo {
            index: state.heap.position(id)?,
            total: state.heap.len(),
            updating: update.updating,
            priority: update.priority,
        })
    }

    /// Copies of every entry, in heap order.
    pub fn snapshot(&self) -> Vec<RepoUpdate> {
        self.lock().heap.iter().cloned().collect()
    }

    /// Resolves after something new became available for dispatch.
    pub async fn wait_enqueued(&self) {
        self.enqueued.notified().await;
    }
}

fn report_len(len: usize) {
    gauge!("reposync_scheduler_update_queue_length").set(len as f64);
}
