//! Min-heap of repos keyed by their next due time, with a single timer armed
//! for the earliest entry.

use super::heap::{HeapItem, IndexedHeap};
use crate::clock::{Clock, TimerHandle};
use crate::types::{ConfiguredRepo, RepoId};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Serialize, Serializer};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Shortest interval between two scheduled fetches of the same repo.
pub fn min_delay() -> Duration {
    Duration::seconds(45)
}

/// Longest interval between two scheduled fetches of the same repo.
pub fn max_delay() -> Duration {
    Duration::hours(8)
}

/// Clamps `interval` into `[min_delay, max_delay]`.
pub fn clamp_interval(interval: Duration) -> Duration {
    interval.clamp(min_delay(), max_delay())
}

/// Spreads `interval` uniformly by up to 5% either way, then clamps again so
/// the result still respects the bounds.
pub fn jitter_interval<R: Rng + ?Sized>(interval: Duration, rng: &mut R) -> Duration {
    let spread = interval.num_milliseconds() / 20;
    if spread <= 0 {
        return clamp_interval(interval);
    }
    let offset = rng.gen_range(-spread..=spread);
    clamp_interval(interval + Duration::milliseconds(offset))
}

/// A repo's place in the schedule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledRepoUpdate {
    pub repo: ConfiguredRepo,
    #[serde(rename = "interval_seconds", serialize_with = "serialize_seconds")]
    pub interval: Duration,
    pub due: DateTime<Utc>,
}

impl HeapItem for ScheduledRepoUpdate {
    type Key = RepoId;

    fn key(&self) -> RepoId {
        self.repo.id
    }

    fn less(&self, other: &Self) -> bool {
        self.due < other.due
    }
}

fn serialize_seconds<S: Serializer>(interval: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_i64(interval.num_seconds())
}

/// Position of a repo in the schedule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleEntryInfo {
    pub interval_seconds: i64,
    pub due: DateTime<Utc>,
    pub index: usize,
    pub total: usize,
}

#[derive(Default)]
struct ScheduleState {
    heap: IndexedHeap<ScheduledRepoUpdate>,
    timer: TimerHandle,
}

pub struct Schedule {
    state: Mutex<ScheduleState>,
    clock: Arc<dyn Clock>,
    wakeup: Arc<Notify>,
}

impl Schedule {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(ScheduleState::default()),
            clock,
            wakeup: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScheduleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signalled when the earliest entry comes due.
    pub fn wakeup(&self) -> &Notify {
        &self.wakeup
    }

    /// Adds `repo` due after the minimum delay, or refreshes the name of an
    /// existing entry. Returns `true` when the entry already existed.
    pub fn upsert(&self, repo: ConfiguredRepo) -> bool {
        let mut state = self.lock();
        if state.heap.update(repo.id, |update| update.repo = repo.clone()) {
            return true;
        }
        self.push_new(&mut state, repo);
        self.reschedule_timer(&mut state);
        false
    }

    /// Adds every repo not yet scheduled, due after the minimum delay.
    pub fn insert_new(&self, repos: &[ConfiguredRepo]) {
        let mut state = self.lock();
        let mut inserted = false;
        for repo in repos {
            if state.heap.contains(repo.id) {
                continue;
            }
            self.push_new(&mut state, repo.clone());
            inserted = true;
        }
        if inserted {
            self.reschedule_timer(&mut state);
        }
    }

    /// Treats `repos` as not yet cloned: each is made due no later than the
    /// minimum delay from now, inserting it when absent.
    pub fn prioritise_uncloned(&self, repos: &[ConfiguredRepo]) {
        let mut state = self.lock();
        let due = self.clock.now() + min_delay();
        let mut changed = false;
        for repo in repos {
            let pulled_forward = state.heap.get(repo.id).map(|update| update.due > due);
            match pulled_forward {
                None => {
                    state.heap.push(ScheduledRepoUpdate {
                        repo: repo.clone(),
                        interval: min_delay(),
                        due,
                    });
                    changed = true;
                }
                Some(true) => {
                    state.heap.update(repo.id, |update| update.due = due);
                    changed = true;
                }
                Some(false) => {}
            }
        }
        if changed {
            self.reschedule_timer(&mut state);
        }
    }

    /// Sets the repo's interval, clamped and jittered, and makes it due one
    /// interval from now. Unknown repos are ignored.
    pub fn update_interval(&self, id: RepoId, interval: Duration) {
        self.update_interval_with(id, interval, &mut rand::thread_rng());
    }

    pub(crate) fn update_interval_with<R: Rng + ?Sized>(
        &self,
        id: RepoId,
        interval: Duration,
        rng: &mut R,
    ) {
        let interval = jitter_interval(clamp_interval(interval), rng);
        let due = self.clock.now() + interval;
        let mut state = self.lock();
        if state.heap.update(id, |update| {
            update.interval = interval;
            update.due = due;
        }) {
            self.reschedule_timer(&mut state);
        }
    }

    pub fn current_interval(&self, id: RepoId) -> Option<Duration> {
        self.lock().heap.get(id).map(|update| update.interval)
    }

    /// Drops the repo from the schedule, re-arming the timer when it was the
    /// earliest entry.
    pub fn remove(&self, id: RepoId) -> bool {
        let mut state = self.lock();
        match state.heap.remove(id) {
            Some((0, _)) => {
                self.reschedule_timer(&mut state);
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Collects every entry due within the next millisecond and pushes each
    /// one interval into the future.
    pub fn take_due(&self) -> Vec<ConfiguredRepo> {
        let mut state = self.lock();
        let mut due = Vec::new();
        loop {
            let now = self.clock.now();
            let Some(front) = state.heap.peek() else {
                break;
            };
            if front.due >= now + Duration::milliseconds(1) {
                break;
            }
            let (repo, next) = (front.repo.clone(), now + front.interval);
            state.heap.update(repo.id, |update| update.due = next);
            due.push(repo);
        }
        self.reschedule_timer(&mut state);
        due
    }

    /// Empties the schedule, stops the timer and forgets a wakeup it
    /// already delivered.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.heap.clear();
        state.timer.stop();
        super::drain_permit(&self.wakeup);
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn info(&self, id: RepoId) -> Option<ScheduleEntryInfo> {
        let state = self.lock();
        let update = state.heap.get(id)?;
        Some(ScheduleEntryInfo {
            interval_seconds: update.interval.num_seconds(),
            due: update.due,
            index: state.heap.position(id)?,
            total: state.heap.len(),
        })
    }

    /// Copies of every entry, in heap order.
    pub fn snapshot(&self) -> Vec<ScheduledRepoUpdate> {
        self.lock().heap.iter().cloned().collect()
    }

    fn push_new(&self, state: &mut ScheduleState, repo: ConfiguredRepo) {
        state.heap.push(ScheduledRepoUpdate {
            repo,
            interval: min_delay(),
            due: self.clock.now() + min_delay(),
        });
    }

    fn reschedule_timer(&self, state: &mut ScheduleState) {
        state.timer.stop();
        if let Some(front) = state.heap.peek() {
            let delay = front.due - self.clock.now();
            state.timer = self.clock.after(delay, self.wakeup.clone());
        }
    }
}
