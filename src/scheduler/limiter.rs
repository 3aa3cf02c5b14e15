//! Concurrency limiter whose limit can be changed while permits are out.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimiterState {
    pub limit: usize,
    pub in_flight: usize,
}

/// Bounds the number of concurrent fetches.
///
/// Lowering the limit never revokes granted permits; new acquisitions wait
/// until the in-flight count drops below the new limit.
#[derive(Debug)]
pub struct MutableLimiter {
    state: Mutex<LimiterState>,
    changed: Notify,
}

/// Releases its slot on drop.
#[derive(Debug)]
pub struct LimiterPermit {
    limiter: Arc<MutableLimiter>,
}

impl MutableLimiter {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LimiterState {
                limit,
                in_flight: 0,
            }),
            changed: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for a free slot. Cancel by dropping the future.
    pub async fn acquire(self: &Arc<Self>) -> LimiterPermit {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if let Some(permit) = self.try_acquire() {
                return permit;
            }
            changed.await;
        }
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<LimiterPermit> {
        let mut state = self.lock();
        if state.in_flight >= state.limit {
            return None;
        }
        state.in_flight += 1;
        Some(LimiterPermit {
            limiter: Arc::clone(self),
        })
    }

    pub fn set_limit(&self, limit: usize) {
        self.lock().limit = limit;
        self.changed.notify_waiters();
    }

    pub fn state(&self) -> LimiterState {
        *self.lock()
    }
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        {
            let mut state = self.limiter.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.limiter.changed.notify_waiters();
    }
}
