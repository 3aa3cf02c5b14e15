//! # Clock
//!
//! Time source and one-shot timers, injectable so the scheduler and syncer
//! can be driven deterministically in tests.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

/// Source of the current time and of wakeup timers.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    /// Arms a one-shot timer that calls `notify_one` on `wakeup` once `delay`
    /// has elapsed. A non-positive delay fires as soon as possible.
    fn after(&self, delay: Duration, wakeup: Arc<Notify>) -> TimerHandle;
}

/// Handle to an armed timer. Stopping or dropping it disarms the timer.
#[derive(Debug, Default)]
pub struct TimerHandle(Option<JoinHandle<()>>);

impl TimerHandle {
    /// A handle that is not attached to any timer.
    pub fn inert() -> Self {
        Self(None)
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wall clock backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn after(&self, delay: Duration, wakeup: Arc<Notify>) -> TimerHandle {
        let delay = delay.to_std().unwrap_or_default();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => TimerHandle(Some(runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                wakeup.notify_one();
            }))),
            Err(_) => {
                warn!(?delay, "No tokio runtime available; timer not armed");
                TimerHandle::inert()
            }
        }
    }
}

/// Manually driven clock. Timers never fire on their own; the requested
/// delays are recorded so tests can assert on them.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    delays: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
            delays: Mutex::new(Vec::new()),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    /// Delays of every timer armed so far, oldest first.
    pub fn armed_delays(&self) -> Vec<Duration> {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear_armed_delays(&self) {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn after(&self, delay: Duration, _wakeup: Arc<Notify>) -> TimerHandle {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(delay);
        TimerHandle::inert()
    }
}
