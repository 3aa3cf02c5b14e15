//! Progress reporting for sync passes.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::store::Store;
use crate::types::SyncProgress;

/// Receives the running counters of a sync pass.
#[async_trait]
pub trait ProgressRecorder: Send + Sync {
    /// `last` is set on the final call of a pass.
    async fn record(&self, progress: &SyncProgress, last: bool);
}

/// Discards progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgressRecorder;

#[async_trait]
impl ProgressRecorder for NoopProgressRecorder {
    async fn record(&self, _progress: &SyncProgress, _last: bool) {}
}

/// Writes progress onto a `sync_jobs` row and remembers the latest counters
/// so the job can be closed with them.
pub struct SyncJobProgressRecorder {
    store: Store,
    job_id: i32,
    latest: Mutex<SyncProgress>,
}

impl SyncJobProgressRecorder {
    pub fn new(store: Store, job_id: i32) -> Self {
        Self {
            store,
            job_id,
            latest: Mutex::new(SyncProgress::default()),
        }
    }

    pub fn latest(&self) -> SyncProgress {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ProgressRecorder for SyncJobProgressRecorder {
    async fn record(&self, progress: &SyncProgress, last: bool) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = *progress;
        if let Err(e) = self.store.record_sync_progress(self.job_id, progress).await {
            tracing::warn!(job_id = self.job_id, last, error = %e, "Failed to record sync progress");
        }
    }
}

/// Spaces out progress writes of one pass.
#[derive(Debug)]
pub(crate) struct ProgressThrottle {
    every: Duration,
    last: Option<DateTime<Utc>>,
}

impl ProgressThrottle {
    pub(crate) fn new(every: Duration) -> Self {
        Self { every, last: None }
    }

    /// True when a write is due at `now`; marks it as done.
    pub(crate) fn ready(&mut self, now: DateTime<Utc>) -> bool {
        match self.last {
            Some(last) if now - last < self.every => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
