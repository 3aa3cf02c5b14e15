//! Periodic pass that keeps the schedule in step with the store.
//!
//! Sync diffs normally keep the schedule current, but a diff can be lost
//! (the channel was full, the process restarted mid-pass). Each pass lists
//! every live stored repo and schedules the ones the schedule does not know.
//! Repos created since the previous pass cannot have been cloned yet and are
//! pulled to the front.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::UpdateScheduler;
use crate::store::{ListReposOptions, Store, StoreError};
use crate::types::ConfiguredRepo;

/// Spacing between two passes when running in the background.
pub const DEFAULT_BACKFILL_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Outcome of one backfill pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillPass {
    /// Live repos handed to the schedule
    pub scheduled: usize,
    /// Repos created since the previous pass
    pub fresh: usize,
}

pub struct ScheduleBackfill {
    store: Store,
    scheduler: Arc<UpdateScheduler>,
    /// Newest creation time seen so far; unset before the first pass.
    watermark: Option<DateTime<Utc>>,
}

impl ScheduleBackfill {
    pub fn new(store: Store, scheduler: Arc<UpdateScheduler>) -> Self {
        Self {
            store,
            scheduler,
            watermark: None,
        }
    }

    /// Schedules every live stored repo. The first pass only records the
    /// newest creation time; later ones prioritise repos created after it.
    pub async fn pass(&mut self) -> Result<BackfillPass, StoreError> {
        let repos = self.store.list_repos(&ListReposOptions::default()).await?;

        let configured: Vec<ConfiguredRepo> = repos.iter().map(|r| r.configured()).collect();
        self.scheduler.ensure_scheduled(&configured);

        let fresh: Vec<ConfiguredRepo> = match self.watermark {
            Some(watermark) => repos
                .iter()
                .filter(|r| r.created_at.is_some_and(|created| created > watermark))
                .map(|r| r.configured())
                .collect(),
            None => Vec::new(),
        };
        if !fresh.is_empty() {
            self.scheduler.prioritise_uncloned(&fresh);
        }

        let newest = repos.iter().filter_map(|r| r.created_at).max();
        self.watermark = self.watermark.max(newest);

        Ok(BackfillPass {
            scheduled: configured.len(),
            fresh: fresh.len(),
        })
    }

    /// Runs a pass every `every` until `shutdown` is cancelled.
    pub async fn run(mut self, every: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_seconds = every.as_secs(), "Starting schedule backfill");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.pass().await {
                Ok(pass) => debug!(
                    scheduled = pass.scheduled,
                    fresh = pass.fresh,
                    "Backfilled schedule from store"
                ),
                Err(e) => {
                    counter!("reposync_scheduler_backfill_errors_total").increment(1);
                    error!(error = %e, "Failed to list stored repos for the schedule");
                }
            }
        }
        info!("Schedule backfill stopped");
    }
}
