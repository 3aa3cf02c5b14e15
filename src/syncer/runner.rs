//! Periodic sync-job runner.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use metrics::{counter, histogram};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{SyncError, Syncer, SyncJobProgressRecorder};
use crate::store::ListExternalServicesOptions;
use crate::types::ExternalServiceId;

/// Removes a service from the running set when its job ends.
struct RunningGuard {
    running: Arc<Mutex<HashSet<ExternalServiceId>>>,
    id: ExternalServiceId,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl Syncer {
    /// Syncs due external services until `shutdown` is cancelled.
    ///
    /// Jobs left over by a previous process are marked errored first, then
    /// every stored repo is published so listeners start from the full set.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        match self.store.reset_interrupted_sync_jobs().await {
            Ok(0) => {}
            Ok(n) => warn!(count = n, "Marked interrupted sync jobs as errored"),
            Err(e) => error!(error = %e, "Failed to reset interrupted sync jobs"),
        }
        match self.initial_unmodified_diff_from_store().await {
            Ok(count) => info!(repos = count, "Published stored repos"),
            Err(e) => error!(error = %e, "Failed to publish stored repos"),
        }

        let limit = self.config.concurrent_external_service_syncers.max(1);
        let permits = Arc::new(Semaphore::new(limit));
        let running = Arc::new(Mutex::new(HashSet::new()));
        let mut jobs = JoinSet::new();
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
            self.config.enqueue_interval_seconds.max(1),
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            concurrency = limit,
            interval_seconds = self.config.enqueue_interval_seconds,
            "Starting sync job runner"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.trigger.notified() => {}
            }

            while jobs.try_join_next().is_some() {}

            if let Err(e) = self.start_due_jobs(&permits, &running, &mut jobs).await {
                counter!("reposync_syncer_errors_total", "kind" => "enqueue").increment(1);
                error!(error = %e, "Failed to look up due external services");
            }
        }

        jobs.shutdown().await;
        info!("Sync job runner stopped");
    }

    /// Makes an external service due now and wakes the runner.
    pub async fn trigger_external_service_sync(
        &self,
        id: ExternalServiceId,
    ) -> Result<(), SyncError> {
        self.store.set_next_sync_at(id, self.clock.now()).await?;
        self.trigger.notify_one();
        debug!(external_service_id = id, "Triggered external service sync");
        Ok(())
    }

    async fn start_due_jobs(
        self: &Arc<Self>,
        permits: &Arc<Semaphore>,
        running: &Arc<Mutex<HashSet<ExternalServiceId>>>,
        jobs: &mut JoinSet<()>,
    ) -> Result<(), SyncError> {
        let due = self
            .store
            .list_external_services(&ListExternalServicesOptions {
                due_before: Some(self.clock.now()),
                ..Default::default()
            })
            .await?;

        for svc in due {
            let newly_running = running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(svc.id);
            if !newly_running {
                continue;
            }
            let guard = RunningGuard {
                running: Arc::clone(running),
                id: svc.id,
            };
            let syncer = Arc::clone(self);
            let permits = Arc::clone(permits);
            jobs.spawn(async move {
                let _guard = guard;
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                syncer.run_sync_job(svc.id).await;
            });
        }
        Ok(())
    }

    async fn run_sync_job(&self, id: ExternalServiceId) {
        let job = match self.store.create_sync_job(id).await {
            Ok(job) => job,
            Err(e) => {
                error!(external_service_id = id, error = %e, "Failed to create sync job");
                return;
            }
        };

        let recorder = SyncJobProgressRecorder::new(self.store.clone(), job.id);
        let started = Instant::now();
        let result = self
            .sync_external_service(id, self.min_sync_interval(), &recorder)
            .await;
        let state = if result.is_ok() { "completed" } else { "errored" };
        histogram!("reposync_syncer_sync_duration_seconds", "state" => state)
            .record(started.elapsed().as_secs_f64());

        let failure = match &result {
            Ok(()) => None,
            Err(e) => {
                warn!(external_service_id = id, job_id = job.id, error = %e, "Sync job errored");
                Some(e.to_string())
            }
        };
        if let Err(e) = self
            .store
            .finish_sync_job(job.id, &recorder.latest(), failure)
            .await
        {
            error!(job_id = job.id, error = %e, "Failed to finish sync job");
        }
    }
}
