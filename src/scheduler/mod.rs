//! # Update Scheduler
//!
//! Decides when each known repo is fetched. Two structures cooperate:
//!
//! - the [`Schedule`], a heap keyed by due time. When its earliest entry
//!   comes due the schedule loop moves it into the update queue at low
//!   priority and pushes its due time one interval out.
//! - the [`UpdateQueue`], a priority heap drained by the update loop, which
//!   dispatches fetches as long as the [`MutableLimiter`] has room.
//!
//! After each fetch the repo's interval is recomputed: half the time since
//! it last changed on success, double the current interval on failure, or a
//! configured per-name override. Intervals are clamped to
//! `[45s, 8h]` and jittered by 5%.
//!
//! Manual requests ([`UpdateScheduler::update_once`]) enter the queue at
//! high priority without touching the schedule. A [`ScheduleBackfill`]
//! periodically schedules stored repos that no sync diff announced.

pub mod backfill;
mod heap;
pub mod interval;
pub mod limiter;
pub mod queue;
pub mod schedule;

pub use backfill::{BackfillPass, ScheduleBackfill};
pub use interval::IntervalRules;
pub use limiter::{LimiterState, MutableLimiter};
pub use queue::{Priority, QueueEntryInfo, RepoUpdate, UpdateQueue};
pub use schedule::{Schedule, ScheduleEntryInfo, ScheduledRepoUpdate};

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::gitserver::{GitserverError, RepoUpdateResponse, RepoUpdater};
use crate::syncer::Diff;
use crate::types::{ConfiguredRepo, RepoId};
use chrono::Duration;
use metrics::{counter, gauge};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Consumes a wakeup permit stored by an earlier `notify_one`, if any.
fn drain_permit(notify: &Notify) {
    let notified = notify.notified();
    tokio::pin!(notified);
    notified.as_mut().enable();
}

/// Freshness hint passed along with every fetch request.
const FETCH_SINCE: std::time::Duration = std::time::Duration::from_secs(1);

/// Live-reloadable scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_concurrent_updates: usize,
    pub interval_rules: IntervalRules,
}

impl SchedulerSettings {
    pub fn from_config(config: &SchedulerConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            max_concurrent_updates: config.max_concurrent_updates,
            interval_rules: IntervalRules::compile(&config.update_interval_rules)?,
        })
    }
}

/// Where a repo currently sits in the schedule and the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepoScheduleInfo {
    pub schedule: Option<ScheduleEntryInfo>,
    pub queue: Option<QueueEntryInfo>,
}

/// Point-in-time copy of the scheduler state for debugging.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerDump {
    pub schedule: Vec<ScheduledRepoUpdate>,
    pub update_queue: Vec<RepoUpdate>,
    pub limiter: LimiterState,
}

pub struct UpdateScheduler {
    schedule: Schedule,
    queue: UpdateQueue,
    limiter: Arc<MutableLimiter>,
    updater: Arc<dyn RepoUpdater>,
    settings: watch::Receiver<SchedulerSettings>,
}

impl UpdateScheduler {
    pub fn new(
        updater: Arc<dyn RepoUpdater>,
        clock: Arc<dyn Clock>,
        settings: watch::Receiver<SchedulerSettings>,
    ) -> Arc<Self> {
        let limit = settings.borrow().max_concurrent_updates;
        Arc::new(Self {
            schedule: Schedule::new(clock),
            queue: UpdateQueue::new(),
            limiter: MutableLimiter::new(limit),
            updater,
            settings,
        })
    }

    /// Runs the schedule loop, the update loop and the settings watcher
    /// until `shutdown` is cancelled. Both heaps are cleared on exit.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            limit = self.limiter.state().limit,
            "Starting update scheduler"
        );
        tokio::join!(
            Arc::clone(&self).run_schedule_loop(shutdown.clone()),
            Arc::clone(&self).run_update_loop(shutdown.clone()),
            Arc::clone(&self).watch_settings(shutdown),
        );
        info!("Update scheduler stopped");
    }

    /// Applies a sync diff: deleted repos are dropped, added and modified
    /// repos are scheduled and queued, unmodified repos are scheduled (or
    /// dropped when soft-deleted).
    pub fn update_from_diff(&self, diff: &Diff) {
        for repo in &diff.deleted {
            self.remove(repo.id);
        }
        for repo in diff.added.iter().chain(diff.modified.iter().map(|m| &m.repo)) {
            self.upsert(repo.configured(), true);
        }
        for repo in &diff.unmodified {
            if repo.is_deleted() {
                self.remove(repo.id);
            } else {
                self.upsert(repo.configured(), false);
            }
        }
        gauge!("reposync_scheduler_known_repos").set(self.schedule.len() as f64);
    }

    /// Schedules repos not yet known, leaving known ones alone.
    pub fn ensure_scheduled(&self, repos: &[ConfiguredRepo]) {
        self.schedule.insert_new(repos);
        gauge!("reposync_scheduler_known_repos").set(self.schedule.len() as f64);
    }

    /// Moves repos that are not cloned yet to the front of the schedule.
    pub fn prioritise_uncloned(&self, repos: &[ConfiguredRepo]) {
        self.schedule.prioritise_uncloned(repos);
    }

    /// Requests a fetch of `repo` as soon as possible.
    pub fn update_once(&self, repo: ConfiguredRepo) {
        counter!("reposync_scheduler_manual_fetch_total").increment(1);
        let updated = self.queue.enqueue(repo.clone(), Priority::High);
        debug!(repo = %repo.name, updated, "Enqueued manual repo update");
    }

    pub fn schedule_info(&self, id: RepoId) -> RepoScheduleInfo {
        RepoScheduleInfo {
            schedule: self.schedule.info(id),
            queue: self.queue.info(id),
        }
    }

    pub fn debug_dump(&self) -> SchedulerDump {
        SchedulerDump {
            schedule: self.schedule.snapshot(),
            update_queue: self.queue.snapshot(),
            limiter: self.limiter.state(),
        }
    }

    fn upsert(&self, repo: ConfiguredRepo, enqueue: bool) {
        let updated = self.schedule.upsert(repo.clone());
        debug!(repo = %repo.name, updated, "Upserted repo into schedule");
        if enqueue {
            let updated = self.queue.enqueue(repo.clone(), Priority::Low);
            debug!(repo = %repo.name, updated, "Enqueued repo update");
        }
    }

    fn remove(&self, id: RepoId) {
        if self.schedule.remove(id) {
            debug!(repo_id = %id, "Removed repo from schedule");
        }
        if self.queue.remove(id, false) {
            debug!(repo_id = %id, "Removed repo from update queue");
        }
    }

    /// Moves every due schedule entry into the update queue.
    pub(crate) fn enqueue_due(&self) -> usize {
        let due = self.schedule.take_due();
        for repo in &due {
            counter!("reposync_scheduler_auto_fetch_total").increment(1);
            self.queue.enqueue(repo.clone(), Priority::Low);
        }
        due.len()
    }

    async fn run_schedule_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.schedule.wakeup().notified() => {}
            }
            counter!("reposync_scheduler_loops_total", "loop" => "schedule").increment(1);
            let enqueued = self.enqueue_due();
            if enqueued > 0 {
                debug!(enqueued, "Moved due repos into update queue");
            }
        }
        self.schedule.reset();
    }

    async fn run_update_loop(self: Arc<Self>, shutdown: CancellationToken) {
        'outer: loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.queue.wait_enqueued() => {}
            }
            counter!("reposync_scheduler_loops_total", "loop" => "update").increment(1);

            loop {
                let permit = tokio::select! {
                    _ = shutdown.cancelled() => break 'outer,
                    permit = self.limiter.acquire() => permit,
                };
                let Some(repo) = self.queue.acquire_next() else {
                    break;
                };

                let this = Arc::clone(&self);
                let cancel = shutdown.child_token();
                tokio::spawn(async move {
                    let _permit = permit;
                    let _dequeue = scopeguard::guard(repo.id, |id| {
                        this.queue.remove(id, true);
                    });
                    this.update_repo(&repo, cancel).await;
                });
            }
        }
        self.queue.reset();
    }

    async fn watch_settings(self: Arc<Self>, shutdown: CancellationToken) {
        let mut settings = self.settings.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                changed = settings.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            let limit = settings.borrow_and_update().max_concurrent_updates;
            self.limiter.set_limit(limit);
            info!(limit, "Updated repo update concurrency limit");
        }
    }

    #[instrument(skip_all, fields(repo = %repo.name))]
    async fn update_repo(&self, repo: &ConfiguredRepo, cancel: CancellationToken) {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            outcome = self.updater.request_repo_update(&repo.name, FETCH_SINCE) => outcome,
        };
        let interval = self.next_interval(repo, &outcome);
        self.schedule.update_interval(repo.id, interval);
    }

    fn next_interval(
        &self,
        repo: &ConfiguredRepo,
        outcome: &Result<RepoUpdateResponse, GitserverError>,
    ) -> Duration {
        let failed = match outcome {
            Err(err) if err.is_rate_limited() => {
                counter!("reposync_scheduler_errors_total", "kind" => "rate_limited").increment(1);
                debug!(error = %err, "Repo update rate limited");
                true
            }
            Err(err) => {
                counter!("reposync_scheduler_errors_total", "kind" => "request").increment(1);
                error!(error = %err, "Error requesting repo update");
                true
            }
            Ok(response) if !response.error.is_empty() => {
                counter!("reposync_scheduler_errors_total", "kind" => "response").increment(1);
                warn!(error = %response.error, "Repo update failed on git server");
                true
            }
            Ok(_) => false,
        };

        let custom = self
            .settings
            .borrow()
            .interval_rules
            .custom_interval(&repo.name);
        if let Some(interval) = custom {
            return interval;
        }

        let current = self
            .schedule
            .current_interval(repo.id)
            .unwrap_or_else(Duration::zero);
        if failed {
            return current * 2;
        }

        match outcome.as_ref().ok().and_then(interval::interval_from_fetch) {
            Some(interval) if interval < Duration::zero() => {
                warn!(
                    interval_seconds = interval.num_seconds(),
                    "Repo changed after it was fetched; using minimum interval"
                );
                interval
            }
            Some(interval) => interval,
            None => {
                debug!("Repo update response lacks fetch timestamps; keeping interval");
                current
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::Repo;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex;

    enum Reply {
        Fetched { fetched_after_change: Duration },
        Failed,
        RateLimited,
    }

    struct FakeUpdater {
        now: DateTime<Utc>,
        reply: Reply,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RepoUpdater for FakeUpdater {
        async fn request_repo_update(
            &self,
            repo: &str,
            _since: std::time::Duration,
        ) -> Result<RepoUpdateResponse, GitserverError> {
            self.calls.lock().unwrap().push(repo.to_string());
            match self.reply {
                Reply::Fetched {
                    fetched_after_change,
                } => Ok(RepoUpdateResponse {
                    last_fetched: Some(self.now + fetched_after_change),
                    last_changed: Some(self.now),
                    error: String::new(),
                }),
                Reply::Failed => Ok(RepoUpdateResponse {
                    error: "fatal: remote hung up".to_string(),
                    ..Default::default()
                }),
                Reply::RateLimited => Err(GitserverError::RateLimited { retry_after: None }),
            }
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn repo(id: i32, name: &str) -> Repo {
        Repo {
            id: RepoId(id),
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn settings(limit: usize) -> SchedulerSettings {
        SchedulerSettings {
            max_concurrent_updates: limit,
            interval_rules: IntervalRules::default(),
        }
    }

    fn setup(
        reply: Reply,
        settings: SchedulerSettings,
    ) -> (
        Arc<UpdateScheduler>,
        Arc<FakeUpdater>,
        watch::Sender<SchedulerSettings>,
    ) {
        let updater = Arc::new(FakeUpdater {
            now: start(),
            reply,
            calls: Mutex::new(Vec::new()),
        });
        let (tx, rx) = watch::channel(settings);
        let scheduler =
            UpdateScheduler::new(updater.clone(), Arc::new(ManualClock::new(start())), rx);
        (scheduler, updater, tx)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    fn within_jitter(actual: Duration, expected: Duration) -> bool {
        actual >= expected - expected / 20 && actual <= expected + expected / 20
    }

    #[test]
    fn test_update_from_diff() {
        let (scheduler, _, _tx) = setup(Reply::Failed, settings(1));
        scheduler.update_from_diff(&Diff {
            unmodified: vec![repo(1, "stale"), repo(2, "gone")],
            ..Default::default()
        });
        assert!(scheduler.queue.is_empty());
        assert_eq!(scheduler.schedule.len(), 2);

        let mut soft_deleted = repo(2, "gone");
        soft_deleted.deleted_at = Some(start());
        scheduler.update_from_diff(&Diff {
            added: vec![repo(3, "new")],
            deleted: vec![repo(1, "stale")],
            modified: vec![crate::syncer::ModifiedRepo {
                repo: repo(4, "changed"),
                fields: crate::types::RepoModifiedFields::STARS,
            }],
            unmodified: vec![soft_deleted],
        });

        let scheduled: Vec<_> = {
            let mut ids: Vec<_> = scheduler
                .debug_dump()
                .schedule
                .into_iter()
                .map(|e| e.repo.id.0)
                .collect();
            ids.sort();
            ids
        };
        assert_eq!(scheduled, vec![3, 4]);

        let queued: Vec<_> = scheduler
            .queue
            .snapshot()
            .into_iter()
            .map(|u| (u.repo.id.0, u.seq))
            .collect::<Vec<_>>();
        assert_eq!(queued.len(), 2);
        assert!(queued.contains(&(3, 1)));
        assert!(queued.contains(&(4, 2)));
    }

    #[test]
    fn test_update_once_is_high_priority() {
        let (scheduler, _, _tx) = setup(Reply::Failed, settings(1));
        scheduler.update_from_diff(&Diff {
            added: vec![repo(1, "a")],
            ..Default::default()
        });
        scheduler.update_once(repo(2, "b").configured());

        let info = scheduler.schedule_info(RepoId(2));
        assert!(info.schedule.is_none());
        let queue = info.queue.unwrap();
        assert_eq!(queue.index, 0);
        assert_eq!(queue.priority, Priority::High);
        assert_eq!(scheduler.schedule_info(RepoId(1)).queue.unwrap().total, 2);
    }

    #[tokio::test]
    async fn test_update_loop_applies_change_heuristic() {
        let (scheduler, updater, _tx) = setup(
            Reply::Fetched {
                fetched_after_change: Duration::minutes(2),
            },
            settings(1),
        );
        scheduler.update_from_diff(&Diff {
            added: vec![repo(1, "github.com/acme/widgets")],
            ..Default::default()
        });

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(scheduler.clone().run(shutdown.clone()));

        wait_until(|| scheduler.queue.is_empty()).await;
        wait_until(|| {
            scheduler
                .schedule
                .current_interval(RepoId(1))
                .is_some_and(|i| i != schedule::min_delay())
        })
        .await;

        let interval = scheduler.schedule.current_interval(RepoId(1)).unwrap();
        assert!(within_jitter(interval, Duration::minutes(1)), "{interval}");
        assert_eq!(
            updater.calls.lock().unwrap().clone(),
            vec!["github.com/acme/widgets".to_string()]
        );

        shutdown.cancel();
        handle.await.unwrap();
        assert!(scheduler.schedule.is_empty());
    }

    #[tokio::test]
    async fn test_failure_doubles_interval() {
        let (scheduler, _, _tx) = setup(Reply::RateLimited, settings(1));
        scheduler.update_from_diff(&Diff {
            added: vec![repo(1, "a")],
            ..Default::default()
        });
        let outcome = Err(GitserverError::RateLimited { retry_after: None });
        let interval = scheduler.next_interval(&repo(1, "a").configured(), &outcome);
        assert_eq!(interval, schedule::min_delay() * 2);

        let response = Ok(RepoUpdateResponse {
            error: "boom".to_string(),
            ..Default::default()
        });
        let interval = scheduler.next_interval(&repo(1, "a").configured(), &response);
        assert_eq!(interval, schedule::min_delay() * 2);
    }

    #[tokio::test]
    async fn test_custom_interval_overrides_heuristic() {
        let rules = IntervalRules::compile(&[crate::config::UpdateIntervalRule {
            pattern: "^github\\.com/".to_string(),
            interval_minutes: 30,
        }])
        .unwrap();
        let (scheduler, _, _tx) = setup(
            Reply::Failed,
            SchedulerSettings {
                max_concurrent_updates: 1,
                interval_rules: rules,
            },
        );
        let outcome = Ok(RepoUpdateResponse {
            error: "boom".to_string(),
            ..Default::default()
        });
        let interval = scheduler.next_interval(&repo(1, "github.com/acme/a").configured(), &outcome);
        assert_eq!(interval, Duration::minutes(30));
    }

    #[tokio::test]
    async fn test_limit_zero_blocks_until_raised() {
        let (scheduler, updater, tx) = setup(
            Reply::Fetched {
                fetched_after_change: Duration::hours(1),
            },
            settings(0),
        );
        scheduler.update_once(repo(1, "a").configured());

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(scheduler.clone().run(shutdown.clone()));

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(updater.calls.lock().unwrap().is_empty());
        assert_eq!(scheduler.queue.len(), 1);

        tx.send(settings(2)).unwrap();
        wait_until(|| scheduler.queue.is_empty()).await;
        assert_eq!(updater.calls.lock().unwrap().len(), 1);
        assert_eq!(scheduler.debug_dump().limiter.limit, 2);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_enqueue_due_moves_entries_to_queue() {
        let clock = Arc::new(ManualClock::new(start()));
        let (_tx, rx) = watch::channel(settings(1));
        let updater = Arc::new(FakeUpdater {
            now: start(),
            reply: Reply::Failed,
            calls: Mutex::new(Vec::new()),
        });
        let scheduler = UpdateScheduler::new(updater, clock.clone(), rx);
        scheduler.ensure_scheduled(&[repo(1, "a").configured(), repo(2, "b").configured()]);

        assert_eq!(scheduler.enqueue_due(), 0);
        clock.advance(schedule::min_delay());
        assert_eq!(scheduler.enqueue_due(), 2);
        assert_eq!(scheduler.queue.len(), 2);
        assert_eq!(
            scheduler.schedule_info(RepoId(1)).schedule.unwrap().due,
            start() + schedule::min_delay() * 2
        );
    }
}
