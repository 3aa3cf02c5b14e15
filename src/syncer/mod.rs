//! # Syncer
//!
//! Keeps the stored repos in line with what external services yield.
//!
//! [`Syncer::sync`] reconciles one sourced repo inside a transaction and
//! publishes the resulting [`Diff`] once committed. A sourced repo is matched
//! against stored repos by name OR external spec, which can surface two rows
//! when a rename moved a name between repos; the row that only matches by
//! name is deleted and the external-spec match wins.
//!
//! [`Syncer::sync_external_service`] drives a whole pass over one service:
//! it reconciles the streamed repos one at a time, unlinks the repos the
//! service no longer yields (unless errors make the listing untrustworthy)
//! and backs off the next pass when nothing changed.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::SyncerConfig;
use crate::singleflight::Group;
use crate::sources::{SourceError, SourceErrorKind, Sourcer};
use crate::store::{ListExternalServicesOptions, ListReposOptions, Store, StoreError};
use crate::types::{ExternalService, ExternalServiceId, Repo, RepoId, SyncProgress};
use sea_orm::{ConnectionTrait, TransactionTrait};

mod diff;
pub mod progress;
mod runner;

pub use diff::{Diff, ModifiedRepo};
pub use progress::{NoopProgressRecorder, ProgressRecorder, SyncJobProgressRecorder};

use progress::ProgressThrottle;

/// Longest backoff between two syncs of one external service.
pub fn max_sync_interval() -> Duration {
    Duration::hours(8)
}

/// Upper bound on the spacing between two progress writes of one pass.
pub fn max_progress_record_interval() -> Duration {
    Duration::hours(1)
}

/// A stored repo refreshed more recently than this is served as is.
fn repo_freshness() -> Duration {
    Duration::minutes(1)
}

/// Errors raised while syncing
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("External service {service}: {source}")]
    Source {
        service: ExternalServiceId,
        #[source]
        source: SourceError,
    },

    #[error("License check failed for {repo}: private repo limit of {limit} reached")]
    License { repo: String, limit: u64 },

    #[error("Syncing repo {repo}: {source}")]
    Repo {
        repo: String,
        #[source]
        source: Box<SyncError>,
    },

    #[error("Repo {0} not found")]
    RepoNotFound(String),

    #[error(transparent)]
    Shared(Arc<SyncError>),

    #[error("{} errors occurred: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<SyncError>),
}

fn join_errors(errs: &[SyncError]) -> String {
    errs.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl SyncError {
    fn from_errors(mut errs: Vec<SyncError>) -> Result<(), SyncError> {
        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.remove(0)),
            _ => Err(SyncError::Multiple(errs)),
        }
    }

    fn source_error(&self) -> Option<&SourceError> {
        match self {
            SyncError::Source { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn is_license(&self) -> bool {
        match self {
            SyncError::License { .. } => true,
            SyncError::Repo { source, .. } => source.is_license(),
            SyncError::Shared(inner) => inner.is_license(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            SyncError::RepoNotFound(_) | SyncError::Store(StoreError::ExternalServiceNotFound(_)) => {
                true
            }
            SyncError::Shared(inner) => inner.is_not_found(),
            _ => false,
        }
    }
}

pub struct Syncer {
    store: Store,
    sourcer: Arc<dyn Sourcer>,
    clock: Arc<dyn Clock>,
    config: SyncerConfig,
    synced: Option<mpsc::Sender<Diff>>,
    shutdown: CancellationToken,
    repo_syncs: Group<String, Result<Repo, Arc<SyncError>>>,
    trigger: Notify,
}

impl Syncer {
    pub fn new(store: Store, sourcer: Arc<dyn Sourcer>, config: SyncerConfig) -> Self {
        Self {
            store,
            sourcer,
            clock: Arc::new(SystemClock),
            config,
            synced: None,
            shutdown: CancellationToken::new(),
            repo_syncs: Group::new(),
            trigger: Notify::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Diffs of committed syncs are sent on `synced`.
    pub fn with_synced(mut self, synced: mpsc::Sender<Diff>) -> Self {
        self.synced = Some(synced);
        self
    }

    /// Pending publications and background refreshes give up once `shutdown`
    /// is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The configured floor, saturating at [`max_sync_interval`].
    pub fn min_sync_interval(&self) -> Duration {
        i64::try_from(self.config.min_sync_interval_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .map_or_else(max_sync_interval, |d| d.min(max_sync_interval()))
    }

    fn progress_record_interval(&self) -> Duration {
        i64::try_from(self.config.progress_record_interval_ms)
            .ok()
            .and_then(Duration::try_milliseconds)
            .map_or_else(max_progress_record_interval, |d| {
                d.min(max_progress_record_interval())
            })
    }

    /// Reconciles one sourced repo of `svc` in its own transaction.
    #[instrument(skip(self, svc, sourced), fields(external_service_id = svc.id, repo = %sourced.name))]
    pub async fn sync(&self, svc: &ExternalService, sourced: Repo) -> Result<Diff, SyncError> {
        let tx = self.store.transact().await?;
        let result = self.sync_in(&tx, svc, sourced).await;
        let diff = tx.done(result).await?;

        self.publish(diff.clone()).await;
        Ok(diff)
    }

    async fn sync_in<C>(
        &self,
        store: &Store<C>,
        svc: &ExternalService,
        mut sourced: Repo,
    ) -> Result<Diff, SyncError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let mut opts = ListReposOptions {
            names: vec![sourced.name.clone()],
            use_or: true,
            include_deleted: true,
            ..Default::default()
        };
        if sourced.external_repo.is_set() {
            opts.external_repos.push(sourced.external_repo.clone());
        }
        let mut stored = store.list_repos(&opts).await?;

        let mut diff = Diff::default();
        let existing = match stored.len() {
            0 => None,
            1 => stored.pop(),
            2 => {
                let (mut by_spec, mut by_name): (Vec<Repo>, Vec<Repo>) = stored
                    .into_iter()
                    .partition(|r| r.external_repo == sourced.external_repo);
                let (Some(existing), Some(conflicting)) = (by_spec.pop(), by_name.pop()) else {
                    panic!(
                        "two stored repos match {} but not exactly one by external spec",
                        sourced.name
                    );
                };
                debug!(
                    existing = %existing.name,
                    conflicting = %conflicting.name,
                    "Resolving repo name conflict"
                );
                store.delete_repos(&[conflicting.id]).await?;
                diff.deleted.push(conflicting);
                Some(existing)
            }
            n => panic!(
                "{n} stored repos match {} by name or external spec",
                sourced.name
            ),
        };

        match existing {
            Some(mut stored) => {
                let was_deleted = stored.is_deleted();
                let was_private = stored.private;
                let fields = stored.update(&sourced);
                if fields.is_empty() {
                    diff.unmodified.push(stored);
                } else {
                    if stored.private && (!was_private || was_deleted) {
                        self.check_license(store, &stored.name).await?;
                    }
                    store.update_external_service_repo(svc, &mut stored).await?;
                    diff.modified.push(ModifiedRepo {
                        repo: stored,
                        fields,
                    });
                }
            }
            None => {
                if sourced.private {
                    self.check_license(store, &sourced.name).await?;
                }
                store.create_external_service_repo(svc, &mut sourced).await?;
                diff.added.push(sourced);
            }
        }

        Ok(diff)
    }

    async fn check_license<C>(&self, store: &Store<C>, repo: &str) -> Result<(), SyncError>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let Some(limit) = self.config.max_private_repos else {
            return Ok(());
        };
        if store.count_private_repos().await? >= limit {
            return Err(SyncError::License {
                repo: repo.to_string(),
                limit,
            });
        }
        Ok(())
    }

    /// Sends a non-empty diff to the listener, if any. Gives up on shutdown.
    async fn publish(&self, diff: Diff) {
        let Some(synced) = &self.synced else {
            return;
        };
        if diff.is_empty() || synced.is_closed() {
            return;
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => {
                debug!("Shutdown while publishing sync diff");
            }
            sent = synced.send(diff) => {
                if sent.is_err() {
                    debug!("Sync diff listener went away");
                }
            }
        }
    }

    /// Runs one sync pass over an external service. Per-repo errors are
    /// collected and returned together once the pass is over; the service's
    /// last and next sync times are written whatever the outcome.
    #[instrument(skip(self, recorder))]
    pub async fn sync_external_service(
        &self,
        external_service_id: ExternalServiceId,
        min_sync_interval: Duration,
        recorder: &dyn ProgressRecorder,
    ) -> Result<(), SyncError> {
        let svc = self.store.get_external_service(external_service_id).await?;
        let mut modified = false;

        let result = self.sync_service_repos(&svc, recorder, &mut modified).await;

        let now = self.clock.now();
        let interval =
            calc_sync_interval(now, svc.last_sync_at, min_sync_interval, modified, result.is_err());
        if let Err(e) = self
            .store
            .update_external_service_sync_times(svc.id, now, now + interval)
            .await
        {
            warn!(external_service_id = svc.id, error = %e, "Failed to record sync times");
        }
        debug!(
            external_service_id = svc.id,
            modified,
            next_sync_in_seconds = interval.num_seconds(),
            "Scheduled next external service sync"
        );

        result
    }

    async fn sync_service_repos(
        &self,
        svc: &ExternalService,
        recorder: &dyn ProgressRecorder,
        modified: &mut bool,
    ) -> Result<(), SyncError> {
        let source = self
            .sourcer
            .source(svc)
            .map_err(|source| SyncError::Source {
                service: svc.id,
                source,
            })?;

        if let Err(e) = source.check_connection().await {
            warn!(external_service_id = svc.id, error = %e, "Connection check failed, syncing anyway");
        }

        let (results_tx, mut results) = mpsc::channel::<crate::sources::SourceResult>(64);
        let mut progress = SyncProgress::default();
        let mut errs: Vec<SyncError> = Vec::new();
        let mut seen: HashSet<RepoId> = HashSet::new();
        let mut throttle = ProgressThrottle::new(self.progress_record_interval());

        let consume = async {
            while let Some(result) = results.recv().await {
                let sourced = match result {
                    Ok(repo) => repo,
                    Err(err) => {
                        progress.errors += 1;
                        let fatal = err.is_fatal();
                        warn!(external_service_id = svc.id, error = %err, fatal, "Source error");
                        errs.push(SyncError::Source {
                            service: svc.id,
                            source: err,
                        });
                        if fatal {
                            seen.clear();
                            break;
                        }
                        continue;
                    }
                };

                let name = sourced.name.clone();
                match self.sync(svc, sourced).await {
                    Ok(diff) => {
                        progress.synced += 1;
                        progress.added += diff.added.len() as i32;
                        progress.removed += diff.deleted.len() as i32;
                        progress.modified += diff.modified.len() as i32;
                        progress.unmodified += diff.unmodified.len() as i32;
                        *modified |= !diff.added.is_empty() || !diff.modified.is_empty();
                        seen.extend(
                            diff.added
                                .iter()
                                .chain(diff.modified.iter().map(|m| &m.repo))
                                .chain(&diff.unmodified)
                                .map(|r| r.id),
                        );
                    }
                    Err(err) => {
                        progress.errors += 1;
                        if err.is_license() {
                            warn!(repo = %name, error = %err, "Repo skipped by license check");
                        } else {
                            warn!(repo = %name, error = %err, "Failed to sync repo");
                        }
                        errs.push(SyncError::Repo {
                            repo: name,
                            source: Box::new(err),
                        });
                    }
                }

                if throttle.ready(self.clock.now()) {
                    recorder.record(&progress, false).await;
                }
            }
            drop(results);
        };
        tokio::join!(source.list_repos(results_tx), consume);

        if self.abort_deletion(svc, &errs) {
            warn!(
                external_service_id = svc.id,
                errors = errs.len(),
                "Not deleting unseen repos because of sync errors"
            );
        } else {
            match self.delete_unseen(svc, &seen).await {
                Ok(removed) => {
                    progress.removed += removed as i32;
                    *modified |= removed > 0;
                }
                Err(e) => errs.push(e),
            }
        }

        recorder.record(&progress, true).await;
        record_pass_metrics(&progress);
        info!(
            external_service_id = svc.id,
            synced = progress.synced,
            added = progress.added,
            removed = progress.removed,
            modified = progress.modified,
            unmodified = progress.unmodified,
            errors = progress.errors,
            "External service sync pass finished"
        );

        SyncError::from_errors(errs)
    }

    /// Site-level services keep their unseen repos unless every error was a
    /// warning about missing access. Namespaced services also tolerate hard
    /// authorization errors.
    fn abort_deletion(&self, svc: &ExternalService, errs: &[SyncError]) -> bool {
        errs.iter().any(|err| {
            let Some(source) = err.source_error() else {
                return true;
            };
            if source.is_access_warning() {
                return false;
            }
            !(svc.is_namespaced() && source.is_auth())
        })
    }

    /// Unlinks repos the pass did not see and publishes the ones that ended
    /// up deleted. Returns the number of unlinked repos.
    async fn delete_unseen(
        &self,
        svc: &ExternalService,
        seen: &HashSet<RepoId>,
    ) -> Result<usize, SyncError> {
        let tx = self.store.transact().await?;
        let result = tx.delete_external_service_repos_not_in(svc, seen).await;
        let unlinked = tx.done(result.map_err(SyncError::from)).await?;

        if !unlinked.deleted.is_empty() {
            let deleted = self
                .store
                .list_repos(&ListReposOptions {
                    ids: unlinked.deleted.clone(),
                    include_deleted: true,
                    ..Default::default()
                })
                .await?;
            self.publish(Diff {
                deleted,
                ..Default::default()
            })
            .await;
        }
        Ok(unlinked.unlinked.len())
    }

    /// Publishes every stored repo as unmodified so a fresh scheduler learns
    /// about them.
    pub async fn initial_unmodified_diff_from_store(&self) -> Result<usize, SyncError> {
        let repos = self.store.list_repos(&ListReposOptions::default()).await?;
        let count = repos.len();
        self.publish(Diff {
            unmodified: repos,
            ..Default::default()
        })
        .await;
        Ok(count)
    }

    /// Returns the stored repo named `name`, refreshing it from the
    /// site-level external services first when it is stale or unknown.
    ///
    /// With `background`, a stale stored repo is returned right away and
    /// refreshed asynchronously. Concurrent refreshes of one name share a
    /// single lookup.
    pub async fn sync_repo(self: &Arc<Self>, name: &str, background: bool) -> Result<Repo, SyncError> {
        let stored = self.store.get_repo_by_name(name).await?;

        if let Some(repo) = &stored {
            let fresh = repo
                .updated_at
                .is_some_and(|at| self.clock.now() - at < repo_freshness());
            if fresh {
                return Ok(repo.clone());
            }
            if background {
                let syncer = Arc::clone(self);
                let name = name.to_string();
                let repo = repo.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = syncer.shutdown.cancelled() => {}
                        result = syncer.sync_repo_once(name.clone(), stored) => {
                            if let Err(e) = result {
                                warn!(repo = %name, error = %e, "Background repo sync failed");
                            }
                        }
                    }
                });
                return Ok(repo);
            }
        }

        self.sync_repo_once(name.to_string(), stored).await
    }

    async fn sync_repo_once(
        self: &Arc<Self>,
        name: String,
        stored: Option<Repo>,
    ) -> Result<Repo, SyncError> {
        let syncer = Arc::clone(self);
        let key = name.clone();
        self.repo_syncs
            .work(key, move || async move {
                syncer.lookup_and_sync_repo(&name, stored).await.map_err(Arc::new)
            })
            .await
            .map_err(SyncError::Shared)
    }

    async fn lookup_and_sync_repo(
        &self,
        name: &str,
        stored: Option<Repo>,
    ) -> Result<Repo, SyncError> {
        let services = self
            .store
            .list_external_services(&ListExternalServicesOptions::default())
            .await?;

        let mut not_found_in = Vec::new();
        for svc in services.into_iter().filter(|svc| !svc.is_namespaced()) {
            let source = match self.sourcer.source(&svc) {
                Ok(source) => source,
                Err(e) => {
                    debug!(external_service_id = svc.id, error = %e, "No source for external service");
                    continue;
                }
            };
            match source.get_repo(name).await {
                Ok(sourced) => {
                    let diff = self.sync(&svc, sourced).await?;
                    return synced_repo(diff).ok_or_else(|| SyncError::RepoNotFound(name.to_string()));
                }
                Err(e) if e.is_not_found() => not_found_in.push(svc),
                Err(e) if e.kind == SourceErrorKind::Unsupported => {}
                Err(source) => {
                    return Err(SyncError::Source {
                        service: svc.id,
                        source,
                    });
                }
            }
        }

        if let Some(stored) = stored {
            self.unlink_missing_repo(&stored, &not_found_in).await?;
        }
        Err(SyncError::RepoNotFound(name.to_string()))
    }

    /// Unlinks a repo from the services that reported it gone.
    async fn unlink_missing_repo(
        &self,
        repo: &Repo,
        services: &[ExternalService],
    ) -> Result<(), SyncError> {
        let linked: Vec<_> = services
            .iter()
            .filter(|svc| repo.sources.contains_key(&svc.urn()))
            .collect();
        if linked.is_empty() {
            return Ok(());
        }

        let tx = self.store.transact().await?;
        let mut result = Ok(false);
        for svc in linked {
            match tx.delete_external_service_repo(svc, repo.id).await {
                Ok(deleted) => result = Ok(deleted),
                Err(e) => {
                    result = Err(SyncError::from(e));
                    break;
                }
            }
        }
        let deleted = tx.done(result).await?;

        info!(repo = %repo.name, deleted, "Unlinked repo no longer found on its code hosts");
        if deleted {
            self.publish(Diff {
                deleted: vec![repo.clone()],
                ..Default::default()
            })
            .await;
        }
        Ok(())
    }
}

/// The repo a single-repo sync settled on.
fn synced_repo(mut diff: Diff) -> Option<Repo> {
    if let Some(repo) = diff.added.pop() {
        return Some(repo);
    }
    if let Some(modified) = diff.modified.pop() {
        return Some(modified.repo);
    }
    diff.unmodified.pop()
}

fn record_pass_metrics(progress: &SyncProgress) {
    for (state, count) in [
        ("added", progress.added),
        ("removed", progress.removed),
        ("modified", progress.modified),
        ("unmodified", progress.unmodified),
        ("errored", progress.errors),
    ] {
        if count > 0 {
            counter!("reposync_syncer_synced_repos_total", "state" => state)
                .increment(count as u64);
        }
    }
}

/// Interval until the next sync of an external service.
///
/// A service that was never synced, or whose last pass changed something,
/// is synced again after `min_sync_interval`. Otherwise the time since the
/// last sync is doubled, between `min_sync_interval` and eight hours. A
/// failed pass that never synced before waits the full eight hours.
pub fn calc_sync_interval(
    now: DateTime<Utc>,
    last_sync: Option<DateTime<Utc>>,
    min_sync_interval: Duration,
    modified: bool,
    errored: bool,
) -> Duration {
    let max = max_sync_interval();
    if !errored && (last_sync.is_none() || modified) {
        return min_sync_interval;
    }

    let interval = last_sync
        .and_then(|last| (now - last).checked_mul(2))
        .unwrap_or(max);
    interval.clamp(min_sync_interval, max.max(min_sync_interval))
}
