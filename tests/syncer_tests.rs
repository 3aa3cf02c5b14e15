//! Syncer behaviour against a real (in-memory) store.

mod test_utils;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::Duration;
use reposync::clock::ManualClock;
use reposync::config::SyncerConfig;
use reposync::models::{external_service_repo, repo};
use reposync::sources::SourceError;
use reposync::store::{ListReposOptions, Store};
use reposync::syncer::{NoopProgressRecorder, SyncJobProgressRecorder, Syncer};
use reposync::types::{ExternalService, RepoModifiedFields};
use test_utils::{
    ScriptedSourcer, create_service, create_user_service, epoch, setup_test_store, sourced_repo,
};
use sea_orm::EntityTrait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn syncer(store: &Store, clock: &Arc<ManualClock>, sourcer: Arc<ScriptedSourcer>) -> Syncer {
    Syncer::new(store.clone(), sourcer, SyncerConfig::default()).with_clock(clock.clone())
}

async fn live_names(store: &Store) -> Result<Vec<String>> {
    Ok(store
        .list_repos(&ListReposOptions::default())
        .await?
        .into_iter()
        .map(|r| r.name)
        .collect())
}

async fn pass(syncer: &Syncer, svc: &ExternalService) -> Result<(), reposync::syncer::SyncError> {
    syncer
        .sync_external_service(svc.id, syncer.min_sync_interval(), &NoopProgressRecorder)
        .await
}

#[tokio::test]
async fn test_sync_adds_then_reports_unmodified() -> Result<()> {
    let (store, clock) = setup_test_store().await?;
    let svc = create_service(&store, "github").await?;
    let syncer = syncer(&store, &clock, ScriptedSourcer::new(vec![]));
    let sourced = sourced_repo(&svc, "github.com/acme/api", "R_1");

    let diff = syncer.sync(&svc, sourced.clone()).await?;
    assert_eq!(diff.added.len(), 1);
    let id = diff.added[0].id;
    assert!(!id.is_zero());

    let row_before = repo::Entity::find_by_id(id.0).one(store.db()).await?;
    let links_before = external_service_repo::Entity::find().all(store.db()).await?;
    assert!(row_before.is_some());
    assert_eq!(links_before.len(), 1);

    // Any write from here on would stamp a later time.
    clock.advance(Duration::minutes(5));
    let diff = syncer.sync(&svc, sourced.clone()).await?;
    assert!(diff.added.is_empty());
    assert!(diff.modified.is_empty());
    assert!(diff.deleted.is_empty());
    assert_eq!(diff.unmodified.len(), 1);

    assert_eq!(repo::Entity::find_by_id(id.0).one(store.db()).await?, row_before);
    assert_eq!(
        external_service_repo::Entity::find().all(store.db()).await?,
        links_before
    );

    // A whole pass over the same data leaves the rows alone too.
    let sourcer = ScriptedSourcer::new(vec![Ok(sourced)]);
    let full = Syncer::new(store.clone(), sourcer, SyncerConfig::default())
        .with_clock(clock.clone());
    clock.advance(Duration::minutes(5));
    pass(&full, &svc).await?;
    assert_eq!(repo::Entity::find_by_id(id.0).one(store.db()).await?, row_before);
    assert_eq!(
        external_service_repo::Entity::find().all(store.db()).await?,
        links_before
    );

    let stored = store.get_repo_by_name("github.com/acme/api").await?.unwrap();
    assert!(stored.sources.contains_key(&svc.urn()));
    Ok(())
}

#[tokio::test]
async fn test_sync_reports_modified_fields() -> Result<()> {
    let (store, clock) = setup_test_store().await?;
    let svc = create_service(&store, "github").await?;
    let syncer = syncer(&store, &clock, ScriptedSourcer::new(vec![]));
    let mut sourced = sourced_repo(&svc, "github.com/acme/api", "R_1");
    syncer.sync(&svc, sourced.clone()).await?;

    sourced.description = "new description".to_string();
    sourced.stars = 42;
    let diff = syncer.sync(&svc, sourced).await?;

    assert_eq!(diff.modified.len(), 1);
    let fields = diff.modified[0].fields;
    assert!(fields.contains(RepoModifiedFields::DESCRIPTION));
    assert!(fields.contains(RepoModifiedFields::STARS));
    assert!(!fields.contains(RepoModifiedFields::NAME));

    let stored = store.get_repo_by_name("github.com/acme/api").await?.unwrap();
    assert_eq!(stored.description, "new description");
    assert_eq!(stored.stars, 42);
    Ok(())
}

#[tokio::test]
async fn test_rename_onto_taken_name_deletes_the_name_holder() -> Result<()> {
    let (store, clock) = setup_test_store().await?;
    let svc = create_service(&store, "github").await?;
    let syncer = syncer(&store, &clock, ScriptedSourcer::new(vec![]));

    let old_holder = syncer
        .sync(&svc, sourced_repo(&svc, "github.com/acme/x", "R_1"))
        .await?
        .added
        .remove(0);
    let renamed = syncer
        .sync(&svc, sourced_repo(&svc, "github.com/acme/y", "R_2"))
        .await?
        .added
        .remove(0);

    // R_2 now claims the name R_1 held.
    let diff = syncer
        .sync(&svc, sourced_repo(&svc, "github.com/acme/x", "R_2"))
        .await?;

    assert_eq!(diff.deleted.len(), 1);
    assert_eq!(diff.deleted[0].id, old_holder.id);
    assert_eq!(diff.modified.len(), 1);
    assert_eq!(diff.modified[0].repo.id, renamed.id);
    assert!(diff.modified[0].fields.contains(RepoModifiedFields::NAME));

    let by_name = store.get_repo_by_name("github.com/acme/x").await?.unwrap();
    assert_eq!(by_name.id, renamed.id);

    let all = store
        .list_repos(&ListReposOptions {
            ids: vec![old_holder.id],
            include_deleted: true,
            ..Default::default()
        })
        .await?;
    assert!(all[0].is_deleted());
    assert!(all[0].name.starts_with("DELETED-"));
    assert!(all[0].name.ends_with("-github.com/acme/x"));
    Ok(())
}

#[tokio::test]
async fn test_deleted_repo_comes_back_when_sourced_again() -> Result<()> {
    let (store, clock) = setup_test_store().await?;
    let svc = create_service(&store, "github").await?;
    let syncer = syncer(&store, &clock, ScriptedSourcer::new(vec![]));
    let sourced = sourced_repo(&svc, "github.com/acme/api", "R_1");
    let added = syncer.sync(&svc, sourced.clone()).await?.added.remove(0);

    store.delete_repos(&[added.id]).await?;
    assert!(store.get_repo(added.id).await?.is_none());

    let diff = syncer.sync(&svc, sourced).await?;
    assert_eq!(diff.modified.len(), 1);
    assert_eq!(diff.modified[0].repo.id, added.id);
    assert!(diff.modified[0].fields.contains(RepoModifiedFields::DELETED_AT));
    assert!(!diff.modified[0].repo.is_deleted());
    Ok(())
}

#[tokio::test]
async fn test_private_repo_over_license_limit_is_rejected() -> Result<()> {
    let (store, clock) = setup_test_store().await?;
    let svc = create_service(&store, "github").await?;
    let config = SyncerConfig {
        max_private_repos: Some(1),
        ..SyncerConfig::default()
    };
    let syncer = Syncer::new(store.clone(), ScriptedSourcer::new(vec![]), config)
        .with_clock(clock.clone());

    let mut first = sourced_repo(&svc, "github.com/acme/secret-1", "R_1");
    first.private = true;
    syncer.sync(&svc, first).await?;

    let mut second = sourced_repo(&svc, "github.com/acme/secret-2", "R_2");
    second.private = true;
    let err = syncer.sync(&svc, second.clone()).await.unwrap_err();
    assert!(err.is_license());
    assert!(store.get_repo_by_name("github.com/acme/secret-2").await?.is_none());

    // Public repos are not counted.
    second.private = false;
    let diff = syncer.sync(&svc, second).await?;
    assert_eq!(diff.added.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_pass_unlinks_repos_no_longer_yielded() -> Result<()> {
    let (store, clock) = setup_test_store().await?;
    let svc = create_service(&store, "github").await?;
    let a = sourced_repo(&svc, "github.com/acme/a", "R_a");
    let b = sourced_repo(&svc, "github.com/acme/b", "R_b");
    let sourcer = ScriptedSourcer::new(vec![Ok(a.clone()), Ok(b)]);
    let syncer = syncer(&store, &clock, sourcer.clone());

    pass(&syncer, &svc).await?;
    assert_eq!(live_names(&store).await?, ["github.com/acme/a", "github.com/acme/b"]);

    sourcer.set(vec![Ok(a)]);
    pass(&syncer, &svc).await?;
    assert_eq!(live_names(&store).await?, ["github.com/acme/a"]);
    Ok(())
}

#[tokio::test]
async fn test_repo_kept_while_another_service_yields_it() -> Result<()> {
    let (store, clock) = setup_test_store().await?;
    let first = create_service(&store, "github").await?;
    let second = create_service(&store, "github").await?;
    let syncer = syncer(&store, &clock, ScriptedSourcer::new(vec![]));

    syncer
        .sync(&first, sourced_repo(&first, "github.com/acme/a", "R_a"))
        .await?;
    syncer
        .sync(&second, sourced_repo(&second, "github.com/acme/a", "R_a"))
        .await?;

    // The first service stops yielding the repo.
    pass(&syncer, &first).await?;

    let stored = store.get_repo_by_name("github.com/acme/a").await?.unwrap();
    assert!(!stored.sources.contains_key(&first.urn()));
    assert!(stored.sources.contains_key(&second.urn()));
    Ok(())
}

#[tokio::test]
async fn test_source_errors_keep_unseen_repos() -> Result<()> {
    let (store, clock) = setup_test_store().await?;
    let svc = create_service(&store, "github").await?;
    let a = sourced_repo(&svc, "github.com/acme/a", "R_a");
    let b = sourced_repo(&svc, "github.com/acme/b", "R_b");
    let sourcer = ScriptedSourcer::new(vec![Ok(a.clone()), Ok(b)]);
    let syncer = syncer(&store, &clock, sourcer.clone());
    pass(&syncer, &svc).await?;

    sourcer.set(vec![Ok(a), Err(SourceError::other("page 2 timed out"))]);
    let err = pass(&syncer, &svc).await.unwrap_err();
    assert!(err.to_string().contains("page 2 timed out"));

    assert_eq!(live_names(&store).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_access_warnings_do_not_block_deletion() -> Result<()> {
    let (store, clock) = setup_test_store().await?;
    let svc = create_service(&store, "github").await?;
    let a = sourced_repo(&svc, "github.com/acme/a", "R_a");
    let b = sourced_repo(&svc, "github.com/acme/b", "R_b");
    let sourcer = ScriptedSourcer::new(vec![Ok(a.clone()), Ok(b)]);
    let syncer = syncer(&store, &clock, sourcer.clone());
    pass(&syncer, &svc).await?;

    sourcer.set(vec![
        Ok(a),
        Err(SourceError::forbidden("org acme-private").as_warning()),
    ]);
    assert!(pass(&syncer, &svc).await.is_err());

    assert_eq!(live_names(&store).await?, ["github.com/acme/a"]);
    Ok(())
}

#[tokio::test]
async fn test_fatal_error_on_site_service_keeps_everything() -> Result<()> {
    let (store, clock) = setup_test_store().await?;
    let svc = create_service(&store, "github").await?;
    let a = sourced_repo(&svc, "github.com/acme/a", "R_a");
    let sourcer = ScriptedSourcer::new(vec![Ok(a.clone())]);
    let syncer = syncer(&store, &clock, sourcer.clone());
    pass(&syncer, &svc).await?;

    sourcer.set(vec![Err(SourceError::unauthorized("token revoked")), Ok(a)]);
    assert!(pass(&syncer, &svc).await.is_err());

    assert_eq!(live_names(&store).await?, ["github.com/acme/a"]);
    Ok(())
}

#[tokio::test]
async fn test_fatal_error_on_user_service_unlinks_everything() -> Result<()> {
    let (store, clock) = setup_test_store().await?;
    let svc = create_user_service(&store, "github").await?;
    let a = sourced_repo(&svc, "github.com/acme/a", "R_a");
    let sourcer = ScriptedSourcer::new(vec![Ok(a.clone())]);
    let syncer = syncer(&store, &clock, sourcer.clone());
    pass(&syncer, &svc).await?;

    // Repos yielded before the fatal error are not trusted either.
    sourcer.set(vec![Ok(a), Err(SourceError::unauthorized("token revoked"))]);
    assert!(pass(&syncer, &svc).await.is_err());

    assert!(live_names(&store).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_pass_records_sync_times_and_backs_off() -> Result<()> {
    let (store, clock) = setup_test_store().await?;
    let svc = create_service(&store, "github").await?;
    let a = sourced_repo(&svc, "github.com/acme/a", "R_a");
    let syncer = syncer(&store, &clock, ScriptedSourcer::new(vec![Ok(a)]));

    pass(&syncer, &svc).await?;
    let synced = store.get_external_service(svc.id).await?;
    assert_eq!(synced.last_sync_at, Some(epoch()));
    assert_eq!(synced.next_sync_at, Some(epoch() + Duration::minutes(1)));

    // Nothing changed for 30 minutes: wait twice as long.
    clock.advance(Duration::minutes(30));
    pass(&syncer, &svc).await?;
    let synced = store.get_external_service(svc.id).await?;
    let now = epoch() + Duration::minutes(30);
    assert_eq!(synced.last_sync_at, Some(now));
    assert_eq!(synced.next_sync_at, Some(now + Duration::hours(1)));
    Ok(())
}

#[tokio::test]
async fn test_committed_diffs_are_published() -> Result<()> {
    let (store, clock) = setup_test_store().await?;
    let svc = create_service(&store, "github").await?;
    let a = sourced_repo(&svc, "github.com/acme/a", "R_a");
    let b = sourced_repo(&svc, "github.com/acme/b", "R_b");
    let sourcer = ScriptedSourcer::new(vec![Ok(a.clone()), Ok(b)]);
    let (tx, mut rx) = mpsc::channel(16);
    let syncer = syncer(&store, &clock, sourcer.clone()).with_synced(tx);

    pass(&syncer, &svc).await?;
    assert_eq!(rx.recv().await.unwrap().added[0].name, "github.com/acme/a");
    assert_eq!(rx.recv().await.unwrap().added[0].name, "github.com/acme/b");

    sourcer.set(vec![Ok(a)]);
    pass(&syncer, &svc).await?;
    assert_eq!(rx.recv().await.unwrap().unmodified.len(), 1);
    let deleted = rx.recv().await.unwrap();
    assert_eq!(deleted.deleted.len(), 1);
    assert!(deleted.deleted[0].is_deleted());

    assert_eq!(syncer.initial_unmodified_diff_from_store().await?, 1);
    assert_eq!(rx.recv().await.unwrap().unmodified[0].name, "github.com/acme/a");
    Ok(())
}

#[tokio::test]
async fn test_progress_is_recorded_on_the_sync_job() -> Result<()> {
    let (store, clock) = setup_test_store().await?;
    let svc = create_service(&store, "github").await?;
    let sourcer = ScriptedSourcer::new(vec![
        Ok(sourced_repo(&svc, "github.com/acme/a", "R_a")),
        Err(SourceError::other("flaky")),
        Ok(sourced_repo(&svc, "github.com/acme/b", "R_b")),
    ]);
    let syncer = syncer(&store, &clock, sourcer);
    let job = store.create_sync_job(svc.id).await?;
    let recorder = SyncJobProgressRecorder::new(store.clone(), job.id);

    let result = syncer
        .sync_external_service(svc.id, syncer.min_sync_interval(), &recorder)
        .await;
    assert!(result.is_err());

    let progress = recorder.latest();
    assert_eq!(progress.synced, 2);
    assert_eq!(progress.added, 2);
    assert_eq!(progress.errors, 1);

    let jobs = store.list_sync_jobs(Some(svc.id), 10).await?;
    assert_eq!(jobs[0].progress, progress);
    Ok(())
}

#[tokio::test]
async fn test_sync_repo_serves_fresh_repos_from_store() -> Result<()> {
    let (store, clock) = setup_test_store().await?;
    let svc = create_service(&store, "github").await?;
    let a = sourced_repo(&svc, "github.com/acme/a", "R_a");
    let sourcer = ScriptedSourcer::new(vec![Ok(a.clone())]);
    let syncer = Arc::new(syncer(&store, &clock, sourcer.clone()));

    let looked_up = syncer.sync_repo("github.com/acme/a", false).await?;
    assert!(!looked_up.id.is_zero());

    // Fresh: the code host is not asked again.
    sourcer.set(vec![]);
    let served = syncer.sync_repo("github.com/acme/a", false).await?;
    assert_eq!(served.id, looked_up.id);
    assert!(!served.is_deleted());
    Ok(())
}

#[tokio::test]
async fn test_sync_repo_unlinks_stale_repo_missing_upstream() -> Result<()> {
    let (store, clock) = setup_test_store().await?;
    let svc = create_service(&store, "github").await?;
    let a = sourced_repo(&svc, "github.com/acme/a", "R_a");
    let sourcer = ScriptedSourcer::new(vec![Ok(a)]);
    let (tx, mut rx) = mpsc::channel(16);
    let syncer = Arc::new(syncer(&store, &clock, sourcer.clone()).with_synced(tx));
    let stored = syncer.sync_repo("github.com/acme/a", false).await?;
    rx.recv().await.unwrap();

    clock.advance(Duration::minutes(5));
    sourcer.set(vec![]);
    let err = syncer.sync_repo("github.com/acme/a", false).await.unwrap_err();
    assert!(err.is_not_found());

    assert!(store.get_repo(stored.id).await?.is_none());
    let deleted = rx.recv().await.unwrap();
    assert_eq!(deleted.deleted[0].id, stored.id);
    Ok(())
}

#[tokio::test]
async fn test_sync_repo_unknown_everywhere_is_not_found() -> Result<()> {
    let (store, clock) = setup_test_store().await?;
    create_service(&store, "github").await?;
    let syncer = Arc::new(syncer(&store, &clock, ScriptedSourcer::new(vec![])));

    let err = syncer
        .sync_repo("github.com/acme/ghost", false)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    Ok(())
}

#[tokio::test]
async fn test_runner_syncs_due_services() -> Result<()> {
    let (store, clock) = setup_test_store().await?;
    let svc = create_service(&store, "github").await?;
    let sourcer = ScriptedSourcer::new(vec![
        Ok(sourced_repo(&svc, "github.com/acme/a", "R_a")),
        Ok(sourced_repo(&svc, "github.com/acme/b", "R_b")),
    ]);

    // A job left behind by a previous process.
    let stale = store.create_sync_job(svc.id).await?;

    let syncer = Arc::new(syncer(&store, &clock, sourcer));
    let shutdown = CancellationToken::new();
    let runner = tokio::spawn(Arc::clone(&syncer).run(shutdown.clone()));

    let completed = tokio::time::timeout(StdDuration::from_secs(5), async {
        loop {
            let jobs = store.list_sync_jobs(Some(svc.id), 10).await.unwrap();
            if let Some(job) = jobs.iter().find(|j| j.id != stale.id && j.finished_at.is_some()) {
                return job.clone();
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
    })
    .await
    .expect("sync job should complete");

    shutdown.cancel();
    runner.await?;

    assert_eq!(completed.state, "completed");
    assert_eq!(completed.progress.added, 2);
    let jobs = store.list_sync_jobs(Some(svc.id), 10).await?;
    let stale = jobs.iter().find(|j| j.id == stale.id).unwrap();
    assert_eq!(stale.state, "errored");
    assert_eq!(live_names(&store).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_trigger_unknown_service_fails() -> Result<()> {
    let (store, clock) = setup_test_store().await?;
    let syncer = syncer(&store, &clock, ScriptedSourcer::new(vec![]));

    let err = syncer.trigger_external_service_sync(77).await.unwrap_err();
    assert!(err.is_not_found());
    Ok(())
}

#[tokio::test]
async fn test_min_sync_interval_saturates() -> Result<()> {
    let (store, clock) = setup_test_store().await?;
    let sourcer = ScriptedSourcer::new(vec![]);
    let config = SyncerConfig {
        min_sync_interval_seconds: u64::MAX,
        progress_record_interval_ms: u64::MAX,
        ..SyncerConfig::default()
    };
    let syncer = Syncer::new(store.clone(), sourcer.clone(), config).with_clock(clock.clone());
    assert_eq!(syncer.min_sync_interval(), reposync::syncer::max_sync_interval());

    // A pass with the oversized throttle still completes.
    let svc = create_service(&store, "github").await?;
    sourcer.set(vec![Ok(sourced_repo(&svc, "github.com/acme/api", "R_1"))]);
    pass(&syncer, &svc).await?;
    assert_eq!(live_names(&store).await?, ["github.com/acme/api"]);

    let config = SyncerConfig {
        min_sync_interval_seconds: (i64::MAX as u64) / 10,
        ..SyncerConfig::default()
    };
    let syncer = Syncer::new(store.clone(), sourcer, config).with_clock(clock.clone());
    assert_eq!(syncer.min_sync_interval(), reposync::syncer::max_sync_interval());
    Ok(())
}
