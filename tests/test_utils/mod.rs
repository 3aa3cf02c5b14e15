//! Test utilities for the store and the syncer.
//!
//! Sets up an in-memory SQLite database with migrations applied, and offers
//! a scriptable source so sync passes can be driven without a code host.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use migration::{Migrator, MigratorTrait};
use reposync::clock::ManualClock;
use reposync::sources::{Source, SourceError, SourceResult, Sourcer};
use reposync::store::{NewExternalService, Store};
use reposync::types::{ExternalRepoSpec, ExternalService, Repo, SourceInfo};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use serde_json::json;
use tokio::sync::mpsc;

/// Sets up an in-memory SQLite database with all migrations applied.
///
/// The pool holds a single connection: every `sqlite::memory:` connection
/// opens its own database.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let mut opt = ConnectOptions::new("sqlite::memory:");
    opt.max_connections(1).min_connections(1).sqlx_logging(false);
    let db = Database::connect(opt).await?;

    Migrator::up(&db, None).await?;

    Ok(db)
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

/// A store on a fresh database whose clock starts at [`epoch`].
pub async fn setup_test_store() -> Result<(Store, Arc<ManualClock>)> {
    let db = setup_test_db().await?;
    let clock = Arc::new(ManualClock::new(epoch()));
    Ok((Store::with_clock(db, clock.clone()), clock))
}

/// Creates a site-level external service of the given kind.
pub async fn create_service(store: &Store, kind: &str) -> Result<ExternalService> {
    Ok(store
        .create_external_service(NewExternalService {
            kind: kind.to_string(),
            display_name: format!("{kind} test"),
            config: json!({}),
            namespace_user_id: None,
            namespace_org_id: None,
        })
        .await?)
}

/// Creates an external service owned by user 1.
pub async fn create_user_service(store: &Store, kind: &str) -> Result<ExternalService> {
    Ok(store
        .create_external_service(NewExternalService {
            kind: kind.to_string(),
            display_name: format!("{kind} user test"),
            config: json!({}),
            namespace_user_id: Some(1),
            namespace_org_id: None,
        })
        .await?)
}

/// A repo as a GitHub-like source would yield it for `svc`.
pub fn sourced_repo(svc: &ExternalService, name: &str, external_id: &str) -> Repo {
    let urn = svc.urn();
    let mut repo = Repo {
        name: name.to_string(),
        uri: name.to_string(),
        description: format!("{name} description"),
        external_repo: ExternalRepoSpec {
            id: external_id.to_string(),
            service_type: "github".to_string(),
            service_id: "https://github.com/".to_string(),
        },
        ..Default::default()
    };
    repo.sources.insert(
        urn.clone(),
        SourceInfo {
            id: urn,
            clone_url: format!("https://{name}.git"),
        },
    );
    repo
}

/// Sourcer handing out sources that yield a scripted list of results.
#[derive(Default)]
pub struct ScriptedSourcer {
    results: Mutex<Vec<SourceResult>>,
}

impl ScriptedSourcer {
    pub fn new(results: Vec<SourceResult>) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(results),
        })
    }

    /// Replaces what the next sources yield.
    pub fn set(&self, results: Vec<SourceResult>) {
        *self.results.lock().unwrap_or_else(PoisonError::into_inner) = results;
    }
}

impl Sourcer for ScriptedSourcer {
    fn source(&self, svc: &ExternalService) -> Result<Arc<dyn Source>, SourceError> {
        let results = self
            .results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Ok(Arc::new(ScriptedSource {
            svc: svc.clone(),
            results,
        }))
    }
}

struct ScriptedSource {
    svc: ExternalService,
    results: Vec<SourceResult>,
}

#[async_trait]
impl Source for ScriptedSource {
    async fn list_repos(&self, results: mpsc::Sender<SourceResult>) {
        for result in self.results.clone() {
            if results.send(result).await.is_err() {
                return;
            }
        }
    }

    async fn check_connection(&self) -> Result<(), SourceError> {
        Ok(())
    }

    fn external_services(&self) -> Vec<ExternalService> {
        vec![self.svc.clone()]
    }

    async fn get_repo(&self, name: &str) -> Result<Repo, SourceError> {
        self.results
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .find(|r| r.name == name)
            .cloned()
            .ok_or_else(|| SourceError::not_found(format!("{name} not found")))
    }
}
