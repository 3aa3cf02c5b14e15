//! # Repo Store
//!
//! Transactional persistence for repos, external services and sync jobs on
//! top of SeaORM. A [`Store`] wraps either the pooled connection or an open
//! transaction; [`Store::transact`] opens a transaction (a savepoint when
//! already inside one) and [`Store::done`] commits or rolls it back based on
//! the outcome of the work done inside it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbErr, TransactionTrait};
use thiserror::Error;

use crate::clock::{Clock, SystemClock};
use crate::models::{external_service, repo};
use crate::types::{ExternalRepoSpec, ExternalService, Repo, RepoId, SourceInfo};

mod external_services;
mod repos;
mod sync_jobs;

pub use external_services::{ListExternalServicesOptions, NewExternalService};
pub use repos::{ListReposOptions, UnlinkedRepos};
pub use sync_jobs::SyncJobRecord;

/// Errors raised by the store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Db(#[from] DbErr),

    #[error("Repo {repo} is missing source info for external service {urn}")]
    MissingSource { repo: String, urn: String },

    #[error("Empty repo id in {0}")]
    MissingId(&'static str),

    #[error("External service {0} not found")]
    ExternalServiceNotFound(i32),
}

/// Handle onto the repo database, optionally scoped to a transaction.
#[derive(Clone)]
pub struct Store<C = DatabaseConnection> {
    conn: C,
    clock: Arc<dyn Clock>,
}

impl Store<DatabaseConnection> {
    pub fn new(db: DatabaseConnection) -> Self {
        Self::with_clock(db, Arc::new(SystemClock))
    }

    pub fn with_clock(db: DatabaseConnection, clock: Arc<dyn Clock>) -> Self {
        Self { conn: db, clock }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.conn
    }
}

impl<C> Store<C>
where
    C: ConnectionTrait + TransactionTrait,
{
    /// Begins a transaction. Nested calls open a savepoint.
    pub async fn transact(&self) -> Result<Store<DatabaseTransaction>, StoreError> {
        let tx = self.conn.begin().await?;
        Ok(Store {
            conn: tx,
            clock: self.clock.clone(),
        })
    }

    pub(crate) fn conn(&self) -> &C {
        &self.conn
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl Store<DatabaseTransaction> {
    /// Commits when `result` is `Ok`, rolls back otherwise, and hands the
    /// result back. A failed commit turns an `Ok` into an error.
    pub async fn done<T, E>(self, result: Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        match result {
            Ok(value) => {
                self.conn
                    .commit()
                    .await
                    .map_err(|e| E::from(StoreError::from(e)))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.conn.rollback().await {
                    tracing::warn!(error = %rollback_err, "Failed to roll back transaction");
                }
                Err(err)
            }
        }
    }
}

/// Name a repo is renamed to when soft-deleted, freeing its unique name.
pub(crate) fn soft_deleted_name(name: &str, now: DateTime<Utc>) -> String {
    format!(
        "DELETED-{}.{:06}-{}",
        now.timestamp(),
        now.timestamp_subsec_micros(),
        name
    )
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

pub(crate) fn repo_from_model(
    model: repo::Model,
    sources: impl IntoIterator<Item = SourceInfo>,
) -> Repo {
    Repo {
        id: RepoId(model.id),
        name: model.name,
        uri: model.uri,
        description: model.description,
        external_repo: ExternalRepoSpec {
            id: model.external_id.unwrap_or_default(),
            service_type: model.external_service_type.unwrap_or_default(),
            service_id: model.external_service_id.unwrap_or_default(),
        },
        archived: model.archived,
        fork: model.fork,
        private: model.private,
        stars: model.stars,
        metadata: model.metadata,
        sources: sources
            .into_iter()
            .map(|info| (info.id.clone(), info))
            .collect(),
        created_at: Some(model.created_at.with_timezone(&Utc)),
        updated_at: Some(model.updated_at.with_timezone(&Utc)),
        deleted_at: model.deleted_at.map(|at| at.with_timezone(&Utc)),
    }
}

impl From<external_service::Model> for ExternalService {
    fn from(model: external_service::Model) -> Self {
        Self {
            id: model.id,
            kind: model.kind,
            display_name: model.display_name,
            config: model.config,
            namespace_user_id: model.namespace_user_id,
            namespace_org_id: model.namespace_org_id,
            last_sync_at: model.last_sync_at.map(|at| at.with_timezone(&Utc)),
            next_sync_at: model.next_sync_at.map(|at| at.with_timezone(&Utc)),
            created_at: model.created_at.with_timezone(&Utc),
            updated_at: model.updated_at.with_timezone(&Utc),
            deleted_at: model.deleted_at.map(|at| at.with_timezone(&Utc)),
        }
    }
}
