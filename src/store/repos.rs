//! Repo and external-service-repo operations.

use std::collections::{BTreeMap, HashSet};

use sea_orm::sea_query::{OnConflict, Query};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait, Unchanged,
};
use tracing::{debug, instrument};

use super::{Store, StoreError, non_empty, repo_from_model, soft_deleted_name};
use crate::models::{external_service, external_service_repo, repo};
use crate::types::{ExternalRepoSpec, ExternalService, ExternalServiceId, Repo, RepoId, SourceInfo};

/// Filters for [`Store::list_repos`]. Criteria are AND-ed unless `use_or`
/// is set. No criteria lists every repo.
#[derive(Debug, Clone, Default)]
pub struct ListReposOptions {
    pub names: Vec<String>,
    pub external_repos: Vec<ExternalRepoSpec>,
    pub ids: Vec<RepoId>,
    pub external_service_ids: Vec<ExternalServiceId>,
    pub use_or: bool,
    pub include_deleted: bool,
}

/// Outcome of unlinking repos from an external service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnlinkedRepos {
    /// Repos whose link to the service was removed
    pub unlinked: Vec<RepoId>,
    /// Subset of `unlinked` left without any service and soft-deleted
    pub deleted: Vec<RepoId>,
}

impl ListReposOptions {
    fn condition(&self) -> Condition {
        let mut criteria = if self.use_or {
            Condition::any()
        } else {
            Condition::all()
        };
        let mut has_criteria = false;

        if !self.names.is_empty() {
            criteria = criteria.add(repo::Column::Name.is_in(self.names.iter().cloned()));
            has_criteria = true;
        }
        if !self.external_repos.is_empty() {
            let mut specs = Condition::any();
            for spec in &self.external_repos {
                specs = specs.add(
                    Condition::all()
                        .add(repo::Column::ExternalServiceType.eq(spec.service_type.clone()))
                        .add(repo::Column::ExternalServiceId.eq(spec.service_id.clone()))
                        .add(repo::Column::ExternalId.eq(spec.id.clone())),
                );
            }
            criteria = criteria.add(specs);
            has_criteria = true;
        }
        if !self.ids.is_empty() {
            criteria = criteria.add(repo::Column::Id.is_in(self.ids.iter().map(|id| id.0)));
            has_criteria = true;
        }
        if !self.external_service_ids.is_empty() {
            criteria = criteria.add(
                repo::Column::Id.in_subquery(
                    Query::select()
                        .column(external_service_repo::Column::RepoId)
                        .from(external_service_repo::Entity)
                        .and_where(
                            external_service_repo::Column::ExternalServiceId
                                .is_in(self.external_service_ids.iter().copied()),
                        )
                        .to_owned(),
                ),
            );
            has_criteria = true;
        }

        let mut condition = Condition::all();
        if has_criteria {
            condition = condition.add(criteria);
        }
        if !self.include_deleted {
            condition = condition.add(repo::Column::DeletedAt.is_null());
        }
        condition
    }
}

impl<C> Store<C>
where
    C: ConnectionTrait + TransactionTrait,
{
    /// Lists repos with their sources, ordered by id.
    pub async fn list_repos(&self, opts: &ListReposOptions) -> Result<Vec<Repo>, StoreError> {
        let models = repo::Entity::find()
            .filter(opts.condition())
            .order_by_asc(repo::Column::Id)
            .all(self.conn())
            .await?;

        if models.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i32> = models.iter().map(|m| m.id).collect();
        let links = external_service_repo::Entity::find()
            .filter(external_service_repo::Column::RepoId.is_in(ids))
            .find_also_related(external_service::Entity)
            .all(self.conn())
            .await?;

        let mut sources: BTreeMap<i32, Vec<SourceInfo>> = BTreeMap::new();
        for (link, svc) in links {
            let Some(svc) = svc else { continue };
            sources.entry(link.repo_id).or_default().push(SourceInfo {
                id: ExternalService::from(svc).urn(),
                clone_url: link.clone_url,
            });
        }

        Ok(models
            .into_iter()
            .map(|model| {
                let repo_sources = sources.remove(&model.id).unwrap_or_default();
                repo_from_model(model, repo_sources)
            })
            .collect())
    }

    pub async fn get_repo(&self, id: RepoId) -> Result<Option<Repo>, StoreError> {
        let opts = ListReposOptions {
            ids: vec![id],
            ..Default::default()
        };
        Ok(self.list_repos(&opts).await?.into_iter().next())
    }

    pub async fn get_repo_by_name(&self, name: &str) -> Result<Option<Repo>, StoreError> {
        let opts = ListReposOptions {
            names: vec![name.to_string()],
            ..Default::default()
        };
        Ok(self.list_repos(&opts).await?.into_iter().next())
    }

    /// Number of non-deleted private repos, checked against the license quota.
    pub async fn count_private_repos(&self) -> Result<u64, StoreError> {
        let count = repo::Entity::find()
            .filter(repo::Column::Private.eq(true))
            .filter(repo::Column::DeletedAt.is_null())
            .count(self.conn())
            .await?;
        Ok(count)
    }

    /// Soft-deletes repos: renames them out of the way of the unique name
    /// constraint, stamps `deleted_at` and drops every service link.
    #[instrument(skip(self))]
    pub async fn delete_repos(&self, ids: &[RepoId]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = self.now();
        let raw: Vec<i32> = ids.iter().map(|id| id.0).collect();

        let live = repo::Entity::find()
            .filter(repo::Column::Id.is_in(raw.clone()))
            .filter(repo::Column::DeletedAt.is_null())
            .all(self.conn())
            .await?;
        for model in live {
            let name = soft_deleted_name(&model.name, now);
            repo::ActiveModel {
                id: Unchanged(model.id),
                name: Set(name),
                deleted_at: Set(Some(now.fixed_offset())),
                ..Default::default()
            }
            .update(self.conn())
            .await?;
        }

        external_service_repo::Entity::delete_many()
            .filter(external_service_repo::Column::RepoId.is_in(raw))
            .exec(self.conn())
            .await?;

        debug!(count = ids.len(), "Soft-deleted repos");
        Ok(())
    }

    /// Inserts a new repo and links it to `svc`. Sets the id and timestamps
    /// on `repo`.
    #[instrument(skip(self, svc, repo), fields(external_service_id = svc.id, repo = %repo.name))]
    pub async fn create_external_service_repo(
        &self,
        svc: &ExternalService,
        repo: &mut Repo,
    ) -> Result<(), StoreError> {
        let clone_url = source_clone_url(svc, repo)?;
        let now = self.now();

        let model = repo::ActiveModel {
            name: Set(repo.name.clone()),
            uri: Set(repo.uri.clone()),
            description: Set(repo.description.clone()),
            external_service_type: Set(non_empty(&repo.external_repo.service_type)),
            external_service_id: Set(non_empty(&repo.external_repo.service_id)),
            external_id: Set(non_empty(&repo.external_repo.id)),
            archived: Set(repo.archived),
            fork: Set(repo.fork),
            private: Set(repo.private),
            stars: Set(repo.stars),
            metadata: Set(repo.metadata.clone()),
            created_at: Set(now.fixed_offset()),
            updated_at: Set(now.fixed_offset()),
            deleted_at: Set(None),
            ..Default::default()
        }
        .insert(self.conn())
        .await?;

        repo.id = RepoId(model.id);
        repo.created_at = Some(now);
        repo.updated_at = Some(now);
        repo.deleted_at = None;

        self.upsert_external_service_repo(svc, repo.id, clone_url)
            .await
    }

    /// Writes every field of a stored repo, clears `deleted_at` and refreshes
    /// its link to `svc`.
    #[instrument(skip(self, svc, repo), fields(external_service_id = svc.id, repo = %repo.name))]
    pub async fn update_external_service_repo(
        &self,
        svc: &ExternalService,
        repo: &mut Repo,
    ) -> Result<(), StoreError> {
        if repo.id.is_zero() {
            return Err(StoreError::MissingId("update_external_service_repo"));
        }
        let clone_url = source_clone_url(svc, repo)?;
        let now = self.now();

        repo::ActiveModel {
            id: Unchanged(repo.id.0),
            name: Set(repo.name.clone()),
            uri: Set(repo.uri.clone()),
            description: Set(repo.description.clone()),
            external_service_type: Set(non_empty(&repo.external_repo.service_type)),
            external_service_id: Set(non_empty(&repo.external_repo.service_id)),
            external_id: Set(non_empty(&repo.external_repo.id)),
            archived: Set(repo.archived),
            fork: Set(repo.fork),
            private: Set(repo.private),
            stars: Set(repo.stars),
            metadata: Set(repo.metadata.clone()),
            updated_at: Set(now.fixed_offset()),
            deleted_at: Set(None),
            ..Default::default()
        }
        .update(self.conn())
        .await?;

        repo.updated_at = Some(now);
        repo.deleted_at = None;

        self.upsert_external_service_repo(svc, repo.id, clone_url)
            .await
    }

    async fn upsert_external_service_repo(
        &self,
        svc: &ExternalService,
        repo_id: RepoId,
        clone_url: String,
    ) -> Result<(), StoreError> {
        let link = external_service_repo::ActiveModel {
            external_service_id: Set(svc.id),
            repo_id: Set(repo_id.0),
            clone_url: Set(clone_url),
            user_id: Set(svc.namespace_user_id),
            org_id: Set(svc.namespace_org_id),
            created_at: Set(self.now().fixed_offset()),
        };

        external_service_repo::Entity::insert(link)
            .on_conflict(
                OnConflict::columns([
                    external_service_repo::Column::ExternalServiceId,
                    external_service_repo::Column::RepoId,
                ])
                .update_columns([
                    external_service_repo::Column::CloneUrl,
                    external_service_repo::Column::UserId,
                    external_service_repo::Column::OrgId,
                ])
                .to_owned(),
            )
            .exec_without_returning(self.conn())
            .await?;
        Ok(())
    }

    /// Unlinks one repo from `svc`. Returns true when the repo was left
    /// without any service and got soft-deleted.
    pub async fn delete_external_service_repo(
        &self,
        svc: &ExternalService,
        repo_id: RepoId,
    ) -> Result<bool, StoreError> {
        external_service_repo::Entity::delete_many()
            .filter(external_service_repo::Column::ExternalServiceId.eq(svc.id))
            .filter(external_service_repo::Column::RepoId.eq(repo_id.0))
            .exec(self.conn())
            .await?;

        let remaining = external_service_repo::Entity::find()
            .filter(external_service_repo::Column::RepoId.eq(repo_id.0))
            .count(self.conn())
            .await?;
        if remaining > 0 {
            return Ok(false);
        }

        let Some(model) = repo::Entity::find_by_id(repo_id.0)
            .filter(repo::Column::DeletedAt.is_null())
            .one(self.conn())
            .await?
        else {
            return Ok(false);
        };

        let now = self.now();
        let name = soft_deleted_name(&model.name, now);
        repo::ActiveModel {
            id: Unchanged(model.id),
            name: Set(name),
            deleted_at: Set(Some(now.fixed_offset())),
            ..Default::default()
        }
        .update(self.conn())
        .await?;
        Ok(true)
    }

    /// Unlinks every repo of `svc` whose id is not in `keep`, soft-deleting
    /// the ones no other service still yields.
    #[instrument(skip(self, svc, keep), fields(external_service_id = svc.id, keep = keep.len()))]
    pub async fn delete_external_service_repos_not_in(
        &self,
        svc: &ExternalService,
        keep: &HashSet<RepoId>,
    ) -> Result<UnlinkedRepos, StoreError> {
        let links = external_service_repo::Entity::find()
            .filter(external_service_repo::Column::ExternalServiceId.eq(svc.id))
            .order_by_asc(external_service_repo::Column::RepoId)
            .all(self.conn())
            .await?;

        let mut out = UnlinkedRepos::default();
        for link in links {
            let id = RepoId(link.repo_id);
            if keep.contains(&id) {
                continue;
            }
            if self.delete_external_service_repo(svc, id).await? {
                out.deleted.push(id);
            }
            out.unlinked.push(id);
        }

        debug!(
            unlinked = out.unlinked.len(),
            deleted = out.deleted.len(),
            "Unlinked repos not seen in sync"
        );
        Ok(out)
    }
}

fn source_clone_url(svc: &ExternalService, repo: &Repo) -> Result<String, StoreError> {
    let urn = svc.urn();
    match repo.sources.get(&urn) {
        Some(info) if !info.clone_url.is_empty() => Ok(info.clone_url.clone()),
        _ => Err(StoreError::MissingSource {
            repo: repo.name.clone(),
            urn,
        }),
    }
}
