//! Source for plain git hosts: a base URL plus a fixed list of repo paths.
//!
//! ```json
//! { "url": "https://git.example.com", "repos": ["team/api", "team/web.git"] }
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use url::Url;

use super::{Source, SourceError, SourceResult};
use crate::types::{ExternalRepoSpec, ExternalService, Repo, SourceInfo};

/// External service type recorded on repos yielded by this source.
pub const SERVICE_TYPE_OTHER: &str = "other";

#[derive(Debug, Clone, Deserialize)]
pub struct OtherConfig {
    pub url: String,
    #[serde(default)]
    pub repos: Vec<String>,
}

pub struct OtherSource {
    svc: ExternalService,
    base: Url,
    repos: Vec<String>,
}

impl OtherSource {
    pub fn new(svc: ExternalService) -> Result<Self, SourceError> {
        let config: OtherConfig = serde_json::from_value(svc.config.clone())
            .map_err(|e| SourceError::other(format!("invalid config: {e}")))?;

        let mut base = Url::parse(&config.url)
            .map_err(|e| SourceError::other(format!("invalid url {}: {e}", config.url)))?;
        if base.host_str().is_none() {
            return Err(SourceError::other(format!("url {} has no host", config.url)));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        Ok(Self {
            svc,
            base,
            repos: config.repos,
        })
    }

    fn repo_for(&self, path: &str) -> Result<Repo, SourceError> {
        let clone_url = self
            .base
            .join(path.trim_start_matches('/'))
            .map_err(|e| SourceError::other(format!("invalid repo path {path}: {e}")))?;

        let host = clone_url.host_str().unwrap_or_default();
        let repo_path = clone_url.path().trim_matches('/');
        let repo_path = repo_path.strip_suffix(".git").unwrap_or(repo_path);
        let name = format!("{host}/{repo_path}");

        let urn = self.svc.urn();
        let mut repo = Repo {
            name: name.clone(),
            uri: name.clone(),
            external_repo: ExternalRepoSpec {
                id: name,
                service_type: SERVICE_TYPE_OTHER.to_string(),
                service_id: self.base.to_string(),
            },
            ..Default::default()
        };
        repo.sources.insert(
            urn.clone(),
            SourceInfo {
                id: urn,
                clone_url: clone_url.to_string(),
            },
        );
        Ok(repo)
    }
}

#[async_trait]
impl Source for OtherSource {
    async fn list_repos(&self, results: mpsc::Sender<SourceResult>) {
        for path in &self.repos {
            if results.send(self.repo_for(path)).await.is_err() {
                tracing::debug!(external_service_id = self.svc.id, "Repo listing receiver closed");
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
        for path in &self.repos {
            if let Ok(repo) = self.repo_for(path)
                && repo.name == name
            {
                return Ok(repo);
            }
        }
        Err(SourceError::not_found(format!("repo {name} not listed")))
    }
}
