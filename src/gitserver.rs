//! # Repo Fetch Client
//!
//! The remote "fetch/update this repo" RPC the update scheduler calls for
//! every dispatched repo, and its HTTP implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

/// Outcome of a fetch as reported by the git server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoUpdateResponse {
    /// When the repo was last fetched from its code host
    #[serde(default)]
    pub last_fetched: Option<DateTime<Utc>>,
    /// When the fetched contents last changed
    #[serde(default)]
    pub last_changed: Option<DateTime<Utc>>,
    /// Non-empty when the fetch itself failed on the server side
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Serialize)]
struct RepoUpdateRequest<'a> {
    repo: &'a str,
    since_seconds: u64,
}

#[derive(Debug, Error)]
pub enum GitserverError {
    #[error("Rate limited by git server (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Git server request failed with status {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid git server URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl GitserverError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// Requests a fetch of one repo.
#[async_trait]
pub trait RepoUpdater: Send + Sync {
    /// `since` hints that a fetch newer than this age is good enough.
    async fn request_repo_update(
        &self,
        repo: &str,
        since: Duration,
    ) -> Result<RepoUpdateResponse, GitserverError>;
}

/// HTTP client for the git server's `repo-update` endpoint.
#[derive(Debug, Clone)]
pub struct GitserverClient {
    http: Client,
    endpoint: Url,
}

impl GitserverClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GitserverError> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base.join("repo-update")?;
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl RepoUpdater for GitserverClient {
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn request_repo_update(
        &self,
        repo: &str,
        since: Duration,
    ) -> Result<RepoUpdateResponse, GitserverError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&RepoUpdateRequest {
                repo,
                since_seconds: since.as_secs(),
            })
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            debug!(?retry_after, "Git server rate limited repo update");
            return Err(GitserverError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GitserverError::Http {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}
