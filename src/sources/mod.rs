//! Sources
//!
//! A [`Source`] lists the repos one external service yields. Sources stream
//! their results over a channel so the syncer can reconcile repos while the
//! code host is still being paged through. [`Sourcer`] builds the source for
//! a given external service based on its kind.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::{ExternalService, KIND_OTHER, Repo};

pub mod other;

pub use other::OtherSource;

/// One item of a [`Source::list_repos`] stream.
pub type SourceResult = Result<Repo, SourceError>;

/// Error categories a source can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceErrorKind {
    /// Credentials rejected
    Unauthorized,
    /// Credentials valid but access denied
    Forbidden,
    /// Code-host account suspended
    AccountSuspended,
    RateLimited,
    NotFound,
    /// Kind or operation not supported
    Unsupported,
    Other,
}

/// Structured error reported by a source.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SourceError {
    pub kind: SourceErrorKind,
    pub message: String,
    /// Warnings are reported but never abort a sync pass
    pub warning: bool,
}

impl SourceError {
    pub fn new<S: Into<String>>(kind: SourceErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            warning: false,
        }
    }

    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        Self::new(SourceErrorKind::Unauthorized, message)
    }

    pub fn forbidden<S: Into<String>>(message: S) -> Self {
        Self::new(SourceErrorKind::Forbidden, message)
    }

    pub fn account_suspended<S: Into<String>>(message: S) -> Self {
        Self::new(SourceErrorKind::AccountSuspended, message)
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(SourceErrorKind::NotFound, message)
    }

    pub fn unsupported<S: Into<String>>(message: S) -> Self {
        Self::new(SourceErrorKind::Unsupported, message)
    }

    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::new(SourceErrorKind::Other, message)
    }

    /// Downgrades the error to a warning.
    pub fn as_warning(mut self) -> Self {
        self.warning = true;
        self
    }

    /// The code host revoked access: nothing it yielded can be trusted.
    pub fn is_fatal(&self) -> bool {
        !self.warning
            && matches!(
                self.kind,
                SourceErrorKind::Unauthorized
                    | SourceErrorKind::Forbidden
                    | SourceErrorKind::AccountSuspended
            )
    }

    /// A warning caused by missing access to part of what the service
    /// lists. Repos not yielded because of it are still safe to unlink.
    pub fn is_access_warning(&self) -> bool {
        self.warning
            && matches!(
                self.kind,
                SourceErrorKind::Unauthorized | SourceErrorKind::Forbidden
            )
    }

    pub fn is_auth(&self) -> bool {
        matches!(
            self.kind,
            SourceErrorKind::Unauthorized
                | SourceErrorKind::Forbidden
                | SourceErrorKind::AccountSuspended
        )
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == SourceErrorKind::NotFound
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.warning {
            write!(f, "warning: ")?;
        }
        match self.kind {
            SourceErrorKind::Unauthorized => write!(f, "Unauthorized")?,
            SourceErrorKind::Forbidden => write!(f, "Forbidden")?,
            SourceErrorKind::AccountSuspended => write!(f, "Account suspended")?,
            SourceErrorKind::RateLimited => write!(f, "Rate limited")?,
            SourceErrorKind::NotFound => write!(f, "Not found")?,
            SourceErrorKind::Unsupported => write!(f, "Unsupported")?,
            SourceErrorKind::Other => write!(f, "Source error")?,
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for SourceError {}

/// Lists repos of one or more external services of the same kind.
#[async_trait]
pub trait Source: Send + Sync {
    /// Streams every repo the service yields. Dropping `results` ends the
    /// stream; a closed receiver means the consumer stopped listening.
    async fn list_repos(&self, results: mpsc::Sender<SourceResult>);

    /// Verifies the code host is reachable with the configured credentials.
    async fn check_connection(&self) -> Result<(), SourceError>;

    fn external_services(&self) -> Vec<ExternalService>;

    /// Looks up a single repo by name.
    async fn get_repo(&self, name: &str) -> Result<Repo, SourceError> {
        Err(SourceError::unsupported(format!(
            "looking up {name} by name is not supported"
        )))
    }
}

/// Builds the [`Source`] for an external service.
pub trait Sourcer: Send + Sync {
    fn source(&self, svc: &ExternalService) -> Result<Arc<dyn Source>, SourceError>;
}

/// Sourcer covering the kinds this service knows how to list.
#[derive(Debug, Clone, Default)]
pub struct DefaultSourcer;

impl Sourcer for DefaultSourcer {
    fn source(&self, svc: &ExternalService) -> Result<Arc<dyn Source>, SourceError> {
        if svc.kind.eq_ignore_ascii_case(KIND_OTHER) {
            Ok(Arc::new(OtherSource::new(svc.clone())?))
        } else {
            Err(SourceError::unsupported(format!(
                "external service kind {} has no source",
                svc.kind
            )))
        }
    }
}
