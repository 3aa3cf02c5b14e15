//! # Data Models
//!
//! SeaORM entities backing the repo store, plus small response types shared
//! by the HTTP handlers.

use serde::{Deserialize, Serialize};

pub mod external_service;
pub mod external_service_repo;
pub mod repo;
pub mod sync_job;

pub use external_service::Entity as ExternalService;
pub use external_service_repo::Entity as ExternalServiceRepo;
pub use repo::Entity as Repo;
pub use sync_job::Entity as SyncJob;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "reposync".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
